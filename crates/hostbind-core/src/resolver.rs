//! Per-call ownership resolution.
//!
//! Resolution runs in two passes under the registry lock. Planning is
//! read-only: it decides a disposition for every value, checks transfers,
//! singleton identity and custodian cycles. Applying a plan takes every native
//! reference it needs before touching the registry; if a native call fails,
//! the references already taken are returned and the registry is left as it
//! was.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::config::TransferPolicy;
use crate::descriptor::{CallDescriptor, CallKind, Direction, OwnershipMode, ValueDescriptor};
use crate::error::{InvariantViolation, Result};
use crate::graph;
use crate::handle::{NativeHandle, ProxyRef};
use crate::native::NativeRuntime;
use crate::refcount::RefcountAdapter;
use crate::registry::{Proxy, ProxyRegistry};
use crate::table::{DescriptorTable, TypeIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    NoWrap,
    BorrowExistingProxy,
    CreateBorrowedProxy,
    CreateOwnedProxy,
    /// `incref` is false when the crossing already handed the host a reference.
    CreateRefcountedProxy { incref: bool },
    TransferToNative,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::NoWrap => f.write_str("NO_WRAP"),
            Disposition::BorrowExistingProxy => f.write_str("BORROW_EXISTING_PROXY"),
            Disposition::CreateBorrowedProxy => f.write_str("CREATE_BORROWED_PROXY"),
            Disposition::CreateOwnedProxy => f.write_str("CREATE_OWNED_PROXY"),
            Disposition::CreateRefcountedProxy { incref: true } => {
                f.write_str("CREATE_REFCOUNTED_PROXY(+incref)")
            }
            Disposition::CreateRefcountedProxy { incref: false } => {
                f.write_str("CREATE_REFCOUNTED_PROXY")
            }
            Disposition::TransferToNative => f.write_str("TRANSFER_TO_NATIVE"),
        }
    }
}

/// Where a value crosses the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    Receiver,
    /// 1-based.
    Param(u16),
    Return,
}

impl Position {
    /// Custodian index of this position: 0 = receiver, k = parameter, -1 = return.
    pub fn index(self) -> i32 {
        match self {
            Position::Receiver => 0,
            Position::Param(k) => i32::from(k),
            Position::Return => -1,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Receiver => f.write_str("self"),
            Position::Param(k) => write!(f, "arg{k}"),
            Position::Return => f.write_str("return"),
        }
    }
}

impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What the trampoline observed for one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgFact {
    Null,
    /// A value that is not a wrapped object.
    Plain,
    /// The host passed an existing proxy.
    Proxy(ProxyRef),
    /// Native code produced (or was given) a raw handle.
    Handle(NativeHandle),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallFacts {
    pub receiver: Option<ProxyRef>,
    pub args: Vec<ArgFact>,
    pub ret: Option<ArgFact>,
}

impl CallFacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receiver(mut self, r: ProxyRef) -> Self {
        self.receiver = Some(r);
        self
    }

    pub fn arg(mut self, fact: ArgFact) -> Self {
        self.args.push(fact);
        self
    }

    pub fn returns(mut self, fact: ArgFact) -> Self {
        self.ret = Some(fact);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedValue {
    pub position: Position,
    pub disposition: Disposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<NativeHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallResolution {
    pub call: String,
    pub values: Vec<ResolvedValue>,
    /// `(ward, custodian)` edges registered by this call.
    pub edges: Vec<(ProxyRef, ProxyRef)>,
}

impl CallResolution {
    pub fn value(&self, position: Position) -> Option<&ResolvedValue> {
        self.values.iter().find(|v| v.position == position)
    }

    pub fn disposition(&self, position: Position) -> Option<Disposition> {
        self.value(position).map(|v| v.disposition)
    }

    pub fn proxy(&self, position: Position) -> Option<ProxyRef> {
        self.value(position).and_then(|v| v.proxy)
    }

    pub fn ret(&self) -> Option<ProxyRef> {
        self.proxy(Position::Return)
    }

    pub fn dispositions(&self) -> Vec<Disposition> {
        self.values.iter().map(|v| v.disposition).collect()
    }
}

/// A proxy in the plan: already registered, or the n-th proxy this call creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Node {
    Existing(ProxyRef),
    New(usize),
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Skip,
    Borrow {
        node: Node,
        incref: bool,
        add_hold: bool,
    },
    Create {
        type_index: TypeIndex,
        handle: NativeHandle,
        mode: OwnershipMode,
        singleton: bool,
        incref: bool,
    },
    Transfer {
        proxy: ProxyRef,
    },
}

#[derive(Debug)]
struct Step {
    position: Position,
    disposition: Disposition,
    handle: Option<NativeHandle>,
    node: Option<Node>,
    action: Action,
}

#[derive(Default)]
struct Plan {
    steps: Vec<Step>,
    /// Proxies this call creates, indexed by `Node::New`.
    news: Vec<(TypeIndex, NativeHandle, OwnershipMode)>,
    /// Proxies this call will create, by key, so duplicates share one proxy.
    pending: HashMap<(TypeIndex, NativeHandle), (usize, OwnershipMode)>,
    pending_singletons: HashMap<TypeIndex, (usize, NativeHandle)>,
    transfers: HashSet<(TypeIndex, NativeHandle)>,
    edges: Vec<(Node, Node)>,
}

impl Plan {
    fn create(
        &mut self,
        type_index: TypeIndex,
        handle: NativeHandle,
        mode: OwnershipMode,
        singleton: bool,
        incref: bool,
    ) -> (Disposition, Node, Action) {
        let slot = self.news.len();
        self.news.push((type_index, handle, mode));
        self.pending.insert((type_index, handle), (slot, mode));
        if singleton {
            self.pending_singletons.insert(type_index, (slot, handle));
        }
        let disposition = match mode {
            OwnershipMode::Owned => Disposition::CreateOwnedProxy,
            OwnershipMode::Borrowed => Disposition::CreateBorrowedProxy,
            OwnershipMode::RefCounted => Disposition::CreateRefcountedProxy { incref },
        };
        let action = Action::Create {
            type_index,
            handle,
            mode,
            singleton,
            incref,
        };
        (disposition, Node::New(slot), action)
    }
}

fn borrow(node: Node, incref: bool, add_hold: bool) -> (Disposition, Node, Action) {
    (
        Disposition::BorrowExistingProxy,
        node,
        Action::Borrow {
            node,
            incref,
            add_hold,
        },
    )
}

pub(crate) struct Resolver<'a, N> {
    table: &'a DescriptorTable,
    adapter: RefcountAdapter<'a, N>,
    policy: TransferPolicy,
}

impl<'a, N: NativeRuntime> Resolver<'a, N> {
    pub fn new(
        table: &'a DescriptorTable,
        adapter: RefcountAdapter<'a, N>,
        policy: TransferPolicy,
    ) -> Self {
        Self {
            table,
            adapter,
            policy,
        }
    }

    pub fn resolve(
        &self,
        reg: &mut ProxyRegistry,
        call: &CallDescriptor,
        facts: &CallFacts,
    ) -> Result<CallResolution> {
        let plan = self.plan(reg, call, facts)?;
        self.apply(reg, call.label(), plan)
    }

    fn mismatch(call: &CallDescriptor, message: String) -> InvariantViolation {
        InvariantViolation::FactMismatch {
            call: call.label(),
            message,
        }
    }

    fn plan(
        &self,
        reg: &ProxyRegistry,
        call: &CallDescriptor,
        facts: &CallFacts,
    ) -> Result<Plan> {
        let mut plan = Plan::default();

        match (call.kind, facts.receiver) {
            (CallKind::Method, Some(r)) => {
                let p = reg.get(r)?;
                if p.type_name != call.owner {
                    return Err(Self::mismatch(
                        call,
                        format!("receiver is a {}, expected {}", p.type_name, call.owner),
                    )
                    .into());
                }
                plan.steps.push(Step {
                    position: Position::Receiver,
                    disposition: Disposition::BorrowExistingProxy,
                    handle: Some(p.handle),
                    node: Some(Node::Existing(r)),
                    action: Action::Skip,
                });
            }
            (CallKind::Method, None) => {
                return Err(Self::mismatch(call, "method called without a receiver".into()).into())
            }
            (_, Some(_)) => {
                return Err(Self::mismatch(call, "only methods take a receiver".into()).into())
            }
            (_, None) => {}
        }

        if facts.args.len() != call.params.len() {
            return Err(Self::mismatch(
                call,
                format!(
                    "expected {} arguments, got {}",
                    call.params.len(),
                    facts.args.len()
                ),
            )
            .into());
        }
        for (i, (desc, fact)) in call.params.iter().zip(&facts.args).enumerate() {
            let position = Position::Param((i + 1) as u16);
            self.plan_value(reg, call, &mut plan, position, desc, *fact)?;
        }
        if let Some(desc) = &call.ret {
            let fact = facts.ret.unwrap_or(ArgFact::Null);
            self.plan_value(reg, call, &mut plan, Position::Return, desc, fact)?;
        }

        self.plan_edges(reg, call, &mut plan)?;
        Ok(plan)
    }

    fn plan_value(
        &self,
        reg: &ProxyRegistry,
        call: &CallDescriptor,
        plan: &mut Plan,
        position: Position,
        desc: &ValueDescriptor,
        fact: ArgFact,
    ) -> Result<()> {
        let no_wrap = Step {
            position,
            disposition: Disposition::NoWrap,
            handle: None,
            node: None,
            action: Action::Skip,
        };
        let Some(type_name) = desc.type_name.as_deref() else {
            plan.steps.push(no_wrap);
            return Ok(());
        };
        let type_index = self
            .table
            .type_index(type_name)
            .ok_or_else(|| InvariantViolation::UnknownType(type_name.to_string()))?;
        let td = self.table.type_at(type_index);
        let is_return = position == Position::Return;
        let ctor_return = is_return && call.kind == CallKind::Constructor;

        let (handle, found, outbound) = match fact {
            ArgFact::Null => {
                plan.steps.push(no_wrap);
                return Ok(());
            }
            ArgFact::Handle(h) if h.is_null() => {
                plan.steps.push(no_wrap);
                return Ok(());
            }
            ArgFact::Plain => {
                return Err(Self::mismatch(
                    call,
                    format!("{position} expects a {type_name}, got a plain value"),
                )
                .into())
            }
            ArgFact::Proxy(r) => {
                if is_return || desc.direction == Direction::Out {
                    return Err(Self::mismatch(
                        call,
                        format!("{position} is outbound and must arrive as a native handle"),
                    )
                    .into());
                }
                let p = match reg.get(r) {
                    Ok(p) => p,
                    Err(err) => {
                        return Err(match reg.was_transferred(r) {
                            Some(handle) if desc.transfer_ownership => {
                                InvariantViolation::DoubleTransfer {
                                    type_name: type_name.to_string(),
                                    handle,
                                }
                            }
                            _ => err,
                        }
                        .into())
                    }
                };
                if p.type_index != type_index {
                    return Err(Self::mismatch(
                        call,
                        format!("{position} expects a {type_name}, got a {}", p.type_name),
                    )
                    .into());
                }
                (p.handle, Some(Node::Existing(r)), false)
            }
            ArgFact::Handle(h) => {
                let found = match plan.pending.get(&(type_index, h)) {
                    Some((slot, _)) => Some(Node::New(*slot)),
                    None => reg.lookup(type_index, h).map(Node::Existing),
                };
                (h, found, is_return || desc.direction.is_outbound())
            }
        };
        let key = (type_index, handle);

        let (disposition, node, action) = if td.is_singleton {
            let current = match plan.pending_singletons.get(&type_index) {
                Some((slot, h)) => Some((Node::New(*slot), *h)),
                None => match reg.singleton(type_index) {
                    Some(r) => Some((Node::Existing(r), reg.get(r)?.handle)),
                    None => None,
                },
            };
            match current {
                Some((node, existing)) if existing == handle || ctor_return => {
                    borrow(node, false, false)
                }
                Some((_, existing)) => {
                    return Err(InvariantViolation::SingletonConflict {
                        type_name: type_name.to_string(),
                        existing,
                        requested: handle,
                    }
                    .into())
                }
                None => plan.create(type_index, handle, OwnershipMode::Borrowed, true, false),
            }
        } else if td.ownership_mode == OwnershipMode::RefCounted {
            // Aliases of refcounted objects take a counted reference too; the
            // custodian edge is added below either way.
            let gives = outbound
                && !desc.aliases_existing()
                && (desc.hands_over() || ctor_return);
            let hands = !outbound && desc.transfer_ownership;
            match found {
                Some(node) if outbound => borrow(node, !gives, true),
                Some(node) if hands => borrow(node, true, false),
                Some(node) => borrow(node, false, false),
                None if outbound => {
                    plan.create(type_index, handle, OwnershipMode::RefCounted, false, !gives)
                }
                None => {
                    if hands {
                        return Err(InvariantViolation::TransferWithoutOwnership {
                            type_name: type_name.to_string(),
                            handle,
                        }
                        .into());
                    }
                    // A raw inbound handle: the host takes its own reference.
                    plan.create(type_index, handle, OwnershipMode::RefCounted, false, true)
                }
            }
        } else if desc.aliases_existing() {
            match found {
                Some(node) => borrow(node, false, false),
                None => plan.create(type_index, handle, OwnershipMode::Borrowed, false, false),
            }
        } else if outbound
            && td.ownership_mode == OwnershipMode::Owned
            && (desc.hands_over() || ctor_return)
        {
            match plan.pending.get(&key) {
                Some((slot, OwnershipMode::Owned)) => borrow(Node::New(*slot), false, false),
                _ => {
                    if let Some(owner) = reg.owner_of(type_index, handle) {
                        return Err(InvariantViolation::DoubleOwnership {
                            type_name: type_name.to_string(),
                            handle,
                            proxy: owner,
                        }
                        .into());
                    }
                    plan.create(type_index, handle, OwnershipMode::Owned, false, false)
                }
            }
        } else if !outbound && desc.transfer_ownership {
            if reg.is_transferred(type_index, handle) || !plan.transfers.insert(key) {
                return Err(InvariantViolation::DoubleTransfer {
                    type_name: type_name.to_string(),
                    handle,
                }
                .into());
            }
            let owned = match found {
                Some(Node::Existing(r)) => {
                    (reg.get(r)?.mode == OwnershipMode::Owned).then_some(r)
                }
                _ => None,
            };
            let Some(proxy) = owned else {
                return Err(InvariantViolation::TransferWithoutOwnership {
                    type_name: type_name.to_string(),
                    handle,
                }
                .into());
            };
            plan.steps.push(Step {
                position,
                disposition: Disposition::TransferToNative,
                handle: Some(handle),
                node: None,
                action: Action::Transfer { proxy },
            });
            return Ok(());
        } else {
            match found {
                Some(node) => borrow(node, false, false),
                None => plan.create(type_index, handle, OwnershipMode::Borrowed, false, false),
            }
        };

        plan.steps.push(Step {
            position,
            disposition,
            handle: Some(handle),
            node: Some(node),
            action,
        });
        Ok(())
    }

    fn node_at(call: &CallDescriptor, plan: &Plan, index: i32) -> Option<Node> {
        let position = match index {
            0 if call.kind == CallKind::Constructor => Position::Return,
            0 => Position::Receiver,
            -1 => Position::Return,
            k => Position::Param(u16::try_from(k).ok()?),
        };
        plan.steps
            .iter()
            .find(|s| s.position == position)
            .and_then(|s| s.node)
    }

    fn plan_edges(&self, reg: &ProxyRegistry, call: &CallDescriptor, plan: &mut Plan) -> Result<()> {
        let values = call
            .params
            .iter()
            .enumerate()
            .map(|(i, d)| (Position::Param((i + 1) as u16), d))
            .chain(call.ret.iter().map(|d| (Position::Return, d)));

        for (position, desc) in values {
            let index = match desc.custodian {
                Some(c) => c,
                None if desc.aliases_existing() => 0,
                None => continue,
            };
            let ward = plan
                .steps
                .iter()
                .find(|s| s.position == position)
                .and_then(|s| s.node);
            let (Some(ward), Some(custodian)) = (ward, Self::node_at(call, plan, index)) else {
                continue;
            };

            let edges = &plan.edges;
            let cyclic = graph::path_exists(custodian, ward, |n| {
                let mut next: Vec<Node> = edges
                    .iter()
                    .filter(|(w, _)| *w == n)
                    .map(|(_, c)| *c)
                    .collect();
                if let Node::Existing(r) = n {
                    if let Ok(p) = reg.get(r) {
                        next.extend(p.custodians.iter().copied().map(Node::Existing));
                    }
                }
                next
            });
            if cyclic {
                let label = |n: Node| match n {
                    Node::Existing(r) => r.to_string(),
                    Node::New(_) => "new proxy".to_string(),
                };
                return Err(InvariantViolation::CustodianCycle {
                    ward: format!("{position} ({})", label(ward)),
                    custodian: format!("custodian {index} ({})", label(custodian)),
                }
                .into());
            }
            plan.edges.push((ward, custodian));
        }
        Ok(())
    }

    fn apply(&self, reg: &mut ProxyRegistry, label: String, plan: Plan) -> Result<CallResolution> {
        let counts = self.take_references(reg, &plan)?;
        self.commit(reg, label, plan, &counts)
    }

    fn target(
        reg: &ProxyRegistry,
        plan: &Plan,
        node: Node,
    ) -> Result<(TypeIndex, NativeHandle, OwnershipMode)> {
        Ok(match node {
            Node::Existing(r) => {
                let p = reg.get(r)?;
                (p.type_index, p.handle, p.mode)
            }
            Node::New(slot) => plan.news[slot],
        })
    }

    /// Native side of a plan. Returns the observed counts of the refcounted
    /// objects it touched.
    fn take_references(
        &self,
        reg: &ProxyRegistry,
        plan: &Plan,
    ) -> Result<HashMap<(TypeIndex, NativeHandle), u32>> {
        let mut taken = Vec::new();
        let res = self.take_and_observe(reg, plan, &mut taken);
        if res.is_err() {
            for &(type_index, handle) in taken.iter().rev() {
                let td = self.table.type_at(type_index);
                let Some(methods) = td.refcount_methods.as_ref() else {
                    continue;
                };
                if let Err(err) = self.adapter.native_decref(&td.name, handle, methods) {
                    warn!(type_name = %td.name, handle = %handle, error = %err, "reference taken by a failed call was not returned");
                }
            }
        }
        res
    }

    fn take_and_observe(
        &self,
        reg: &ProxyRegistry,
        plan: &Plan,
        taken: &mut Vec<(TypeIndex, NativeHandle)>,
    ) -> Result<HashMap<(TypeIndex, NativeHandle), u32>> {
        let mut touched = Vec::new();
        for step in &plan.steps {
            let (key, incref) = match step.action {
                Action::Borrow {
                    node,
                    incref,
                    add_hold,
                } if incref || add_hold => {
                    let (type_index, handle, mode) = Self::target(reg, plan, node)?;
                    if mode != OwnershipMode::RefCounted {
                        continue;
                    }
                    ((type_index, handle), incref)
                }
                Action::Create {
                    type_index,
                    handle,
                    mode: OwnershipMode::RefCounted,
                    incref,
                    ..
                } => ((type_index, handle), incref),
                _ => continue,
            };
            if !touched.contains(&key) {
                touched.push(key);
            }
            let td = self.table.type_at(key.0);
            if let (true, Some(methods)) = (incref, td.refcount_methods.as_ref()) {
                self.adapter.native_incref(&td.name, key.1, methods)?;
                taken.push(key);
            }
        }

        let mut counts = HashMap::new();
        for key in touched {
            let td = self.table.type_at(key.0);
            let Some(methods) = td.refcount_methods.as_ref() else {
                continue;
            };
            if let Some(count) = self.adapter.observe(&td.name, key.1, methods, None)? {
                counts.insert(key, count);
            }
        }
        Ok(counts)
    }

    /// Registry side of a plan. Transfers run after the edges so an
    /// invalidated proxy leaves no edge behind.
    fn commit(
        &self,
        reg: &mut ProxyRegistry,
        label: String,
        plan: Plan,
        counts: &HashMap<(TypeIndex, NativeHandle), u32>,
    ) -> Result<CallResolution> {
        let mut created = Vec::with_capacity(plan.news.len());
        let mut values = Vec::with_capacity(plan.steps.len());
        let mut transfers = Vec::new();
        for step in &plan.steps {
            let proxy = match step.action {
                Action::Skip => step.node.map(|node| resolve(node, &created)),
                Action::Borrow {
                    node,
                    incref,
                    add_hold,
                } => {
                    let r = resolve(node, &created);
                    let p = reg.get_mut(r)?;
                    if p.mode == OwnershipMode::RefCounted {
                        let tracked = if incref {
                            p.refcount.map(|c| c.saturating_add(1))
                        } else {
                            p.refcount
                        };
                        p.refcount = counts.get(&p.key()).copied().or(tracked);
                        if add_hold {
                            p.holds += 1;
                        }
                    }
                    Some(r)
                }
                Action::Create {
                    type_index,
                    handle,
                    mode,
                    singleton,
                    incref,
                } => {
                    let td = self.table.type_at(type_index);
                    let mut proxy = Proxy::new(type_index, &td.name, handle, mode);
                    proxy.singleton = singleton;
                    match mode {
                        OwnershipMode::RefCounted => {
                            // A handed-over reference is trusted to be the only one.
                            let tracked = (!incref).then_some(1);
                            proxy.refcount = counts.get(&(type_index, handle)).copied().or(tracked);
                            proxy.holds = 1;
                        }
                        OwnershipMode::Owned => reg.clear_transferred(type_index, handle),
                        OwnershipMode::Borrowed => {}
                    }
                    let refcount = proxy.refcount;
                    let r = reg.insert(proxy);
                    debug!(proxy = %r, type_name = %td.name, handle = %handle, mode = %mode, refcount = ?refcount, "proxy created");
                    created.push(r);
                    Some(r)
                }
                Action::Transfer { proxy } => {
                    transfers.push(proxy);
                    match self.policy {
                        TransferPolicy::Invalidate => None,
                        TransferPolicy::Downgrade => Some(proxy),
                    }
                }
            };
            values.push(ResolvedValue {
                position: step.position,
                disposition: step.disposition,
                proxy,
                handle: step.handle,
            });
        }

        let mut edges = Vec::with_capacity(plan.edges.len());
        for (ward, custodian) in plan.edges {
            let (w, c) = (resolve(ward, &created), resolve(custodian, &created));
            graph::add_edge(reg, w, c)?;
            edges.push((w, c));
        }
        for proxy in transfers {
            self.transfer(reg, proxy)?;
        }

        debug!(call = %label, values = values.len(), edges = edges.len(), "call resolved");
        Ok(CallResolution {
            call: label,
            values,
            edges,
        })
    }

    fn transfer(&self, reg: &mut ProxyRegistry, proxy: ProxyRef) -> Result<()> {
        match self.policy {
            TransferPolicy::Invalidate => {
                graph::detach(reg, proxy);
                let p = reg.remove_transferred(proxy)?;
                debug!(proxy = %proxy, type_name = %p.type_name, handle = %p.handle, "ownership transferred, proxy invalidated");
            }
            TransferPolicy::Downgrade => {
                let p = reg.get_mut(proxy)?;
                p.mode = OwnershipMode::Borrowed;
                let (type_index, handle, type_name) = (p.type_index, p.handle, p.type_name.clone());
                reg.tombstone(type_index, handle, &type_name);
                debug!(proxy = %proxy, type_name = %type_name, handle = %handle, "ownership transferred, proxy downgraded");
            }
        }
        Ok(())
    }

    /// Single-value entry point for crossings outside a described call. The
    /// type's rules win over the requested disposition: singletons are always
    /// borrowed, refcounted types always get a counted proxy.
    pub fn create_or_reuse(
        &self,
        reg: &mut ProxyRegistry,
        type_name: &str,
        handle: NativeHandle,
        disposition: Disposition,
    ) -> Result<ProxyRef> {
        let type_index = self
            .table
            .type_index(type_name)
            .ok_or_else(|| InvariantViolation::UnknownType(type_name.to_string()))?;
        let td = self.table.type_at(type_index);
        if handle.is_null() {
            return Err(
                InvariantViolation::NotWrappable(format!("{disposition} of a null handle")).into(),
            );
        }
        let refcounted = td.ownership_mode == OwnershipMode::RefCounted;
        match disposition {
            Disposition::NoWrap | Disposition::TransferToNative => {
                return Err(InvariantViolation::NotWrappable(disposition.to_string()).into())
            }
            Disposition::CreateRefcountedProxy { .. } if !refcounted => {
                return Err(InvariantViolation::NotWrappable(format!(
                    "{disposition} for {type_name}, which is {}",
                    td.ownership_mode
                ))
                .into())
            }
            _ => {}
        }

        let found = if td.is_singleton {
            reg.singleton(type_index)
        } else {
            reg.lookup(type_index, handle)
        };
        if let Some(r) = found {
            let existing = reg.get(r)?.handle;
            if existing != handle {
                return Err(InvariantViolation::SingletonConflict {
                    type_name: type_name.to_string(),
                    existing,
                    requested: handle,
                }
                .into());
            }
        }

        let mut plan = Plan::default();
        let (disposition, node, action) = match (disposition, found) {
            (Disposition::BorrowExistingProxy, None) => {
                return Err(InvariantViolation::NotWrappable(format!(
                    "{disposition}: no live proxy for {type_name} {handle}"
                ))
                .into())
            }
            (Disposition::BorrowExistingProxy, Some(r)) => borrow(Node::Existing(r), true, true),
            // The crossing handed over a reference; it becomes the new hold.
            (Disposition::CreateRefcountedProxy { incref: false }, Some(r))
            | (Disposition::CreateOwnedProxy, Some(r))
                if refcounted =>
            {
                borrow(Node::Existing(r), false, true)
            }
            (_, Some(r)) if td.is_identity_mapped() => borrow(Node::Existing(r), true, true),
            (_, None) if td.is_singleton => {
                plan.create(type_index, handle, OwnershipMode::Borrowed, true, false)
            }
            (Disposition::CreateRefcountedProxy { incref }, None) => {
                plan.create(type_index, handle, OwnershipMode::RefCounted, false, incref)
            }
            (Disposition::CreateOwnedProxy, None) if refcounted => {
                plan.create(type_index, handle, OwnershipMode::RefCounted, false, false)
            }
            (_, None) if refcounted => {
                plan.create(type_index, handle, OwnershipMode::RefCounted, false, true)
            }
            (Disposition::CreateOwnedProxy, _) => {
                if let Some(owner) = reg.owner_of(type_index, handle) {
                    return Err(InvariantViolation::DoubleOwnership {
                        type_name: type_name.to_string(),
                        handle,
                        proxy: owner,
                    }
                    .into());
                }
                plan.create(type_index, handle, OwnershipMode::Owned, false, false)
            }
            (_, Some(r)) => borrow(Node::Existing(r), false, false),
            (_, None) => plan.create(type_index, handle, OwnershipMode::Borrowed, false, false),
        };
        plan.steps.push(Step {
            position: Position::Return,
            disposition,
            handle: Some(handle),
            node: Some(node),
            action,
        });

        let resolution = self.apply(reg, format!("{type_name} {handle}"), plan)?;
        resolution
            .ret()
            .ok_or_else(|| InvariantViolation::NotWrappable(disposition.to_string()).into())
    }
}

fn resolve(node: Node, created: &[ProxyRef]) -> ProxyRef {
    match node {
        Node::Existing(r) => r,
        Node::New(slot) => created[slot],
    }
}
