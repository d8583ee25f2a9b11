//! The read-only descriptor table, loaded and validated once before any
//! boundary call.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use hostbind_contracts::DESCRIPTOR_TABLE_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};

use crate::descriptor::{
    CallDescriptor, CallKind, Direction, ErrorDescriptor, OwnershipMode, TypeDescriptor,
    ValueDescriptor,
};
use crate::error::{ConfigError, ConfigErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DescriptorDocument {
    pub schema_version: String,
    #[serde(default)]
    pub types: Vec<TypeDescriptor>,
    #[serde(default)]
    pub errors: Vec<ErrorDescriptor>,
    #[serde(default)]
    pub calls: Vec<CallDescriptor>,
}

impl DescriptorDocument {
    pub fn new(
        types: Vec<TypeDescriptor>,
        errors: Vec<ErrorDescriptor>,
        calls: Vec<CallDescriptor>,
    ) -> Self {
        Self {
            schema_version: DESCRIPTOR_TABLE_SCHEMA_VERSION.to_string(),
            types,
            errors,
            calls,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeIndex(u32);

#[derive(Debug, Clone)]
pub struct DescriptorTable {
    types: Vec<TypeDescriptor>,
    type_names: HashMap<String, TypeIndex>,
    errors: BTreeMap<String, ErrorDescriptor>,
    calls: BTreeMap<(String, String), CallDescriptor>,
}

impl DescriptorTable {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let doc: DescriptorDocument = serde_json::from_slice(bytes).map_err(|err| {
            ConfigError::new(ConfigErrorKind::Parse, "descriptor table", err.to_string())
        })?;
        Self::from_document(doc)
    }

    pub fn from_parts(
        types: Vec<TypeDescriptor>,
        errors: Vec<ErrorDescriptor>,
        calls: Vec<CallDescriptor>,
    ) -> Result<Self, ConfigError> {
        Self::from_document(DescriptorDocument::new(types, errors, calls))
    }

    /// Fails on the first configuration error; use [`DescriptorTable::diagnose`]
    /// to collect all of them.
    pub fn from_document(doc: DescriptorDocument) -> Result<Self, ConfigError> {
        if let Some(first) = Self::diagnose(&doc).into_iter().next() {
            return Err(first);
        }

        let mut type_names = HashMap::with_capacity(doc.types.len());
        for (i, t) in doc.types.iter().enumerate() {
            type_names.insert(t.name.clone(), TypeIndex(i as u32));
        }
        let errors = doc
            .errors
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();
        let calls = doc
            .calls
            .into_iter()
            .map(|mut call| {
                for v in call.params.iter_mut().chain(call.ret.iter_mut()) {
                    if v.return_internal_reference {
                        v.reference_existing_object = true;
                    }
                }
                ((call.owner.clone(), call.signature.clone()), call)
            })
            .collect();

        Ok(Self {
            types: doc.types,
            type_names,
            errors,
            calls,
        })
    }

    /// Every configuration error in the document, in declaration order.
    pub fn diagnose(doc: &DescriptorDocument) -> Vec<ConfigError> {
        let mut out = Vec::new();
        if doc.schema_version != DESCRIPTOR_TABLE_SCHEMA_VERSION {
            out.push(ConfigError::new(
                ConfigErrorKind::SchemaVersion,
                "descriptor table",
                format!(
                    "expected schema_version {DESCRIPTOR_TABLE_SCHEMA_VERSION:?}, got {:?}",
                    doc.schema_version
                ),
            ));
        }

        let mut types: HashMap<&str, &TypeDescriptor> = HashMap::new();
        for t in &doc.types {
            if types.insert(t.name.as_str(), t).is_some() {
                out.push(ConfigError::new(
                    ConfigErrorKind::Duplicate,
                    format!("type {}", t.name),
                    "declared more than once",
                ));
            }
            out.extend(t.validate());
        }

        let mut errors: HashMap<&str, &ErrorDescriptor> = HashMap::new();
        for e in &doc.errors {
            if errors.insert(e.name.as_str(), e).is_some() {
                out.push(ConfigError::new(
                    ConfigErrorKind::Duplicate,
                    format!("error {}", e.name),
                    "declared more than once",
                ));
            }
        }
        diagnose_error_hierarchy(&doc.errors, &errors, &mut out);

        let mut seen = BTreeSet::new();
        for call in &doc.calls {
            if !seen.insert((call.owner.as_str(), call.signature.as_str())) {
                out.push(ConfigError::new(
                    ConfigErrorKind::Duplicate,
                    format!("call {}", call.label()),
                    "declared more than once",
                ));
            }
            CallCheck {
                call,
                types: &types,
                subject: format!("call {}", call.label()),
                out: &mut out,
            }
            .run(&errors);
        }
        out
    }

    pub fn type_index(&self, name: &str) -> Option<TypeIndex> {
        self.type_names.get(name).copied()
    }

    pub fn type_at(&self, index: TypeIndex) -> &TypeDescriptor {
        &self.types[index.0 as usize]
    }

    pub fn type_named(&self, name: &str) -> Option<&TypeDescriptor> {
        self.type_index(name).map(|i| self.type_at(i))
    }

    pub fn types(&self) -> &[TypeDescriptor] {
        &self.types
    }

    pub fn call(&self, owner: &str, signature: &str) -> Option<&CallDescriptor> {
        self.calls.get(&(owner.to_string(), signature.to_string()))
    }

    pub fn calls(&self) -> impl Iterator<Item = &CallDescriptor> {
        self.calls.values()
    }

    pub fn error(&self, name: &str) -> Option<&ErrorDescriptor> {
        self.errors.get(name)
    }
}

fn diagnose_error_hierarchy(
    decls: &[ErrorDescriptor],
    errors: &HashMap<&str, &ErrorDescriptor>,
    out: &mut Vec<ConfigError>,
) {
    for e in decls {
        let subject = format!("error {}", e.name);
        let Some(parent) = e.parent.as_deref() else {
            continue;
        };
        if !errors.contains_key(parent) {
            out.push(ConfigError::new(
                ConfigErrorKind::UnknownError,
                subject,
                format!("parent {parent:?} is not declared"),
            ));
            continue;
        }
        let mut visited = BTreeSet::from([e.name.as_str()]);
        let mut cur = Some(parent);
        while let Some(name) = cur {
            if !visited.insert(name) {
                out.push(ConfigError::new(
                    ConfigErrorKind::ErrorCycle,
                    subject,
                    format!("inheritance cycle through {name:?}"),
                ));
                break;
            }
            cur = errors.get(name).and_then(|d| d.parent.as_deref());
        }
    }
}

/// Where a value sits in a call, for custodian indexing.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Param(usize),
    Return,
}

struct CallCheck<'a> {
    call: &'a CallDescriptor,
    types: &'a HashMap<&'a str, &'a TypeDescriptor>,
    subject: String,
    out: &'a mut Vec<ConfigError>,
}

impl CallCheck<'_> {
    fn push(&mut self, kind: ConfigErrorKind, message: impl Into<String>) {
        self.out
            .push(ConfigError::new(kind, self.subject.clone(), message));
    }

    fn run(mut self, errors: &HashMap<&str, &ErrorDescriptor>) {
        let call = self.call;
        if call.kind != CallKind::Function && !self.types.contains_key(call.owner.as_str()) {
            self.push(
                ConfigErrorKind::UnknownType,
                format!("owner type {:?} is not declared", call.owner),
            );
        }
        if call.kind == CallKind::Constructor {
            match &call.ret {
                Some(ret) if ret.type_name.as_deref() == Some(call.owner.as_str()) => {
                    if ret.aliases_existing() || ret.custodian.is_some() {
                        self.push(
                            ConfigErrorKind::ConstructorShape,
                            "a constructor returns a fresh object; it cannot alias or have a custodian",
                        );
                    }
                }
                _ => self.push(
                    ConfigErrorKind::ConstructorShape,
                    format!("constructor must return {}", call.owner),
                ),
            }
        }
        for name in &call.throws {
            if !errors.contains_key(name.as_str()) {
                self.push(
                    ConfigErrorKind::UnknownError,
                    format!("throws undeclared error {name:?}"),
                );
            }
        }
        for (i, v) in call.params.iter().enumerate() {
            self.value(v, Slot::Param(i + 1));
        }
        if let Some(ret) = &call.ret {
            self.value(ret, Slot::Return);
        }
    }

    fn value(&mut self, v: &ValueDescriptor, slot: Slot) {
        let label = match slot {
            Slot::Param(k) => format!("parameter {k}"),
            Slot::Return => "return value".to_string(),
        };
        let Some(type_name) = v.type_name.as_deref() else {
            if v.hands_over() || v.aliases_existing() || v.custodian.is_some() {
                self.push(
                    ConfigErrorKind::MisplacedFlag,
                    format!("{label} is a plain value and cannot carry ownership flags"),
                );
            }
            return;
        };
        let types = self.types;
        let Some(ty) = types.get(type_name).copied() else {
            self.push(
                ConfigErrorKind::UnknownType,
                format!("{label} has undeclared type {type_name:?}"),
            );
            return;
        };

        let outbound = slot == Slot::Return || v.direction.is_outbound();
        if v.caller_owns_return && v.aliases_existing() {
            self.push(
                ConfigErrorKind::AmbiguousOwner,
                format!("{label} sets caller_owns_return and references an existing object"),
            );
        }
        if v.custodian.is_some() && v.hands_over() {
            self.push(
                ConfigErrorKind::AmbiguousOwner,
                format!("{label} combines a custodian with an ownership hand-over"),
            );
        }
        if !outbound && (v.caller_owns_return || v.aliases_existing()) {
            self.push(
                ConfigErrorKind::MisplacedFlag,
                format!("{label} is inbound only; caller_owns_return and aliasing apply to outbound values"),
            );
        }
        if slot == Slot::Return && v.direction != Direction::In {
            self.push(
                ConfigErrorKind::MisplacedFlag,
                "the return value has no direction",
            );
        }
        if v.hands_over() && ty.ownership_mode == OwnershipMode::Borrowed {
            self.push(
                ConfigErrorKind::NothingToTransfer,
                format!("{label} hands over ownership of borrowed type {type_name}"),
            );
        }

        let custodian = match v.custodian {
            Some(c) => Some(c),
            None if v.aliases_existing() => {
                if !self.call.kind.has_receiver() {
                    self.push(
                        ConfigErrorKind::CustodianOutOfRange,
                        format!("{label} aliases an existing object but the call has no receiver to act as custodian"),
                    );
                    return;
                }
                Some(0)
            }
            None => None,
        };
        if let Some(c) = custodian {
            self.custodian(c, slot, &label);
        }
    }

    fn custodian(&mut self, index: i32, slot: Slot, label: &str) {
        let call = self.call;
        let target = match index {
            0 => match call.kind {
                CallKind::Method => Some((call.owner.as_str(), None)),
                CallKind::Constructor => Some((call.owner.as_str(), Some(Slot::Return))),
                CallKind::Function => None,
            },
            -1 => call
                .ret
                .as_ref()
                .and_then(|r| r.type_name.as_deref())
                .map(|t| (t, Some(Slot::Return))),
            k if k >= 1 => call
                .params
                .get(k as usize - 1)
                .and_then(|p| p.type_name.as_deref())
                .map(|t| (t, Some(Slot::Param(k as usize)))),
            _ => None,
        };
        let Some((custodian_type, custodian_slot)) = target else {
            self.push(
                ConfigErrorKind::CustodianOutOfRange,
                format!("{label} names custodian {index}, which is not a wrapped value of this call"),
            );
            return;
        };
        if custodian_slot == Some(slot) {
            self.push(
                ConfigErrorKind::CustodianOutOfRange,
                format!("{label} cannot be its own custodian"),
            );
            return;
        }
        let types = self.types;
        if let Some(ty) = types.get(custodian_type) {
            if !ty.allow_subclassing {
                self.push(
                    ConfigErrorKind::CustodianUnsupported,
                    format!("custodian type {custodian_type} does not allow subclassing"),
                );
            }
        }
    }
}
