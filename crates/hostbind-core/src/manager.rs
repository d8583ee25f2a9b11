use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, warn};

use crate::bridge::{self, HostError};
use crate::config::ManagerConfig;
use crate::descriptor::{CallDescriptor, OwnershipMode};
use crate::error::{InvariantViolation, LifetimeError, Result};
use crate::graph;
use crate::handle::{NativeHandle, ProxyRef};
use crate::native::{NativeRuntime, NativeSignal};
use crate::refcount::{DecrefOutcome, RefcountAdapter};
use crate::registry::{ProxyInfo, ProxyRegistry, StateSnapshot};
use crate::resolver::{CallFacts, CallResolution, Disposition, Resolver};
use crate::table::DescriptorTable;

/// What finalizing a proxy did on the native side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FinalizeAction {
    /// The proxy was dropped; the native resource was left alone.
    Detached,
    /// The host owned the resource and destroyed it.
    Destroyed { via: String },
    /// The proxy's native references were released.
    Released { decrefs: u32, destroyed: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finalization {
    pub proxy: ProxyRef,
    pub type_name: String,
    pub handle: NativeHandle,
    #[serde(flatten)]
    pub action: FinalizeAction,
    /// Wards that became releasable because this proxy was their last custodian.
    pub released_wards: Vec<ProxyRef>,
}

/// Owns the proxy registry and applies the ownership contract at every
/// boundary crossing.
///
/// All registry access, refcount adjustment and edge mutation happens under a
/// single lock, so resolve-and-register is one critical section.
pub struct Manager<N> {
    table: DescriptorTable,
    native: N,
    config: ManagerConfig,
    state: Mutex<ProxyRegistry>,
}

impl<N: NativeRuntime> Manager<N> {
    pub fn new(table: DescriptorTable, native: N, config: ManagerConfig) -> Self {
        Self {
            table,
            native,
            config,
            state: Mutex::new(ProxyRegistry::default()),
        }
    }

    pub fn table(&self) -> &DescriptorTable {
        &self.table
    }

    pub fn native(&self) -> &N {
        &self.native
    }

    pub fn config(&self) -> ManagerConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, ProxyRegistry> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn adapter(&self) -> RefcountAdapter<'_, N> {
        RefcountAdapter::new(&self.native, &self.table, self.config.peek_refcounts)
    }

    fn resolver(&self) -> Resolver<'_, N> {
        Resolver::new(&self.table, self.adapter(), self.config.transfer_policy)
    }

    fn report<T>(op: &str, res: Result<T>) -> Result<T> {
        if let Err(err) = &res {
            if err.is_fatal() {
                warn!(op, kind = err.kind(), error = %err, "boundary operation failed");
            }
        }
        res
    }

    /// The table's descriptor for `(owner, signature)`.
    pub fn call(&self, owner: &str, signature: &str) -> Result<&CallDescriptor> {
        self.table.call(owner, signature).ok_or_else(|| {
            InvariantViolation::FactMismatch {
                call: format!("{owner}::{signature}"),
                message: "call is not declared in the descriptor table".to_string(),
            }
            .into()
        })
    }

    /// Computes and applies the disposition of every value crossing `call`.
    pub fn resolve_call(&self, call: &CallDescriptor, facts: &CallFacts) -> Result<CallResolution> {
        let res = self.call(&call.owner, &call.signature).and_then(|declared| {
            let mut reg = self.lock();
            self.resolver().resolve(&mut reg, declared, facts)
        });
        Self::report("resolve_call", res)
    }

    pub fn create_or_reuse_proxy(
        &self,
        type_name: &str,
        handle: NativeHandle,
        disposition: Disposition,
    ) -> Result<ProxyRef> {
        let res = {
            let mut reg = self.lock();
            self.resolver()
                .create_or_reuse(&mut reg, type_name, handle, disposition)
        };
        Self::report("create_or_reuse_proxy", res)
    }

    /// Runs the disposition dictated by the proxy's ownership mode, then
    /// removes the proxy and its graph edges. Called from the host's
    /// finalizer hook.
    pub fn finalize_proxy(&self, r: ProxyRef) -> Result<Finalization> {
        let res = {
            let mut reg = self.lock();
            self.finalize_locked(&mut reg, r)
        };
        Self::report("finalize_proxy", res)
    }

    fn finalize_locked(&self, reg: &mut ProxyRegistry, r: ProxyRef) -> Result<Finalization> {
        reg.get(r)?;
        // Collected together with a custodian: the edge goes, the ward's own
        // disposition still runs.
        if let Some(custodian) = graph::live_custodian(reg, r) {
            debug!(ward = %r, custodian = %custodian, "ward finalized before its custodian");
            graph::remove_edges_from(reg, r);
        }
        let p = reg.get(r)?;
        let (type_name, handle, mode, singleton, holds) =
            (p.type_name.clone(), p.handle, p.mode, p.singleton, p.holds);
        let td = self.table.type_at(p.type_index);

        let mut released_wards = Vec::new();
        let action = match mode {
            _ if singleton => FinalizeAction::Detached,
            OwnershipMode::RefCounted => {
                let adapter = self.adapter();
                let mut decrefs = 0;
                let mut destroyed = false;
                for _ in 0..holds {
                    decrefs += 1;
                    if let DecrefOutcome::Destroyed { released_wards: w } = adapter.decref(reg, r)? {
                        released_wards = w;
                        destroyed = true;
                        break;
                    }
                }
                FinalizeAction::Released { decrefs, destroyed }
            }
            OwnershipMode::Owned => {
                let via = td.free_function.as_deref();
                self.native
                    .destroy(&type_name, handle, via)
                    .map_err(|sig: NativeSignal| {
                        let entry = via.map_or_else(|| format!("~{type_name}"), str::to_string);
                        LifetimeError::unmapped(format!("{type_name}::{entry}"), sig)
                    })?;
                FinalizeAction::Destroyed {
                    via: via.unwrap_or("delete").to_string(),
                }
            }
            OwnershipMode::Borrowed => FinalizeAction::Detached,
        };

        if reg.contains(r) {
            released_wards.extend(graph::detach(reg, r));
            reg.remove(r)?;
        }
        debug!(proxy = %r, type_name = %type_name, handle = %handle, action = ?action, "proxy finalized");
        Ok(Finalization {
            proxy: r,
            type_name,
            handle,
            action,
            released_wards,
        })
    }

    /// Maps a native error raised during `call` to a host error.
    pub fn bridge_error(&self, call: &CallDescriptor, signal: &NativeSignal) -> Result<HostError> {
        let res = self
            .call(&call.owner, &call.signature)
            .and_then(|declared| bridge::bridge_error(&self.table, declared, signal));
        Self::report("bridge_error", res)
    }

    pub fn incref(&self, r: ProxyRef) -> Result<Option<u32>> {
        let res = self.adapter().incref(&mut self.lock(), r);
        Self::report("incref", res)
    }

    pub fn decref(&self, r: ProxyRef) -> Result<DecrefOutcome> {
        let res = self.adapter().decref(&mut self.lock(), r);
        Self::report("decref", res)
    }

    pub fn peek(&self, r: ProxyRef) -> Result<Option<u32>> {
        let res = self.adapter().peek(&mut self.lock(), r);
        Self::report("peek", res)
    }

    pub fn is_solely_held(&self, r: ProxyRef) -> Result<bool> {
        let res = self.adapter().is_solely_held(&mut self.lock(), r);
        Self::report("is_solely_held", res)
    }

    pub fn proxy_info(&self, r: ProxyRef) -> Result<ProxyInfo> {
        let reg = self.lock();
        let p = reg.get(r)?;
        Ok(ProxyInfo::new(r, p))
    }

    pub fn is_live(&self, r: ProxyRef) -> bool {
        self.lock().contains(r)
    }

    pub fn is_releasable(&self, r: ProxyRef) -> Result<bool> {
        Ok(self.lock().get(r)?.releasable)
    }

    /// First live proxy wrapping `handle` as `type_name`.
    pub fn lookup(&self, type_name: &str, handle: NativeHandle) -> Option<ProxyRef> {
        let type_index = self.table.type_index(type_name)?;
        self.lock().lookup(type_index, handle)
    }

    pub fn live_proxies(&self) -> usize {
        self.lock().len()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.lock().snapshot()
    }

    /// Clears the registry without native side effects. Returns the number of
    /// proxies dropped.
    pub fn shutdown(&self) -> usize {
        let dropped = self.lock().clear();
        debug!(dropped, "registry cleared");
        dropped
    }
}
