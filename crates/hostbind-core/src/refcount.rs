//! Uniform incref/decref/peek over native types with their own refcount
//! method names.

use serde::Serialize;
use tracing::trace;

use crate::descriptor::{OwnershipMode, RefcountMethods};
use crate::error::{InvariantViolation, LifetimeError, Result};
use crate::graph;
use crate::handle::{NativeHandle, ProxyRef};
use crate::native::{NativeRuntime, RefcountCall};
use crate::registry::{Proxy, ProxyRegistry};
use crate::table::DescriptorTable;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecrefOutcome {
    Alive { count: Option<u32> },
    /// The native count reached zero; the object destroyed itself and its proxy
    /// is gone.
    Destroyed { released_wards: Vec<ProxyRef> },
}

pub(crate) struct RefcountAdapter<'a, N> {
    native: &'a N,
    table: &'a DescriptorTable,
    peek_refcounts: bool,
}

impl<'a, N: NativeRuntime> RefcountAdapter<'a, N> {
    pub fn new(native: &'a N, table: &'a DescriptorTable, peek_refcounts: bool) -> Self {
        Self {
            native,
            table,
            peek_refcounts,
        }
    }

    fn protocol(&self, r: ProxyRef, p: &Proxy) -> Result<&'a RefcountMethods> {
        let methods = if p.mode == OwnershipMode::RefCounted {
            self.table.type_at(p.type_index).refcount_methods.as_ref()
        } else {
            None
        };
        methods.ok_or_else(|| {
            InvariantViolation::NotRefCounted {
                proxy: r,
                type_name: p.type_name.clone(),
            }
            .into()
        })
    }

    pub fn native_incref(
        &self,
        type_name: &str,
        handle: NativeHandle,
        methods: &RefcountMethods,
    ) -> Result<()> {
        let call = RefcountCall {
            type_name,
            handle,
            method: &methods.incref,
            style: methods.style,
        };
        self.native
            .incref(call)
            .map_err(|sig| LifetimeError::unmapped(format!("{type_name}::{}", methods.incref), sig))
    }

    pub fn native_decref(
        &self,
        type_name: &str,
        handle: NativeHandle,
        methods: &RefcountMethods,
    ) -> Result<()> {
        let call = RefcountCall {
            type_name,
            handle,
            method: &methods.decref,
            style: methods.style,
        };
        self.native
            .decref(call)
            .map_err(|sig| LifetimeError::unmapped(format!("{type_name}::{}", methods.decref), sig))
    }

    /// Native count if the type declares a peek method, otherwise `tracked`.
    pub fn observe(
        &self,
        type_name: &str,
        handle: NativeHandle,
        methods: &RefcountMethods,
        tracked: Option<u32>,
    ) -> Result<Option<u32>> {
        let Some(peek) = methods.peek.as_deref().filter(|_| self.peek_refcounts) else {
            return Ok(tracked);
        };
        let call = RefcountCall {
            type_name,
            handle,
            method: peek,
            style: methods.style,
        };
        self.native
            .peek(call)
            .map(Some)
            .map_err(|sig| LifetimeError::unmapped(format!("{type_name}::{peek}"), sig))
    }

    pub fn incref(&self, reg: &mut ProxyRegistry, r: ProxyRef) -> Result<Option<u32>> {
        let p = reg.get(r)?;
        let methods = self.protocol(r, p)?;
        let (type_name, handle) = (p.type_name.clone(), p.handle);
        self.native_incref(&type_name, handle, methods)?;
        let tracked = p.refcount.map(|c| c.saturating_add(1));
        let count = self.observe(&type_name, handle, methods, tracked)?;

        let p = reg.get_mut(r)?;
        p.refcount = count;
        p.holds += 1;
        trace!(proxy = %r, type_name = %type_name, count = ?count, holds = p.holds, "incref");
        Ok(count)
    }

    pub fn decref(&self, reg: &mut ProxyRegistry, r: ProxyRef) -> Result<DecrefOutcome> {
        let p = reg.get(r)?;
        let methods = self.protocol(r, p)?;
        let (type_name, handle, holds, tracked) =
            (p.type_name.clone(), p.handle, p.holds, p.refcount);
        let double_release = || LifetimeError::DoubleRelease {
            proxy: r,
            type_name: type_name.clone(),
            handle,
        };
        if holds == 0 || tracked == Some(0) {
            return Err(double_release());
        }
        // Peek first: after a decref to zero the object is gone.
        let before = self.observe(&type_name, handle, methods, tracked)?;
        if before == Some(0) {
            return Err(double_release());
        }
        self.native_decref(&type_name, handle, methods)?;
        let count = before.map(|c| c - 1);
        trace!(proxy = %r, type_name = %type_name, count = ?count, "decref");

        if count == Some(0) {
            let released_wards = graph::detach(reg, r);
            reg.remove(r)?;
            return Ok(DecrefOutcome::Destroyed { released_wards });
        }
        let p = reg.get_mut(r)?;
        p.holds -= 1;
        p.refcount = count;
        Ok(DecrefOutcome::Alive { count })
    }

    pub fn peek(&self, reg: &mut ProxyRegistry, r: ProxyRef) -> Result<Option<u32>> {
        let p = reg.get(r)?;
        let methods = self.protocol(r, p)?;
        let count = self.observe(&p.type_name, p.handle, methods, p.refcount)?;
        reg.get_mut(r)?.refcount = count;
        Ok(count)
    }

    /// The host's proxy holds the only native reference.
    pub fn is_solely_held(&self, reg: &mut ProxyRegistry, r: ProxyRef) -> Result<bool> {
        Ok(self.peek(reg, r)? == Some(1))
    }
}
