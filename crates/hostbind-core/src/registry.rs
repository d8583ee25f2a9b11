//! Proxy arena and identity map. Owned exclusively by the manager; every access
//! happens under its lock.

use std::collections::{BTreeSet, HashMap};

use hostbind_contracts::STATE_SNAPSHOT_SCHEMA_VERSION;
use serde::Serialize;

use crate::descriptor::OwnershipMode;
use crate::error::InvariantViolation;
use crate::handle::{NativeHandle, ProxyRef};
use crate::table::TypeIndex;

#[derive(Debug, Clone)]
pub(crate) struct Proxy {
    pub type_index: TypeIndex,
    pub type_name: String,
    pub handle: NativeHandle,
    /// Decided at the crossing that created the proxy; may differ from the
    /// type's declared mode.
    pub mode: OwnershipMode,
    pub singleton: bool,
    /// Native references the host owns through this proxy (refcounted only).
    pub holds: u32,
    /// Last known native count (refcounted only).
    pub refcount: Option<u32>,
    /// Outgoing edges: this proxy is a ward of each.
    pub custodians: BTreeSet<ProxyRef>,
    /// Incoming edges: this proxy is custodian of each.
    pub wards: BTreeSet<ProxyRef>,
    pub releasable: bool,
}

impl Proxy {
    pub fn new(
        type_index: TypeIndex,
        type_name: &str,
        handle: NativeHandle,
        mode: OwnershipMode,
    ) -> Self {
        Self {
            type_index,
            type_name: type_name.to_string(),
            handle,
            mode,
            singleton: false,
            holds: 0,
            refcount: None,
            custodians: BTreeSet::new(),
            wards: BTreeSet::new(),
            releasable: false,
        }
    }

    pub fn key(&self) -> (TypeIndex, NativeHandle) {
        (self.type_index, self.handle)
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    proxy: Option<Proxy>,
    /// Handle of the previous occupant if it left because its ownership went
    /// to native.
    transferred: Option<NativeHandle>,
}

#[derive(Debug, Default)]
pub(crate) struct ProxyRegistry {
    slots: Vec<Slot>,
    by_key: HashMap<(TypeIndex, NativeHandle), Vec<ProxyRef>>,
    singletons: HashMap<TypeIndex, ProxyRef>,
    /// Tombstones for handles whose ownership went to native, with type names.
    transferred: HashMap<(TypeIndex, NativeHandle), String>,
}

impl ProxyRegistry {
    pub fn insert(&mut self, proxy: Proxy) -> ProxyRef {
        let key = proxy.key();
        let singleton = proxy.singleton;
        let index = match self.slots.iter().position(|s| s.proxy.is_none()) {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.proxy = Some(proxy);
        slot.transferred = None;
        let r = ProxyRef::new(index as u32, slot.generation);

        self.by_key.entry(key).or_default().push(r);
        if singleton {
            self.singletons.insert(key.0, r);
        }
        r
    }

    pub fn get(&self, r: ProxyRef) -> Result<&Proxy, InvariantViolation> {
        self.slots
            .get(r.index() as usize)
            .filter(|s| s.generation == r.generation())
            .and_then(|s| s.proxy.as_ref())
            .ok_or(InvariantViolation::StaleProxy(r))
    }

    pub fn get_mut(&mut self, r: ProxyRef) -> Result<&mut Proxy, InvariantViolation> {
        self.slots
            .get_mut(r.index() as usize)
            .filter(|s| s.generation == r.generation())
            .and_then(|s| s.proxy.as_mut())
            .ok_or(InvariantViolation::StaleProxy(r))
    }

    pub fn contains(&self, r: ProxyRef) -> bool {
        self.get(r).is_ok()
    }

    /// Frees the slot; later uses of `r` are reported as stale.
    pub fn remove(&mut self, r: ProxyRef) -> Result<Proxy, InvariantViolation> {
        self.get(r)?;
        let slot = &mut self.slots[r.index() as usize];
        let Some(proxy) = slot.proxy.take() else {
            return Err(InvariantViolation::StaleProxy(r));
        };
        slot.generation = slot.generation.wrapping_add(1);

        let key = proxy.key();
        if let Some(refs) = self.by_key.get_mut(&key) {
            refs.retain(|x| *x != r);
            if refs.is_empty() {
                self.by_key.remove(&key);
            }
        }
        if self.singletons.get(&key.0) == Some(&r) {
            self.singletons.remove(&key.0);
        }
        Ok(proxy)
    }

    /// Removes a proxy whose native resource now belongs to native code and
    /// tombstones its handle.
    pub fn remove_transferred(&mut self, r: ProxyRef) -> Result<Proxy, InvariantViolation> {
        let proxy = self.remove(r)?;
        self.slots[r.index() as usize].transferred = Some(proxy.handle);
        self.tombstone(proxy.type_index, proxy.handle, &proxy.type_name);
        Ok(proxy)
    }

    pub fn tombstone(&mut self, type_index: TypeIndex, handle: NativeHandle, type_name: &str) {
        self.transferred
            .insert((type_index, handle), type_name.to_string());
    }

    /// The handle `r` wrapped, if `r` is stale because its proxy was
    /// transferred to native.
    pub fn was_transferred(&self, r: ProxyRef) -> Option<NativeHandle> {
        let s = self.slots.get(r.index() as usize)?;
        if s.proxy.is_none() && s.generation == r.generation().wrapping_add(1) {
            s.transferred
        } else {
            None
        }
    }

    pub fn lookup(&self, type_index: TypeIndex, handle: NativeHandle) -> Option<ProxyRef> {
        self.by_key
            .get(&(type_index, handle))
            .and_then(|refs| refs.first().copied())
    }

    pub fn lookup_all(&self, type_index: TypeIndex, handle: NativeHandle) -> &[ProxyRef] {
        self.by_key
            .get(&(type_index, handle))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The proxy that holds destructive ownership of `handle`, if any.
    pub fn owner_of(&self, type_index: TypeIndex, handle: NativeHandle) -> Option<ProxyRef> {
        self.lookup_all(type_index, handle)
            .iter()
            .copied()
            .find(|r| {
                self.get(*r)
                    .is_ok_and(|p| p.mode == OwnershipMode::Owned)
            })
    }

    pub fn singleton(&self, type_index: TypeIndex) -> Option<ProxyRef> {
        self.singletons.get(&type_index).copied()
    }

    pub fn is_transferred(&self, type_index: TypeIndex, handle: NativeHandle) -> bool {
        self.transferred.contains_key(&(type_index, handle))
    }

    pub fn clear_transferred(&mut self, type_index: TypeIndex, handle: NativeHandle) {
        self.transferred.remove(&(type_index, handle));
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProxyRef, &Proxy)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.proxy
                .as_ref()
                .map(|p| (ProxyRef::new(i as u32, s.generation), p))
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.proxy.is_some()).count()
    }

    /// Drops every proxy without touching native state. Returns how many were live.
    pub fn clear(&mut self) -> usize {
        let mut dropped = 0;
        for slot in &mut self.slots {
            if slot.proxy.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                dropped += 1;
            }
            slot.transferred = None;
        }
        self.by_key.clear();
        self.singletons.clear();
        self.transferred.clear();
        dropped
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let proxies = self.iter().map(|(r, p)| ProxyInfo::new(r, p)).collect();
        let mut transferred: Vec<TransferredHandle> = self
            .transferred
            .iter()
            .map(|((_, handle), type_name)| TransferredHandle {
                type_name: type_name.clone(),
                handle: *handle,
            })
            .collect();
        transferred.sort_by(|a, b| {
            a.type_name
                .cmp(&b.type_name)
                .then_with(|| a.handle.cmp(&b.handle))
        });
        StateSnapshot {
            schema_version: STATE_SNAPSHOT_SCHEMA_VERSION.to_string(),
            proxies,
            transferred,
        }
    }
}

/// Read-only view of one live proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyInfo {
    pub proxy: ProxyRef,
    pub type_name: String,
    pub handle: NativeHandle,
    pub mode: OwnershipMode,
    pub singleton: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refcount: Option<u32>,
    pub holds: u32,
    pub custodians: Vec<ProxyRef>,
    pub wards: Vec<ProxyRef>,
    pub releasable: bool,
}

impl ProxyInfo {
    pub(crate) fn new(r: ProxyRef, p: &Proxy) -> Self {
        Self {
            proxy: r,
            type_name: p.type_name.clone(),
            handle: p.handle,
            mode: p.mode,
            singleton: p.singleton,
            refcount: p.refcount,
            holds: p.holds,
            custodians: p.custodians.iter().copied().collect(),
            wards: p.wards.iter().copied().collect(),
            releasable: p.releasable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferredHandle {
    pub type_name: String,
    pub handle: NativeHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub schema_version: String,
    pub proxies: Vec<ProxyInfo>,
    pub transferred: Vec<TransferredHandle>,
}
