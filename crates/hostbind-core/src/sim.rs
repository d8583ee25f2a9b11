//! In-process native heap used by tests and `hostbind replay`.
//!
//! Objects carry an intrusive count starting at one; a decref to zero destroys
//! the object. Dead objects stay in the table so use-after-free and double
//! free are reported as native signals instead of going unnoticed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::handle::NativeHandle;
use crate::native::{NativeRuntime, NativeSignal, RefcountCall};

const FIRST_HANDLE: u64 = 0x1000;
const HANDLE_STRIDE: u64 = 0x10;

pub const SIGNAL_USE_AFTER_FREE: &str = "sim::use_after_free";
pub const SIGNAL_DOUBLE_FREE: &str = "sim::double_free";
pub const SIGNAL_UNKNOWN_HANDLE: &str = "sim::unknown_handle";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestroyRecord {
    pub handle: NativeHandle,
    pub type_name: String,
    /// Native entry point that destroyed the object (decref method, free
    /// function or `delete`).
    pub via: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveObject {
    pub handle: NativeHandle,
    pub type_name: String,
    pub refcount: u32,
}

#[derive(Debug)]
struct SimObject {
    type_name: String,
    refcount: u32,
    alive: bool,
}

#[derive(Debug, Default)]
struct HeapState {
    objects: BTreeMap<NativeHandle, SimObject>,
    allocated: u64,
    destroyed: Vec<DestroyRecord>,
    failures: HashMap<String, NativeSignal>,
}

impl HeapState {
    fn live_mut(&mut self, handle: NativeHandle) -> Result<&mut SimObject, NativeSignal> {
        match self.objects.get_mut(&handle) {
            Some(obj) if obj.alive => Ok(obj),
            Some(obj) => Err(NativeSignal::new(
                SIGNAL_USE_AFTER_FREE,
                format!("{} {handle} was already destroyed", obj.type_name),
            )),
            None => Err(NativeSignal::new(
                SIGNAL_UNKNOWN_HANDLE,
                format!("{handle} was never allocated"),
            )),
        }
    }

    fn scripted_failure(&self, method: &str) -> Result<(), NativeSignal> {
        match self.failures.get(method) {
            Some(sig) => Err(sig.clone()),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct SimHeap {
    state: Mutex<HeapState>,
}

impl SimHeap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HeapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates an object with a native count of one.
    pub fn alloc(&self, type_name: &str) -> NativeHandle {
        let mut st = self.lock();
        let handle = loop {
            let h = NativeHandle(FIRST_HANDLE + st.allocated * HANDLE_STRIDE);
            st.allocated += 1;
            if !st.objects.contains_key(&h) {
                break h;
            }
        };
        st.objects.insert(
            handle,
            SimObject {
                type_name: type_name.to_string(),
                refcount: 1,
                alive: true,
            },
        );
        handle
    }

    /// Allocates at a fixed address, replacing any dead object there.
    pub fn alloc_at(&self, type_name: &str, handle: NativeHandle) -> NativeHandle {
        self.lock().objects.insert(
            handle,
            SimObject {
                type_name: type_name.to_string(),
                refcount: 1,
                alive: true,
            },
        );
        handle
    }

    /// Every later call to `method` raises `signal`.
    pub fn fail_method(&self, method: &str, signal: NativeSignal) {
        self.lock().failures.insert(method.to_string(), signal);
    }

    pub fn clear_failure(&self, method: &str) {
        self.lock().failures.remove(method);
    }

    pub fn refcount(&self, handle: NativeHandle) -> Option<u32> {
        self.lock()
            .objects
            .get(&handle)
            .filter(|o| o.alive)
            .map(|o| o.refcount)
    }

    pub fn is_alive(&self, handle: NativeHandle) -> bool {
        self.refcount(handle).is_some()
    }

    pub fn destroy_count(&self, handle: NativeHandle) -> usize {
        self.lock()
            .destroyed
            .iter()
            .filter(|d| d.handle == handle)
            .count()
    }

    pub fn destroyed(&self) -> Vec<DestroyRecord> {
        self.lock().destroyed.clone()
    }

    pub fn live_objects(&self) -> Vec<LiveObject> {
        self.lock()
            .objects
            .iter()
            .filter(|(_, o)| o.alive)
            .map(|(h, o)| LiveObject {
                handle: *h,
                type_name: o.type_name.clone(),
                refcount: o.refcount,
            })
            .collect()
    }
}

impl NativeRuntime for SimHeap {
    fn incref(&self, call: RefcountCall<'_>) -> Result<(), NativeSignal> {
        let mut st = self.lock();
        st.scripted_failure(call.method)?;
        let obj = st.live_mut(call.handle)?;
        obj.refcount += 1;
        Ok(())
    }

    fn decref(&self, call: RefcountCall<'_>) -> Result<(), NativeSignal> {
        let mut st = self.lock();
        st.scripted_failure(call.method)?;
        let obj = st.live_mut(call.handle)?;
        obj.refcount -= 1;
        if obj.refcount == 0 {
            obj.alive = false;
            let record = DestroyRecord {
                handle: call.handle,
                type_name: obj.type_name.clone(),
                via: call.method.to_string(),
            };
            st.destroyed.push(record);
        }
        Ok(())
    }

    fn peek(&self, call: RefcountCall<'_>) -> Result<u32, NativeSignal> {
        let mut st = self.lock();
        st.scripted_failure(call.method)?;
        Ok(st.live_mut(call.handle)?.refcount)
    }

    fn destroy(
        &self,
        type_name: &str,
        handle: NativeHandle,
        free_function: Option<&str>,
    ) -> Result<(), NativeSignal> {
        let via = free_function.unwrap_or("delete");
        let mut st = self.lock();
        st.scripted_failure(via)?;
        let obj = st.live_mut(handle).map_err(|sig| {
            if sig.signature == SIGNAL_USE_AFTER_FREE {
                NativeSignal::new(SIGNAL_DOUBLE_FREE, format!("{type_name} {handle} freed twice"))
            } else {
                sig
            }
        })?;
        obj.alive = false;
        obj.refcount = 0;
        st.destroyed.push(DestroyRecord {
            handle,
            type_name: type_name.to_string(),
            via: via.to_string(),
        });
        Ok(())
    }
}
