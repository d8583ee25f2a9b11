use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::RefcountStyle;
use crate::handle::NativeHandle;

/// An error raised by native code while a boundary call was in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeSignal {
    /// Native error signature, e.g. `std::domain_error`.
    pub signature: String,
    pub message: String,
}

impl NativeSignal {
    pub fn new(signature: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for NativeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.signature, self.message)
    }
}

/// One dispatch of a refcount protocol method.
#[derive(Debug, Clone, Copy)]
pub struct RefcountCall<'a> {
    pub type_name: &'a str,
    pub handle: NativeHandle,
    /// Native method or function name taken from the type's refcount methods.
    pub method: &'a str,
    pub style: RefcountStyle,
}

/// The native side of the boundary, as seen by the manager.
///
/// Implementations are called with the manager's registry lock held, so they
/// must not call back into the manager.
pub trait NativeRuntime {
    fn incref(&self, call: RefcountCall<'_>) -> Result<(), NativeSignal>;

    /// Decrements the native count; reaching zero destroys the object natively.
    fn decref(&self, call: RefcountCall<'_>) -> Result<(), NativeSignal>;

    fn peek(&self, call: RefcountCall<'_>) -> Result<u32, NativeSignal>;

    /// Destroys an owned object, through `free_function` when the type names one.
    fn destroy(
        &self,
        type_name: &str,
        handle: NativeHandle,
        free_function: Option<&str>,
    ) -> Result<(), NativeSignal>;
}
