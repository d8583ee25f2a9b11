use serde::Serialize;
use thiserror::Error;

use crate::descriptor::CallDescriptor;
use crate::error::{LifetimeError, Result};
use crate::native::NativeSignal;
use crate::table::DescriptorTable;

/// A declared native error, as raised on the host side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{kind}: {message}")]
pub struct HostError {
    pub kind: String,
    pub message: String,
    /// The native signature that was raised.
    pub signature: String,
}

/// Maps `signal` to a host error if the call declares its signature or one of
/// its ancestors. Anything else is an unmapped native failure.
pub(crate) fn bridge_error(
    table: &DescriptorTable,
    call: &CallDescriptor,
    signal: &NativeSignal,
) -> Result<HostError> {
    let unmapped = || LifetimeError::unmapped(call.label(), signal.clone());
    let Some(raised) = table.error(&signal.signature) else {
        return Err(unmapped());
    };

    let mut cur = Some(raised);
    while let Some(err) = cur {
        if call.throws.iter().any(|t| *t == err.name) {
            return Ok(HostError {
                kind: raised.host_kind.clone(),
                message: signal.message.clone(),
                signature: raised.name.clone(),
            });
        }
        cur = err.parent.as_deref().and_then(|p| table.error(p));
    }
    Err(unmapped())
}
