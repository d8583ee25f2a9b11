//! Cross-boundary object lifetime and ownership manager.
//!
//! Native objects (manual allocation, explicit destructors, intrusive reference
//! counts) are exposed to a garbage-collected host through proxies. For every
//! value crossing the boundary this crate decides which side owns the native
//! resource, keeps native reference counts consistent with proxy lifetimes, and
//! records custodian/ward edges so a dependent proxy outlives nothing it needs.
//!
//! The surface presented to a call trampoline is [`Manager`]:
//! [`Manager::resolve_call`], [`Manager::create_or_reuse_proxy`],
//! [`Manager::finalize_proxy`] and [`Manager::bridge_error`].

pub mod bridge;
pub mod config;
pub mod descriptor;
pub mod diagnostics;
pub mod error;
pub mod graph;
pub mod handle;
pub mod manager;
pub mod native;
pub mod refcount;
pub mod registry;
pub mod resolver;
pub mod sim;
pub mod table;

pub use bridge::HostError;
pub use config::{ConfigEnvError, ManagerConfig, TransferPolicy};
pub use descriptor::{
    CallDescriptor, CallKind, Direction, ErrorDescriptor, OwnershipMode, RefcountMethods,
    RefcountStyle, TypeDescriptor, ValueDescriptor,
};
pub use diagnostics::{CheckReport, Diagnostic, Severity};
pub use error::{ConfigError, ConfigErrorKind, InvariantViolation, LifetimeError, Result};
pub use handle::{NativeHandle, ProxyRef};
pub use manager::{FinalizeAction, Finalization, Manager};
pub use native::{NativeRuntime, NativeSignal, RefcountCall};
pub use refcount::DecrefOutcome;
pub use registry::{ProxyInfo, StateSnapshot, TransferredHandle};
pub use resolver::{ArgFact, CallFacts, CallResolution, Disposition, Position, ResolvedValue};
pub use sim::{DestroyRecord, LiveObject, SimHeap};
pub use table::{DescriptorDocument, DescriptorTable, TypeIndex};
