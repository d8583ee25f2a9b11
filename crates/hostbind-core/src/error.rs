use serde::Serialize;
use thiserror::Error;

use crate::bridge::HostError;
use crate::handle::{NativeHandle, ProxyRef};
use crate::native::NativeSignal;

pub type Result<T, E = LifetimeError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigErrorKind {
    Parse,
    SchemaVersion,
    Duplicate,
    UnknownType,
    UnknownError,
    ErrorCycle,
    AmbiguousOwner,
    MisplacedFlag,
    NothingToTransfer,
    CustodianOutOfRange,
    CustodianUnsupported,
    RefcountWithoutRefcountedMode,
    RefcountedWithoutMethods,
    FreeFunctionMisplaced,
    ConstructorShape,
}

impl ConfigErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ConfigErrorKind::Parse => "HB-CFG-0001",
            ConfigErrorKind::SchemaVersion => "HB-CFG-0002",
            ConfigErrorKind::Duplicate => "HB-CFG-0003",
            ConfigErrorKind::UnknownType => "HB-CFG-0004",
            ConfigErrorKind::UnknownError => "HB-CFG-0005",
            ConfigErrorKind::ErrorCycle => "HB-CFG-0006",
            ConfigErrorKind::AmbiguousOwner => "HB-CFG-0010",
            ConfigErrorKind::MisplacedFlag => "HB-CFG-0011",
            ConfigErrorKind::NothingToTransfer => "HB-CFG-0012",
            ConfigErrorKind::CustodianOutOfRange => "HB-CFG-0020",
            ConfigErrorKind::CustodianUnsupported => "HB-CFG-0021",
            ConfigErrorKind::RefcountWithoutRefcountedMode => "HB-CFG-0030",
            ConfigErrorKind::RefcountedWithoutMethods => "HB-CFG-0031",
            ConfigErrorKind::FreeFunctionMisplaced => "HB-CFG-0032",
            ConfigErrorKind::ConstructorShape => "HB-CFG-0040",
        }
    }
}

/// A malformed descriptor, detected once at load time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{subject}: {message}")]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    /// What the error is about, e.g. `type Zbr` or `call SomeObject::get_zbr()`.
    pub subject: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(kind: ConfigErrorKind, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// A runtime breach of the ownership contract. Always fatal for the offending call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("stale proxy reference {0}")]
    StaleProxy(ProxyRef),
    #[error("no descriptor for type {0:?}")]
    UnknownType(String),
    #[error("{call}: {message}")]
    FactMismatch { call: String, message: String },
    #[error("singleton {type_name} already wraps {existing}; refusing second instance {requested}")]
    SingletonConflict {
        type_name: String,
        existing: NativeHandle,
        requested: NativeHandle,
    },
    #[error("ownership of {type_name} {handle} was already transferred to native")]
    DoubleTransfer {
        type_name: String,
        handle: NativeHandle,
    },
    #[error("{type_name} {handle} cannot be transferred: the host does not own it")]
    TransferWithoutOwnership {
        type_name: String,
        handle: NativeHandle,
    },
    #[error("{type_name} {handle} is already owned by proxy {proxy}")]
    DoubleOwnership {
        type_name: String,
        handle: NativeHandle,
        proxy: ProxyRef,
    },
    #[error("custodian edge {ward} -> {custodian} would form a cycle")]
    CustodianCycle { ward: String, custodian: String },
    #[error("{proxy} ({type_name}) is not reference counted")]
    NotRefCounted { proxy: ProxyRef, type_name: String },
    #[error("disposition {0} does not produce a proxy")]
    NotWrappable(String),
}

impl InvariantViolation {
    pub fn kind(&self) -> &'static str {
        match self {
            InvariantViolation::StaleProxy(_) => "stale_proxy",
            InvariantViolation::UnknownType(_) => "unknown_type",
            InvariantViolation::FactMismatch { .. } => "fact_mismatch",
            InvariantViolation::SingletonConflict { .. } => "singleton_conflict",
            InvariantViolation::DoubleTransfer { .. } => "double_transfer",
            InvariantViolation::TransferWithoutOwnership { .. } => "transfer_without_ownership",
            InvariantViolation::DoubleOwnership { .. } => "double_ownership",
            InvariantViolation::CustodianCycle { .. } => "custodian_cycle",
            InvariantViolation::NotRefCounted { .. } => "not_ref_counted",
            InvariantViolation::NotWrappable(_) => "not_wrappable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifetimeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("double release of {proxy} ({type_name} {handle})")]
    DoubleRelease {
        proxy: ProxyRef,
        type_name: String,
        handle: NativeHandle,
    },
    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),
    #[error("unmapped native failure in {call}: {signal}")]
    UnmappedNativeFailure { call: String, signal: NativeSignal },
    #[error(transparent)]
    Domain(HostError),
}

impl LifetimeError {
    pub fn kind(&self) -> &'static str {
        match self {
            LifetimeError::Config(_) => "config_error",
            LifetimeError::DoubleRelease { .. } => "double_release",
            LifetimeError::Invariant(_) => "invariant_violation",
            LifetimeError::UnmappedNativeFailure { .. } => "unmapped_native_failure",
            LifetimeError::Domain(_) => "domain_error",
        }
    }

    /// Declared domain errors are the only recoverable kind; nothing is ever retried.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LifetimeError::Domain(_))
    }

    pub(crate) fn unmapped(call: impl Into<String>, signal: NativeSignal) -> Self {
        LifetimeError::UnmappedNativeFailure {
            call: call.into(),
            signal,
        }
    }
}

impl From<HostError> for LifetimeError {
    fn from(err: HostError) -> Self {
        LifetimeError::Domain(err)
    }
}
