use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const ENV_TRANSFER_POLICY: &str = "HOSTBIND_TRANSFER_POLICY";
pub const ENV_PEEK_REFCOUNTS: &str = "HOSTBIND_PEEK_REFCOUNTS";

/// What happens to a host proxy once its resource is transferred to native.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TransferPolicy {
    /// The proxy is removed; later use reports a stale reference.
    #[default]
    Invalidate,
    /// The proxy stays alive as a borrowed view.
    Downgrade,
}

impl TransferPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferPolicy::Invalidate => "invalidate",
            TransferPolicy::Downgrade => "downgrade",
        }
    }
}

impl fmt::Display for TransferPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigEnvError {
    #[error("invalid transfer policy {0:?} (expected one of: invalidate, downgrade)")]
    TransferPolicy(String),
    #[error("invalid environment variable {name}={value:?} (expected one of: 1, 0, true, false, yes, no)")]
    Bool { name: String, value: String },
}

impl FromStr for TransferPolicy {
    type Err = ConfigEnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "invalidate" => Ok(TransferPolicy::Invalidate),
            "downgrade" => Ok(TransferPolicy::Downgrade),
            other => Err(ConfigEnvError::TransferPolicy(other.to_string())),
        }
    }
}

#[cfg(feature = "clap")]
impl clap::ValueEnum for TransferPolicy {
    fn value_variants<'a>() -> &'a [Self] {
        const ALL: [TransferPolicy; 2] = [TransferPolicy::Invalidate, TransferPolicy::Downgrade];
        &ALL
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    pub transfer_policy: TransferPolicy,
    /// Re-read native counts through the type's peek method after every
    /// adjustment instead of trusting arithmetic.
    pub peek_refcounts: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            transfer_policy: TransferPolicy::Invalidate,
            peek_refcounts: true,
        }
    }
}

fn parse_bool_env(name: &str, raw: &str) -> Result<bool, ConfigEnvError> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Ok(false),
        other => Err(ConfigEnvError::Bool {
            name: name.to_string(),
            value: other.to_string(),
        }),
    }
}

impl ManagerConfig {
    pub fn from_env() -> Result<Self, ConfigEnvError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigEnvError> {
        let mut cfg = Self::default();
        if let Some(raw) = lookup(ENV_TRANSFER_POLICY) {
            cfg.transfer_policy = raw.parse()?;
        }
        if let Some(raw) = lookup(ENV_PEEK_REFCOUNTS) {
            cfg.peek_refcounts = parse_bool_env(ENV_PEEK_REFCOUNTS, &raw)?;
        }
        Ok(cfg)
    }
}
