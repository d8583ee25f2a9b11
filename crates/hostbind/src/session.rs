//! Session scripts: a recorded sequence of boundary events replayed against
//! the simulated native heap.

use std::path::Path;

use anyhow::{Context, Result};
use hostbind_contracts::SESSION_SCRIPT_SCHEMA_VERSION;
use hostbind_core::NativeHandle;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionScript {
    pub schema_version: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// How a value is presented to a call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgRef {
    Null,
    Plain,
    /// A proxy bound to a name by an earlier step.
    Proxy(String),
    /// A raw handle written by the native side.
    Handle(NativeHandle),
    /// The raw handle of an object bound by an earlier `alloc`.
    Native(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Action {
    Alloc {
        #[serde(rename = "type")]
        type_name: String,
        bind: String,
        #[serde(default)]
        at: Option<NativeHandle>,
    },
    Call {
        owner: String,
        signature: String,
        #[serde(default)]
        receiver: Option<String>,
        #[serde(default)]
        args: Vec<ArgRef>,
        #[serde(default, rename = "return")]
        ret: Option<ArgRef>,
        /// Binds the proxy produced for the return value.
        #[serde(default)]
        bind: Option<String>,
    },
    Raise {
        owner: String,
        signature: String,
        error: String,
        #[serde(default)]
        message: String,
    },
    Incref {
        proxy: String,
    },
    Decref {
        proxy: String,
    },
    Peek {
        proxy: String,
    },
    Finalize {
        proxy: String,
    },
    Shutdown,
}

impl Action {
    pub fn op(&self) -> &'static str {
        match self {
            Action::Alloc { .. } => "alloc",
            Action::Call { .. } => "call",
            Action::Raise { .. } => "raise",
            Action::Incref { .. } => "incref",
            Action::Decref { .. } => "decref",
            Action::Peek { .. } => "peek",
            Action::Finalize { .. } => "finalize",
            Action::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub action: Action,
    /// Error kind the step must fail with, either the error class
    /// (`invariant_violation`) or the violation (`double_transfer`).
    #[serde(default)]
    pub expect_error: Option<String>,
}

pub fn load_session(path: &Path) -> Result<SessionScript> {
    let bytes = std::fs::read(path).with_context(|| format!("read: {}", path.display()))?;
    let script: SessionScript = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse session script: {}", path.display()))?;
    if script.schema_version != SESSION_SCRIPT_SCHEMA_VERSION {
        anyhow::bail!(
            "session schema_version mismatch: expected {SESSION_SCRIPT_SCHEMA_VERSION} got {:?}",
            script.schema_version
        );
    }
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_parse_with_expectations() {
        let script: SessionScript = serde_json::from_str(
            r#"{
              "schema_version": "hostbind.session@0.1.0",
              "steps": [
                {"op": "alloc", "type": "Foo", "bind": "h", "at": "0xa1"},
                {"op": "call", "owner": "mod", "signature": "consumeFoo(Foo*)",
                 "args": [{"native": "h"}, "null", {"handle": 16}], "expect_error": "double_transfer"},
                {"op": "shutdown"}
              ]
            }"#,
        )
        .unwrap();
        assert_eq!(script.steps.len(), 3);
        match &script.steps[0].action {
            Action::Alloc { at, .. } => assert_eq!(*at, Some(NativeHandle(0xa1))),
            other => panic!("unexpected {other:?}"),
        }
        match &script.steps[1].action {
            Action::Call { args, .. } => assert_eq!(
                args,
                &vec![
                    ArgRef::Native("h".to_string()),
                    ArgRef::Null,
                    ArgRef::Handle(NativeHandle(16)),
                ]
            ),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(script.steps[1].expect_error.as_deref(), Some("double_transfer"));
        assert_eq!(script.steps[2].action.op(), "shutdown");
    }

    #[test]
    fn unknown_ops_are_rejected() {
        let err = serde_json::from_str::<SessionScript>(
            r#"{"schema_version": "hostbind.session@0.1.0", "steps": [{"op": "free", "proxy": "x"}]}"#,
        );
        assert!(err.is_err());
    }
}
