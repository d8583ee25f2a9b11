use std::collections::BTreeMap;

use hostbind_contracts::CHECK_REPORT_SCHEMA_VERSION;
use serde::Serialize;
use serde_json::Value;

use crate::descriptor::{CallKind, OwnershipMode};
use crate::error::ConfigError;
use crate::table::DescriptorDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub code: String,
    pub severity: Severity,
    pub subject: String,
    pub message: String,
}

impl From<&ConfigError> for Diagnostic {
    fn from(err: &ConfigError) -> Self {
        Self {
            code: err.kind.code().to_string(),
            severity: Severity::Error,
            subject: err.subject.clone(),
            message: err.message.clone(),
        }
    }
}

/// Findings that do not stop a table from loading.
pub fn lint_warnings(doc: &DescriptorDocument) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    for t in &doc.types {
        if t.is_singleton && t.ownership_mode == OwnershipMode::Owned {
            out.push(Diagnostic {
                code: "HB-LINT-0001".to_string(),
                severity: Severity::Warning,
                subject: format!("type {}", t.name),
                message: "singletons are never destroyed natively; owned mode has no effect"
                    .to_string(),
            });
        }
    }
    for call in &doc.calls {
        let hidden = doc
            .types
            .iter()
            .any(|t| t.name == call.owner && t.is_singleton);
        if hidden && call.kind == CallKind::Constructor {
            out.push(Diagnostic {
                code: "HB-LINT-0002".to_string(),
                severity: Severity::Warning,
                subject: format!("call {}", call.label()),
                message: "constructor of a singleton type; requests resolve to the existing instance"
                    .to_string(),
            });
        }
    }
    out
}

/// Result of linting a descriptor table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub schema_version: String,
    pub ok: bool,
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
}

impl CheckReport {
    pub fn ok() -> Self {
        Self {
            schema_version: CHECK_REPORT_SCHEMA_VERSION.to_string(),
            ok: true,
            diagnostics: Vec::new(),
            meta: BTreeMap::new(),
        }
    }

    pub fn with_errors(self, errors: &[ConfigError]) -> Self {
        self.with_diagnostics(errors.iter().map(Diagnostic::from).collect())
    }

    pub fn with_diagnostics(mut self, mut diagnostics: Vec<Diagnostic>) -> Self {
        diagnostics.sort_by(|a, b| {
            a.subject
                .cmp(&b.subject)
                .then_with(|| a.code.cmp(&b.code))
                .then_with(|| a.message.cmp(&b.message))
        });
        self.ok = diagnostics.iter().all(|d| d.severity != Severity::Error);
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.meta.insert(key.to_string(), value);
        self
    }
}
