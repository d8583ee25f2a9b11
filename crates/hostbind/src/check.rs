use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use hostbind_core::diagnostics::lint_warnings;
use hostbind_core::{
    CheckReport, ConfigError, ConfigErrorKind, DescriptorDocument, DescriptorTable, Diagnostic,
};
use serde_json::json;

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Descriptor table to validate.
    #[arg(value_name = "DESCRIPTORS")]
    pub descriptors: PathBuf,

    /// Treat lint warnings as failures.
    #[arg(long)]
    pub deny_warnings: bool,
}

/// Reads and validates a descriptor table; any configuration error aborts.
pub fn load_table(path: &Path) -> Result<DescriptorTable> {
    let bytes = std::fs::read(path).with_context(|| format!("read: {}", path.display()))?;
    DescriptorTable::from_json(&bytes)
        .with_context(|| format!("load descriptor table: {}", path.display()))
}

pub fn check_bytes(bytes: &[u8]) -> CheckReport {
    let doc: DescriptorDocument = match serde_json::from_slice(bytes) {
        Ok(doc) => doc,
        Err(err) => {
            let err = ConfigError::new(ConfigErrorKind::Parse, "descriptor table", err.to_string());
            return CheckReport::ok().with_errors(&[err]);
        }
    };
    let mut diagnostics: Vec<Diagnostic> = DescriptorTable::diagnose(&doc)
        .iter()
        .map(Diagnostic::from)
        .collect();
    diagnostics.extend(lint_warnings(&doc));
    CheckReport::ok()
        .with_diagnostics(diagnostics)
        .with_meta("types", json!(doc.types.len()))
        .with_meta("errors", json!(doc.errors.len()))
        .with_meta("calls", json!(doc.calls.len()))
}

pub fn cmd_check(args: CheckArgs) -> Result<std::process::ExitCode> {
    let bytes = std::fs::read(&args.descriptors)
        .with_context(|| format!("read: {}", args.descriptors.display()))?;
    let report = check_bytes(&bytes);
    println!("{}", serde_json::to_string_pretty(&report)?);

    let failed = !report.ok || (args.deny_warnings && !report.diagnostics.is_empty());
    Ok(if failed {
        std::process::ExitCode::from(1)
    } else {
        std::process::ExitCode::SUCCESS
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_failures_are_reported_not_raised() {
        let report = check_bytes(b"{\"schema_version\": ");
        assert!(!report.ok);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].code, "HB-CFG-0001");
        assert!(report.meta.is_empty());
    }

    #[test]
    fn counts_land_in_meta() {
        let report = check_bytes(
            br#"{"schema_version": "hostbind.descriptors@0.1.0",
                 "types": [{"name": "Foo", "ownership_mode": "owned"}]}"#,
        );
        assert!(report.ok);
        assert_eq!(report.meta["types"], 1);
        assert_eq!(report.meta["calls"], 0);
    }
}
