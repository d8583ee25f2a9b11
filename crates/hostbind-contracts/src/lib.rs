//! Shared, version-pinned document identifiers.
//!
//! These constants are the single source of truth for schema/version strings that
//! appear in machine-readable I/O: descriptor tables consumed at startup, session
//! scripts replayed by the CLI, and the reports it prints.

pub const DESCRIPTOR_TABLE_SCHEMA_VERSION: &str = "hostbind.descriptors@0.1.0";
pub const SESSION_SCRIPT_SCHEMA_VERSION: &str = "hostbind.session@0.1.0";

pub const CHECK_REPORT_SCHEMA_VERSION: &str = "hostbind.check.report@0.1.0";
pub const REPLAY_REPORT_SCHEMA_VERSION: &str = "hostbind.replay.report@0.1.0";
pub const STATE_SNAPSHOT_SCHEMA_VERSION: &str = "hostbind.state@0.1.0";
