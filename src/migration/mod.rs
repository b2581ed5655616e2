//! Migration files
//!
//! Generating up/down SQL pairs from a schema diff and applying them to a
//! database with a tracking table.

pub mod backend;
pub mod generator;
pub mod runner;
pub mod sql;

pub use backend::{AppliedMigration, MigrationBackend, PostgresBackend};
pub use generator::{GeneratedMigration, GeneratorOptions, MigrationGenerator, MigrationKind};
pub use runner::{MigrateReport, MigrationInfo, MigrationRunner, RollbackOutcome, StatusReport};

use sha2::{Digest, Sha256};

/// Table recording applied migrations
pub const TRACKING_TABLE: &str = "_fluent_migrations";

/// Suffix distinguishing a down file from its up file
pub const DOWN_SUFFIX: &str = "_down.sql";

/// Extension of every migration file
pub const SQL_EXTENSION: &str = ".sql";

/// Numeric prefix of a migration file name, up to the first `_`
pub fn parse_timestamp(file_name: &str) -> Option<i64> {
    let (prefix, _) = file_name.split_once('_')?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    prefix.parse().ok()
}

/// SHA-256 of migration content, lowercase hex
pub fn checksum(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("{:x}", digest)
}
