//! Fluent Migrate - schema snapshots and tracked PostgreSQL migrations
//!
//! Declared tables are captured as a self-contained snapshot, compared with
//! the previously saved one, and every atomic difference becomes its own pair
//! of up/down SQL files. The runner applies those files in order, one
//! transaction each, and records them in `_fluent_migrations`.
//!
//! - Stage 1 (Snapshot): capture [`schema::TableSchema`] values
//! - Stage 2 (Diff): structural comparison by name
//! - Stage 3 (Generate): timestamped migration file pairs
//! - Stage 4 (Apply): tracked, checksummed execution with rollback

pub mod config;
pub mod db;
pub mod error;
pub mod migration;
pub mod pipeline;
pub mod schema;
pub mod snapshot;

pub use error::{MigrateError, MigrateResult};
pub use migration::{
    GeneratedMigration, GeneratorOptions, MigrationBackend, MigrationGenerator, MigrationRunner,
    PostgresBackend,
};
pub use pipeline::{generate_migrations, GenerationReport, SchemaPipeline};
pub use schema::{
    AutoGenerate, Field, FieldType, HasMany, Index, ReferentialAction, Relationship,
    RelationshipType, TableSchema,
};
pub use snapshot::{DatabaseSnapshot, DiffEngine, SchemaDiff, SnapshotStore};
