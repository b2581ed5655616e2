//! Generation pipeline
//!
//! load previous snapshot -> capture current schema -> diff -> write migration
//! files -> persist the new snapshot. The snapshot is only replaced once every
//! file has been written, and files written by a run that fails are removed
//! again, so a failed run can simply be repeated.

use crate::error::MigrateResult;
use crate::migration::{GeneratedMigration, GeneratorOptions, MigrationGenerator};
use crate::schema::TableSchema;
use crate::snapshot::{DatabaseSnapshot, DiffEngine, DiffSummary, SnapshotStore};
use std::path::PathBuf;
use tracing::{debug, error, info};

/// Outcome of one generation run
#[derive(Debug, Clone, Default)]
pub struct GenerationReport {
    pub summary: DiffSummary,
    pub migrations: Vec<GeneratedMigration>,
}

impl GenerationReport {
    pub fn has_changes(&self) -> bool {
        self.summary.total_changes > 0
    }
}

/// Snapshot store plus migration generator
#[derive(Debug, Clone)]
pub struct SchemaPipeline {
    store: SnapshotStore,
    generator: MigrationGenerator,
}

impl SchemaPipeline {
    pub fn new(store: SnapshotStore, generator: MigrationGenerator) -> Self {
        Self { store, generator }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Run the pipeline with the current wall-clock time
    pub async fn run(&self, tables: &[TableSchema]) -> MigrateResult<GenerationReport> {
        self.run_at(tables, chrono::Utc::now().timestamp()).await
    }

    /// Run the pipeline, stamping the snapshot and the first migration with `now`
    pub async fn run_at(&self, tables: &[TableSchema], now: i64) -> MigrateResult<GenerationReport> {
        let previous = self.store.load().await?;
        let current = DatabaseSnapshot::capture_at(tables, now)?;
        let diff = DiffEngine::diff(previous.as_ref(), &current);

        if !diff.has_changes() {
            // has_many declarations carry no DDL but still belong in the record
            if previous.as_ref().is_some_and(|prev| prev.tables != current.tables) {
                debug!("Metadata-only schema change, refreshing snapshot");
                self.store.save(&current).await?;
            }
            info!("Schema unchanged, no migrations generated");
            return Ok(GenerationReport::default());
        }

        let migrations = self.generator.generate_at(&diff, current.created_at).await?;
        if let Err(e) = self.store.save(&current).await {
            error!("Failed to save snapshot, removing {} new migrations: {}", migrations.len(), e);
            self.generator.discard(&migrations).await;
            return Err(e);
        }

        let summary = diff.summary();
        info!(
            "Generated {} migrations for {} changes",
            migrations.len(),
            summary.total_changes
        );

        Ok(GenerationReport { summary, migrations })
    }
}

/// One-shot helper: diff `tables` against the snapshot at `snapshot_path` and
/// write migrations into `migrations_dir`
pub async fn generate_migrations(
    tables: &[TableSchema],
    snapshot_path: impl Into<PathBuf>,
    migrations_dir: impl Into<PathBuf>,
    options: GeneratorOptions,
) -> MigrateResult<GenerationReport> {
    let pipeline = SchemaPipeline::new(
        SnapshotStore::new(snapshot_path),
        MigrationGenerator::new(migrations_dir).with_options(options),
    );
    pipeline.run(tables).await
}
