//! Migration runner
//!
//! Applies pending up files in timestamp order, one transaction per
//! migration, and rolls back the most recently applied one on request.
//! A failed migration is rolled back and counted; the run continues with the
//! next file.

use crate::error::{MigrateError, MigrateResult};
use crate::migration::backend::{AppliedMigration, MigrationBackend};
use crate::migration::{checksum, parse_timestamp, DOWN_SUFFIX, SQL_EXTENSION};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// An up file found in the migrations directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    /// File stem; the name recorded in the tracking table
    pub name: String,
    pub path: PathBuf,
    pub timestamp: i64,
}

impl MigrationInfo {
    pub fn down_path(&self) -> PathBuf {
        self.path.with_file_name(format!("{}{}", self.name, DOWN_SUFFIX))
    }
}

/// `DOWN_SUFFIX` without the extension
const DOWN_STEM_SUFFIX: &str = "_down";

/// List up files in `dir`, ascending by timestamp.
///
/// Non-SQL files and names without a numeric prefix are skipped. `S_down.sql`
/// is the down file of `S.sql` when that file exists; otherwise it is an up
/// file in its own right, as long as it has a down file of its own.
pub async fn scan_migrations(dir: &Path) -> MigrateResult<Vec<MigrationInfo>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut candidates = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(stem) = file_name.strip_suffix(SQL_EXTENSION) else {
            continue;
        };
        let Some(timestamp) = parse_timestamp(file_name) else {
            debug!("Skipping {}: no timestamp prefix", file_name);
            continue;
        };

        candidates.push(MigrationInfo {
            name: stem.to_string(),
            path: entry.path(),
            timestamp,
        });
    }

    let stems: HashSet<String> = candidates.iter().map(|m| m.name.clone()).collect();
    let mut migrations: Vec<MigrationInfo> = candidates
        .into_iter()
        .filter(|m| match m.name.strip_suffix(DOWN_STEM_SUFFIX) {
            None => true,
            Some(up) if stems.contains(up) => false,
            Some(_) if stems.contains(&format!("{}{}", m.name, DOWN_STEM_SUFFIX)) => true,
            Some(_) => {
                warn!("Skipping {}: down file without a matching up file", m.path.display());
                false
            }
        })
        .collect();

    migrations.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.name.cmp(&b.name)));
    Ok(migrations)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFailure {
    pub name: String,
    pub error: String,
}

/// Result of one `migrate` run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrateReport {
    /// Names applied during this run, in order
    pub applied: Vec<String>,
    pub skipped: usize,
    pub errors: usize,
    pub failures: Vec<MigrationFailure>,
}

/// Applied vs. pending state, computed without touching the database
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<MigrationInfo>,
    /// Applied migrations whose file content no longer matches the recorded checksum
    pub modified: Vec<String>,
    /// Applied migrations with no file on disk
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    RolledBack { name: String },
    NothingToRollBack,
    /// The down migration could not run; the tracking row is left in place
    Failed { name: String, reason: String },
}

enum TrackingUpdate<'a> {
    Record { name: &'a str, checksum: &'a str },
    Remove { name: &'a str },
}

/// Applies migration files through a [`MigrationBackend`]
pub struct MigrationRunner<B> {
    backend: B,
    migrations_dir: PathBuf,
}

impl<B: MigrationBackend> MigrationRunner<B> {
    pub fn new(backend: B, migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            migrations_dir: migrations_dir.into(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    pub async fn ensure_migrations_table(&mut self) -> MigrateResult<()> {
        self.backend.ensure_tracking_table().await
    }

    /// Apply every pending migration.
    ///
    /// Applied migrations still on disk are verified against their recorded
    /// checksum first; any mismatch aborts before anything is applied.
    pub async fn migrate(&mut self) -> MigrateResult<MigrateReport> {
        self.ensure_migrations_table().await?;
        self.backend.lock().await?;
        let result = self.migrate_locked().await;
        self.release_lock().await;
        result
    }

    /// Roll back the most recently applied migration
    pub async fn rollback(&mut self) -> MigrateResult<RollbackOutcome> {
        self.ensure_migrations_table().await?;
        self.backend.lock().await?;
        let result = self.rollback_locked().await;
        self.release_lock().await;
        result
    }

    pub async fn status(&mut self) -> MigrateResult<StatusReport> {
        let migrations = scan_migrations(&self.migrations_dir).await?;
        let applied = if self.backend.tracking_table_exists().await? {
            self.backend.applied_migrations().await?
        } else {
            Vec::new()
        };

        let on_disk: HashMap<&str, &MigrationInfo> =
            migrations.iter().map(|m| (m.name.as_str(), m)).collect();
        let applied_names: HashSet<&str> = applied.iter().map(|a| a.name.as_str()).collect();

        let mut report = StatusReport::default();
        for row in &applied {
            match on_disk.get(row.name.as_str()) {
                Some(info) => {
                    let content = tokio::fs::read_to_string(&info.path).await?;
                    if checksum(&content) != row.checksum {
                        report.modified.push(row.name.clone());
                    }
                }
                None => report.missing.push(row.name.clone()),
            }
        }
        report.pending = migrations
            .iter()
            .filter(|m| !applied_names.contains(m.name.as_str()))
            .cloned()
            .collect();
        report.applied = applied;

        Ok(report)
    }

    async fn migrate_locked(&mut self) -> MigrateResult<MigrateReport> {
        let migrations = scan_migrations(&self.migrations_dir).await?;
        let applied: HashMap<String, AppliedMigration> = self
            .backend
            .applied_migrations()
            .await?
            .into_iter()
            .map(|a| (a.name.clone(), a))
            .collect();

        for migration in &migrations {
            if let Some(row) = applied.get(&migration.name) {
                let content = tokio::fs::read_to_string(&migration.path).await?;
                let actual = checksum(&content);
                if actual != row.checksum {
                    return Err(MigrateError::ChecksumMismatch {
                        name: migration.name.clone(),
                        expected: row.checksum.clone(),
                        actual,
                    });
                }
            }
        }

        let mut report = MigrateReport::default();
        for migration in &migrations {
            if applied.contains_key(&migration.name) {
                debug!("Skipping already applied migration {}", migration.name);
                report.skipped += 1;
                continue;
            }

            match self.apply(migration).await {
                Ok(()) => {
                    info!("Applied migration {}", migration.name);
                    report.applied.push(migration.name.clone());
                }
                Err(e) => {
                    warn!("Migration {} failed: {}", migration.name, e);
                    report.errors += 1;
                    report.failures.push(MigrationFailure {
                        name: migration.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    async fn apply(&mut self, migration: &MigrationInfo) -> MigrateResult<()> {
        let sql = tokio::fs::read_to_string(&migration.path).await?;
        let sum = checksum(&sql);
        self.run_in_transaction(
            &sql,
            TrackingUpdate::Record {
                name: &migration.name,
                checksum: &sum,
            },
        )
        .await
    }

    async fn rollback_locked(&mut self) -> MigrateResult<RollbackOutcome> {
        let Some(last) = self.backend.last_applied().await? else {
            return Ok(RollbackOutcome::NothingToRollBack);
        };

        let down_path = self
            .migrations_dir
            .join(format!("{}{}", last.name, DOWN_SUFFIX));
        let sql = match tokio::fs::read_to_string(&down_path).await {
            Ok(sql) => sql,
            Err(e) => {
                warn!("Cannot read {}: {}", down_path.display(), e);
                return Ok(RollbackOutcome::Failed {
                    name: last.name,
                    reason: format!("cannot read {}: {}", down_path.display(), e),
                });
            }
        };

        match self
            .run_in_transaction(&sql, TrackingUpdate::Remove { name: &last.name })
            .await
        {
            Ok(()) => {
                info!("Rolled back migration {}", last.name);
                Ok(RollbackOutcome::RolledBack { name: last.name })
            }
            Err(e) => {
                warn!("Rollback of {} failed: {}", last.name, e);
                Ok(RollbackOutcome::Failed {
                    name: last.name,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn run_in_transaction(
        &mut self,
        sql: &str,
        update: TrackingUpdate<'_>,
    ) -> MigrateResult<()> {
        self.backend.begin().await?;

        let result = self.transaction_body(sql, update).await;
        if result.is_err() {
            if let Err(e) = self.backend.rollback().await {
                error!("Failed to roll back transaction: {}", e);
            }
        }
        result
    }

    async fn transaction_body(&mut self, sql: &str, update: TrackingUpdate<'_>) -> MigrateResult<()> {
        self.backend.execute_script(sql).await?;
        match update {
            TrackingUpdate::Record { name, checksum } => {
                self.backend.record_applied(name, checksum).await?
            }
            TrackingUpdate::Remove { name } => self.backend.remove_applied(name).await?,
        }
        self.backend.commit().await
    }

    async fn release_lock(&mut self) {
        if let Err(e) = self.backend.unlock().await {
            warn!("Failed to release migration lock: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use pretty_assertions::assert_eq;

    struct Saved {
        rows: Vec<AppliedMigration>,
        executed: usize,
    }

    /// Tracking table and DDL log kept in memory. Scripts containing `FAIL`
    /// raise an execution error.
    #[derive(Default)]
    struct MemoryBackend {
        tracking_table: bool,
        rows: Vec<AppliedMigration>,
        executed: Vec<String>,
        transaction: Option<Saved>,
        clock: i64,
        locked: bool,
        locks_taken: usize,
    }

    #[async_trait]
    impl MigrationBackend for MemoryBackend {
        async fn ensure_tracking_table(&mut self) -> MigrateResult<()> {
            self.tracking_table = true;
            Ok(())
        }

        async fn tracking_table_exists(&mut self) -> MigrateResult<bool> {
            Ok(self.tracking_table)
        }

        async fn lock(&mut self) -> MigrateResult<()> {
            assert!(!self.locked, "lock is not reentrant");
            self.locked = true;
            self.locks_taken += 1;
            Ok(())
        }

        async fn unlock(&mut self) -> MigrateResult<()> {
            self.locked = false;
            Ok(())
        }

        async fn applied_migrations(&mut self) -> MigrateResult<Vec<AppliedMigration>> {
            Ok(self.rows.clone())
        }

        async fn last_applied(&mut self) -> MigrateResult<Option<AppliedMigration>> {
            Ok(self.rows.last().cloned())
        }

        async fn begin(&mut self) -> MigrateResult<()> {
            assert!(self.transaction.is_none(), "nested transaction");
            self.transaction = Some(Saved {
                rows: self.rows.clone(),
                executed: self.executed.len(),
            });
            Ok(())
        }

        async fn commit(&mut self) -> MigrateResult<()> {
            self.transaction.take();
            Ok(())
        }

        async fn rollback(&mut self) -> MigrateResult<()> {
            if let Some(saved) = self.transaction.take() {
                self.rows = saved.rows;
                self.executed.truncate(saved.executed);
            }
            Ok(())
        }

        async fn execute_script(&mut self, sql: &str) -> MigrateResult<()> {
            assert!(self.transaction.is_some(), "script outside transaction");
            self.executed.push(sql.to_string());
            if sql.contains("FAIL") {
                return Err(MigrateError::Execution("syntax error at or near \"FAIL\"".into()));
            }
            Ok(())
        }

        async fn record_applied(&mut self, name: &str, checksum: &str) -> MigrateResult<()> {
            if self.rows.iter().any(|r| r.name == name) {
                return Err(MigrateError::Execution(format!("duplicate migration name {}", name)));
            }
            self.clock += 1;
            self.rows.push(AppliedMigration {
                name: name.to_string(),
                checksum: checksum.to_string(),
                applied_at: DateTime::from_timestamp(1_700_000_000 + self.clock, 0).unwrap(),
            });
            Ok(())
        }

        async fn remove_applied(&mut self, name: &str) -> MigrateResult<()> {
            self.rows.retain(|r| r.name != name);
            Ok(())
        }
    }

    fn write(dir: &Path, name: &str, sql: &str) {
        std::fs::write(dir.join(name), sql).unwrap();
    }

    fn applied_names(runner: &MigrationRunner<MemoryBackend>) -> Vec<&str> {
        runner.backend().rows.iter().map(|r| r.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_scan_orders_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "300_c.sql", "");
        write(dir.path(), "20_x.sql", "");
        write(dir.path(), "20_x_down.sql", "");
        write(dir.path(), "notes.sql", "");
        write(dir.path(), "README.md", "");

        let scanned = scan_migrations(dir.path()).await.unwrap();
        let names: Vec<&str> = scanned.iter().map(|m| m.name.as_str()).collect();

        assert_eq!(names, vec!["20_x", "300_c"]);
        assert_eq!(scanned[0].timestamp, 20);
        assert_eq!(scanned[0].down_path(), dir.path().join("20_x_down.sql"));
    }

    #[tokio::test]
    async fn test_scan_keeps_up_files_whose_name_ends_in_down() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "100_create_touch_down.sql", "");
        write(dir.path(), "100_create_touch_down_down.sql", "");
        write(dir.path(), "200_x.sql", "");
        write(dir.path(), "200_x_down.sql", "");
        write(dir.path(), "300_orphan_down.sql", "");

        let scanned = scan_migrations(dir.path()).await.unwrap();
        let names: Vec<&str> = scanned.iter().map(|m| m.name.as_str()).collect();

        assert_eq!(names, vec!["100_create_touch_down", "200_x"]);
        assert_eq!(
            scanned[0].down_path(),
            dir.path().join("100_create_touch_down_down.sql")
        );
    }

    #[tokio::test]
    async fn test_generated_down_named_entities_are_applied() {
        use crate::migration::MigrationGenerator;
        use crate::schema::{Field, FieldType, TableSchema};
        use crate::snapshot::{DatabaseSnapshot, DiffEngine};

        let dir = tempfile::tempdir().unwrap();
        let before = DatabaseSnapshot::capture_at(
            &[TableSchema::builder("users")
                .field(Field::new("id", FieldType::Uuid).primary_key())
                .build()
                .unwrap()],
            1,
        )
        .unwrap();
        let after = DatabaseSnapshot::capture_at(
            &[
                TableSchema::builder("users")
                    .field(Field::new("id", FieldType::Uuid).primary_key())
                    .field(Field::new("count_down", FieldType::Integer).nullable())
                    .build()
                    .unwrap(),
                TableSchema::builder("touch_down")
                    .field(Field::new("id", FieldType::Integer).primary_key())
                    .build()
                    .unwrap(),
            ],
            2,
        )
        .unwrap();

        let generated = MigrationGenerator::new(dir.path())
            .generate_at(&DiffEngine::diff(Some(&before), &after), 100)
            .await
            .unwrap();
        let expected: Vec<String> = generated.iter().map(|g| g.name.clone()).collect();
        assert_eq!(
            expected,
            vec!["100_create_touch_down".to_string(), "101_users_add_column_count_down".to_string()]
        );

        let mut runner = MigrationRunner::new(MemoryBackend::default(), dir.path());
        let report = runner.migrate().await.unwrap();

        assert_eq!(report.applied, expected);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn test_scan_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = scan_migrations(&dir.path().join("absent")).await;
        assert!(matches!(result, Err(MigrateError::Io(_))));
    }

    #[tokio::test]
    async fn test_migrate_applies_in_order_then_skips() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "200_b.sql", "CREATE TABLE b (id INTEGER);");
        write(dir.path(), "100_a.sql", "CREATE TABLE a (id INTEGER);");
        write(dir.path(), "100_a_down.sql", "DROP TABLE a;");

        let mut runner = MigrationRunner::new(MemoryBackend::default(), dir.path());
        let report = runner.migrate().await.unwrap();

        assert_eq!(report.applied, vec!["100_a", "200_b"]);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.errors, 0);
        assert_eq!(applied_names(&runner), vec!["100_a", "200_b"]);
        assert_eq!(
            runner.backend().executed,
            vec!["CREATE TABLE a (id INTEGER);", "CREATE TABLE b (id INTEGER);"]
        );
        assert_eq!(runner.backend().rows[0].checksum, checksum("CREATE TABLE a (id INTEGER);"));

        let second = runner.migrate().await.unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.skipped, 2);
        assert_eq!(runner.backend().rows.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_migration_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "100_a.sql", "CREATE TABLE a (id INTEGER);");
        write(dir.path(), "200_b.sql", "CREATE TABLE b (FAIL);");
        write(dir.path(), "300_c.sql", "CREATE TABLE c (id INTEGER);");

        let mut runner = MigrationRunner::new(MemoryBackend::default(), dir.path());
        let report = runner.migrate().await.unwrap();

        assert_eq!(report.applied, vec!["100_a", "300_c"]);
        assert_eq!(report.errors, 1);
        assert_eq!(report.failures[0].name, "200_b");
        assert_eq!(applied_names(&runner), vec!["100_a", "300_c"]);
        assert!(runner.backend().executed.iter().all(|sql| !sql.contains("FAIL")));
        assert!(runner.backend().transaction.is_none());
        assert!(!runner.backend().locked);
        assert_eq!(runner.backend().locks_taken, 1);
    }

    #[tokio::test]
    async fn test_changed_applied_file_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "100_a.sql", "CREATE TABLE a (id INTEGER);");

        let mut runner = MigrationRunner::new(MemoryBackend::default(), dir.path());
        runner.migrate().await.unwrap();

        write(dir.path(), "100_a.sql", "CREATE TABLE a (id BIGINT);");
        write(dir.path(), "200_b.sql", "CREATE TABLE b (id INTEGER);");

        let status = runner.status().await.unwrap();
        assert_eq!(status.modified, vec!["100_a"]);

        let result = runner.migrate().await;
        match result {
            Err(MigrateError::ChecksumMismatch { name, .. }) => assert_eq!(name, "100_a"),
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
        assert_eq!(applied_names(&runner), vec!["100_a"]);
        assert!(!runner.backend().locked);
    }

    #[tokio::test]
    async fn test_rollback_latest() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "100_a.sql", "CREATE TABLE a (id INTEGER);");
        write(dir.path(), "200_b.sql", "CREATE TABLE b (id INTEGER);");
        write(dir.path(), "200_b_down.sql", "DROP TABLE b;");

        let mut runner = MigrationRunner::new(MemoryBackend::default(), dir.path());
        runner.migrate().await.unwrap();

        let outcome = runner.rollback().await.unwrap();
        assert_eq!(outcome, RollbackOutcome::RolledBack { name: "200_b".into() });
        assert_eq!(applied_names(&runner), vec!["100_a"]);
        assert_eq!(runner.backend().executed.last().unwrap(), "DROP TABLE b;");

        let status = runner.status().await.unwrap();
        assert_eq!(status.pending.len(), 1);
        assert_eq!(status.pending[0].name, "200_b");
    }

    #[tokio::test]
    async fn test_rollback_without_down_file_keeps_row() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "100_a.sql", "CREATE TABLE a (id INTEGER);");

        let mut runner = MigrationRunner::new(MemoryBackend::default(), dir.path());
        runner.migrate().await.unwrap();

        let outcome = runner.rollback().await.unwrap();
        assert!(matches!(outcome, RollbackOutcome::Failed { ref name, .. } if name == "100_a"));
        assert_eq!(applied_names(&runner), vec!["100_a"]);
    }

    #[tokio::test]
    async fn test_failing_down_sql_keeps_row() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "100_a.sql", "CREATE TABLE a (id INTEGER);");
        write(dir.path(), "100_a_down.sql", "DROP FAIL;");

        let mut runner = MigrationRunner::new(MemoryBackend::default(), dir.path());
        runner.migrate().await.unwrap();

        let outcome = runner.rollback().await.unwrap();
        assert!(matches!(outcome, RollbackOutcome::Failed { .. }));
        assert_eq!(applied_names(&runner), vec!["100_a"]);
        assert_eq!(runner.backend().executed.len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_with_nothing_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MigrationRunner::new(MemoryBackend::default(), dir.path());

        assert_eq!(runner.rollback().await.unwrap(), RollbackOutcome::NothingToRollBack);
    }

    #[tokio::test]
    async fn test_status_does_not_mutate() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "100_a.sql", "CREATE TABLE a (id INTEGER);");
        write(dir.path(), "200_b.sql", "CREATE TABLE b (id INTEGER);");

        let mut runner = MigrationRunner::new(MemoryBackend::default(), dir.path());
        let status = runner.status().await.unwrap();

        assert!(status.applied.is_empty());
        assert_eq!(status.pending.len(), 2);
        assert!(!runner.backend().tracking_table);
        assert!(runner.backend().executed.is_empty());
        assert_eq!(runner.backend().locks_taken, 0);
    }

    #[tokio::test]
    async fn test_status_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "100_a.sql", "CREATE TABLE a (id INTEGER);");

        let mut runner = MigrationRunner::new(MemoryBackend::default(), dir.path());
        runner.migrate().await.unwrap();
        std::fs::remove_file(dir.path().join("100_a.sql")).unwrap();

        let status = runner.status().await.unwrap();
        assert_eq!(status.missing, vec!["100_a"]);
        assert!(status.pending.is_empty());
    }
}
