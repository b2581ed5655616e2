//! Migration execution backend
//!
//! The runner talks to the database only through [`MigrationBackend`], so the
//! apply/rollback state machine can be driven by PostgreSQL in production and
//! by an in-memory double in tests.

use crate::error::MigrateResult;
use crate::migration::TRACKING_TABLE;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use deadpool_postgres::Object;
use tokio_postgres::Row;
use tracing::debug;

/// Session advisory lock key held while migrating ("fluentmg" in ASCII)
pub const ADVISORY_LOCK_KEY: i64 = 0x666c_7565_6e74_6d67;

/// A row of the tracking table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

/// SQL execution handle used by the migration runner
#[async_trait]
pub trait MigrationBackend: Send {
    /// Create the tracking table if it does not exist
    async fn ensure_tracking_table(&mut self) -> MigrateResult<()>;

    async fn tracking_table_exists(&mut self) -> MigrateResult<bool>;

    /// Acquire the session-level migration lock, waiting if another session holds it
    async fn lock(&mut self) -> MigrateResult<()>;

    async fn unlock(&mut self) -> MigrateResult<()>;

    /// All applied migrations, oldest first
    async fn applied_migrations(&mut self) -> MigrateResult<Vec<AppliedMigration>>;

    /// Most recently applied migration
    async fn last_applied(&mut self) -> MigrateResult<Option<AppliedMigration>>;

    async fn begin(&mut self) -> MigrateResult<()>;

    async fn commit(&mut self) -> MigrateResult<()>;

    async fn rollback(&mut self) -> MigrateResult<()>;

    /// Execute a migration body, which may hold several statements
    async fn execute_script(&mut self, sql: &str) -> MigrateResult<()>;

    async fn record_applied(&mut self, name: &str, checksum: &str) -> MigrateResult<()>;

    async fn remove_applied(&mut self, name: &str) -> MigrateResult<()>;
}

/// Backend over a pooled PostgreSQL connection
///
/// Transactions are driven with plain `BEGIN`/`COMMIT`/`ROLLBACK` on the one
/// connection the backend owns, so every call between `begin` and `commit`
/// shares the transaction.
pub struct PostgresBackend {
    client: Object,
}

impl PostgresBackend {
    pub fn new(client: Object) -> Self {
        Self { client }
    }

    fn applied_from_row(row: &Row) -> AppliedMigration {
        let applied_at: NaiveDateTime = row.get("applied_at");
        AppliedMigration {
            name: row.get("name"),
            checksum: row.get("checksum"),
            applied_at: applied_at.and_utc(),
        }
    }
}

#[async_trait]
impl MigrationBackend for PostgresBackend {
    async fn ensure_tracking_table(&mut self) -> MigrateResult<()> {
        self.client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id SERIAL PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    checksum TEXT NOT NULL,
                    applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL
                )",
                TRACKING_TABLE
            ))
            .await?;
        debug!("Tracking table {} ready", TRACKING_TABLE);
        Ok(())
    }

    async fn tracking_table_exists(&mut self) -> MigrateResult<bool> {
        let row = self
            .client
            .query_one("SELECT to_regclass($1) IS NOT NULL", &[&TRACKING_TABLE])
            .await?;
        Ok(row.get(0))
    }

    async fn lock(&mut self) -> MigrateResult<()> {
        self.client
            .execute("SELECT pg_advisory_lock($1)", &[&ADVISORY_LOCK_KEY])
            .await?;
        debug!("Acquired migration lock");
        Ok(())
    }

    async fn unlock(&mut self) -> MigrateResult<()> {
        self.client
            .execute("SELECT pg_advisory_unlock($1)", &[&ADVISORY_LOCK_KEY])
            .await?;
        debug!("Released migration lock");
        Ok(())
    }

    async fn applied_migrations(&mut self) -> MigrateResult<Vec<AppliedMigration>> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT name, checksum, applied_at FROM {} ORDER BY applied_at, id",
                    TRACKING_TABLE
                ),
                &[],
            )
            .await?;
        Ok(rows.iter().map(Self::applied_from_row).collect())
    }

    async fn last_applied(&mut self) -> MigrateResult<Option<AppliedMigration>> {
        let row = self
            .client
            .query_opt(
                &format!(
                    "SELECT name, checksum, applied_at FROM {} ORDER BY applied_at DESC, id DESC LIMIT 1",
                    TRACKING_TABLE
                ),
                &[],
            )
            .await?;
        Ok(row.as_ref().map(Self::applied_from_row))
    }

    async fn begin(&mut self) -> MigrateResult<()> {
        self.client.batch_execute("BEGIN").await?;
        Ok(())
    }

    async fn commit(&mut self) -> MigrateResult<()> {
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> MigrateResult<()> {
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    async fn execute_script(&mut self, sql: &str) -> MigrateResult<()> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    async fn record_applied(&mut self, name: &str, checksum: &str) -> MigrateResult<()> {
        self.client
            .execute(
                &format!("INSERT INTO {} (name, checksum) VALUES ($1, $2)", TRACKING_TABLE),
                &[&name, &checksum],
            )
            .await?;
        Ok(())
    }

    async fn remove_applied(&mut self, name: &str) -> MigrateResult<()> {
        self.client
            .execute(&format!("DELETE FROM {} WHERE name = $1", TRACKING_TABLE), &[&name])
            .await?;
        Ok(())
    }
}
