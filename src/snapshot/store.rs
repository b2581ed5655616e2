//! Schema Snapshot Store
//!
//! Persists the last captured snapshot as a pretty-printed JSON file so the
//! next run has something to diff against.

use crate::error::{MigrateError, MigrateResult};
use crate::snapshot::{DatabaseSnapshot, SNAPSHOT_VERSION};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default snapshot file name
pub const DEFAULT_SNAPSHOT_FILE: &str = ".fluent_snapshot.json";

/// Upper bound on snapshot file size (10 MiB)
pub const MAX_SNAPSHOT_BYTES: u64 = 10 * 1024 * 1024;

/// File-backed snapshot store
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot, replacing any previous file
    pub async fn save(&self, snapshot: &DatabaseSnapshot) -> MigrateResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut json = serde_json::to_string_pretty(snapshot)?;
        json.push('\n');
        tokio::fs::write(&self.path, json).await?;

        info!(
            "Saved snapshot to {}: {} tables",
            self.path.display(),
            snapshot.tables.len()
        );
        Ok(())
    }

    /// Load the previous snapshot; `None` when no snapshot has been written yet
    pub async fn load(&self) -> MigrateResult<Option<DatabaseSnapshot>> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No snapshot at {}, treating as first run", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if metadata.len() > MAX_SNAPSHOT_BYTES {
            return Err(MigrateError::SnapshotTooLarge {
                path: self.path.clone(),
                size: metadata.len(),
                limit: MAX_SNAPSHOT_BYTES,
            });
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        let snapshot: DatabaseSnapshot = serde_json::from_str(&content)?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(MigrateError::UnsupportedSnapshotVersion(snapshot.version));
        }

        debug!(
            "Loaded snapshot from {} ({} tables)",
            self.path.display(),
            snapshot.tables.len()
        );
        Ok(Some(snapshot))
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_FILE)
    }
}
