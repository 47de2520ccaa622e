//! Per-table sync state, persisted under `<storage>/metadata/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bemidb_core::SchemaTable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Outcome of the last successful sync of one source table. The checksum
/// is only meaningful while `row_count` matches the lake's most recent
/// snapshot, which holds because both are written together after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSyncState {
    pub last_sync_time: DateTime<Utc>,
    pub row_count: i64,
    pub checksum: String,
}

/// Plain-file store: one JSON document per source table at
/// `metadata/<schema>/<table>.json`.
pub struct SyncStateStore {
    root: PathBuf,
}

impl SyncStateStore {
    pub fn new(storage_path: &Path) -> Self {
        Self { root: storage_path.join("metadata") }
    }

    fn state_path(&self, table: &SchemaTable) -> PathBuf {
        self.root.join(&table.schema).join(format!("{}.json", table.table))
    }

    /// Absent or unreadable state reads as `None`, forcing a full sync.
    pub fn load(&self, table: &SchemaTable) -> Option<TableSyncState> {
        let path = self.state_path(table);
        let data = fs::read(&path).ok()?;
        match serde_json::from_slice(&data) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable sync state");
                None
            }
        }
    }

    /// Overwrite atomically: write a sibling temp file, then rename.
    pub fn store(&self, table: &SchemaTable, state: &TableSyncState) -> Result<()> {
        let path = self.state_path(table);
        let dir = path.parent().expect("state path has a parent");
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, state)?;
        tmp.persist(&path)
            .with_context(|| format!("persist sync state {}", path.display()))?;
        Ok(())
    }

    /// Idempotent removal.
    pub fn delete(&self, table: &SchemaTable) -> Result<()> {
        match fs::remove_file(self.state_path(table)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
