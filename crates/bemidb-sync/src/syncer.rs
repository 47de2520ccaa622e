//! Sync orchestration: enumerate, filter, extract, reconcile.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use bemidb_core::{BemiError, Config, SchemaTable};
use bemidb_lake::{local_lake_store, LakeReader, LakeWriter};
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use tracing::{debug, error, info};

use crate::source::{ChecksumSource, SourceConnection};
use crate::spool::SpoolSource;
use crate::state::{SyncStateStore, TableSyncState};
use crate::telemetry;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Unset means a full sync; an instant enables the incremental skip
    /// for tables unchanged since then.
    pub since: Option<DateTime<Utc>>,
}

pub struct Syncer {
    config: Arc<Config>,
    writer: LakeWriter,
    reader: LakeReader,
    state: SyncStateStore,
}

impl Syncer {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let store = local_lake_store(&config.storage_path)?;
        Ok(Self {
            writer: LakeWriter::new(store.clone()),
            reader: LakeReader::new(store),
            state: SyncStateStore::new(&config.storage_path),
            config,
        })
    }

    /// One full pass over the source. Per-table failures log and move on;
    /// losing the source or the catalog aborts the run.
    pub async fn sync_from_source(&self, options: &SyncOptions) -> Result<()> {
        let url = self
            .config
            .database_url
            .as_deref()
            .ok_or(BemiError::ConfigMissing("PG_DATABASE_URL"))?;

        // Fire-and-forget: the beacon races in the background and never
        // delays the extraction.
        tokio::spawn(telemetry::send_sync_beacon(self.config.clone()));

        let source = SourceConnection::connect(url).await?;
        source.begin_snapshot().await?;

        // Deduplicated by (schema, table): partitions of a partitioned
        // parent enumerate as ordinary tables and each syncs exactly once.
        let mut seen: IndexSet<SchemaTable> = IndexSet::new();
        for schema in source.schemas().await? {
            for entry in source.tables(&schema).await? {
                if !seen.insert(entry.table.clone()) {
                    continue;
                }
                if let Some(parent) = &entry.parent_partitioned_table {
                    debug!(table = %entry.table, parent = %parent, "partition of partitioned table");
                }
                if !self.config.should_sync(&entry.table) {
                    debug!(table = %entry.table, "filtered out");
                    continue;
                }
                if let Err(e) = self.sync_table(&source, &entry.table, options).await {
                    if is_run_fatal(&e) {
                        return Err(e);
                    }
                    error!(table = %entry.table, error = ?e, "table sync failed");
                }
            }
        }

        let covered: IndexSet<SchemaTable> =
            seen.iter().filter(|t| self.config.should_sync(t)).cloned().collect();
        self.reconcile_deletions(&covered).await?;
        Ok(())
    }

    async fn sync_table(
        &self,
        source: &SourceConnection,
        table: &SchemaTable,
        options: &SyncOptions,
    ) -> Result<()> {
        let state = self.state.load(table);
        if let Some(reason) = incremental_candidate(options.since, state.as_ref()) {
            let current = source.table_checksum(table).await;
            if current == reason.checksum {
                info!(table = %table, "no changes since last sync");
                return Ok(());
            }
        }

        info!(table = %table, "syncing");
        let spool = source.copy_to_spool(table).await?;
        let mut batches = SpoolSource::open(spool, source)?;

        // The header decides column order; the information schema fills in
        // the metadata per name.
        let by_name = source.columns(table).await?;
        let mut columns = Vec::with_capacity(batches.header().len());
        for name in batches.header() {
            let column = by_name.get(name).ok_or_else(|| {
                anyhow!("column {name:?} of {table} is missing from the information schema")
            })?;
            columns.push(column.clone());
        }

        let sink_table = table.with_prefix(&self.config.schema_prefix);
        let row_count = self.writer.write(&sink_table, &columns, &mut batches).await?;

        let checksum = source.table_checksum(table).await;
        self.state.store(
            table,
            &TableSyncState { last_sync_time: Utc::now(), row_count, checksum },
        )?;
        Ok(())
    }

    /// Drop lake tables whose source is gone. Suppressed whenever a schema
    /// prefix is configured: the lake may then hold other tenants' tables
    /// that this source must never delete.
    async fn reconcile_deletions(&self, covered: &IndexSet<SchemaTable>) -> Result<()> {
        if !self.config.schema_prefix.is_empty() {
            debug!("schema prefix configured, skipping deletion reconciliation");
            return Ok(());
        }

        for sink in self.reader.schema_tables().await? {
            if !covered.contains(&sink) {
                info!(table = %sink, "removing table no longer at the source");
                self.writer.delete_schema_table(&sink).await?;
                self.state.delete(&sink)?;
            }
        }
        for schema in self.reader.schemas().await? {
            if !covered.iter().any(|t| t.schema == schema) {
                self.writer.delete_schema(&schema).await?;
            }
        }
        Ok(())
    }
}

/// The stored state to compare against, when the incremental skip may
/// apply: `since` is set and the table was synced after it.
fn incremental_candidate(
    since: Option<DateTime<Utc>>,
    state: Option<&TableSyncState>,
) -> Option<&TableSyncState> {
    let since = since?;
    let state = state?;
    (state.last_sync_time > since && !state.checksum.is_empty()).then_some(state)
}

/// Errors that abort the whole run rather than one table.
fn is_run_fatal(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<BemiError>(),
        Some(BemiError::SourceUnavailable(_))
            | Some(BemiError::ConfigMissing(_))
            | Some(BemiError::CatalogUnavailable(_))
    )
}
