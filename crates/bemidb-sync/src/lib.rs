//! # BemiDB Sync
//!
//! Extraction pipeline from a source Postgres database into the lake:
//! consistent-snapshot enumeration, CSV spooling through `COPY`,
//! checksum-based incremental skip, per-table sync state and deletion
//! reconciliation.

pub mod source;
pub mod spool;
pub mod state;
pub mod syncer;
pub mod telemetry;
pub mod url;

pub use source::{ChecksumSource, SourceConnection, SourceTable};
pub use state::{SyncStateStore, TableSyncState};
pub use syncer::{SyncOptions, Syncer};
pub use url::normalize_database_url;
