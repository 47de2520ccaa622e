//! # BemiDB Core
//!
//! Foundational types shared by the sync pipeline, the Iceberg lake layer
//! and the wire server: schema/table/column descriptors, the source-to-lake
//! type mapping, process configuration and the surface error kinds.

use anyhow::Result;
use async_trait::async_trait;

pub mod config;
pub mod descriptors;
pub mod error;
pub mod types;

pub use config::Config;
pub use descriptors::{IcebergField, LakeType, SchemaTable, SourceColumn};
pub use error::BemiError;
pub use types::map_column;

/// Literal that marks SQL NULL inside the CSV spool. Chosen to be unlikely
/// as a real cell value; a cell whose text equals this literal would be
/// misread as NULL.
pub const PG_NULL_STRING: &str = "BEMIDB_NULL";

/// Rows pulled from a spool per batch.
pub const BATCH_SIZE: usize = 10_000;

/// Batches between source keepalive pings (BATCH_SIZE * PING_INTERVAL rows).
pub const PING_INTERVAL: usize = 20;

/// A pull source of row batches feeding the lake writer.
///
/// Rows are raw text fields in column order, NULLs encoded as
/// [`PG_NULL_STRING`]. An empty batch signals end of stream.
#[async_trait]
pub trait RowBatchSource: Send {
    async fn next_batch(&mut self) -> Result<Vec<Vec<String>>>;
}

/// Adapter for feeding the writer from an in-memory row set.
pub struct VecBatchSource {
    batches: std::collections::VecDeque<Vec<Vec<String>>>,
}

impl VecBatchSource {
    pub fn new(batches: Vec<Vec<Vec<String>>>) -> Self {
        Self { batches: batches.into() }
    }

    pub fn single(rows: Vec<Vec<String>>) -> Self {
        Self::new(vec![rows])
    }
}

#[async_trait]
impl RowBatchSource for VecBatchSource {
    async fn next_batch(&mut self) -> Result<Vec<Vec<String>>> {
        Ok(self.batches.pop_front().unwrap_or_default())
    }
}
