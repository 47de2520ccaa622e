//! Spool-file batch source: pulls fixed-size row batches out of the CSV
//! spool and keeps the source connection alive while the writer drains.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bemidb_core::{RowBatchSource, BATCH_SIZE, PING_INTERVAL};
use tempfile::NamedTempFile;

use crate::source::SourceConnection;

pub struct SpoolSource<'a> {
    reader: csv::Reader<std::fs::File>,
    header: Vec<String>,
    connection: &'a SourceConnection,
    batches_since_ping: usize,
    // Owns the spool so it outlives the reader and is deleted on drop.
    _spool: NamedTempFile,
}

impl<'a> SpoolSource<'a> {
    pub fn open(spool: NamedTempFile, connection: &'a SourceConnection) -> Result<Self> {
        let file = spool.reopen().context("reopen spool file")?;
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
        let header = reader
            .headers()
            .context("read spool header")?
            .iter()
            .map(String::from)
            .collect();
        Ok(Self { reader, header, connection, batches_since_ping: 0, _spool: spool })
    }

    /// Column order as observed in the spool output.
    pub fn header(&self) -> &[String] {
        &self.header
    }
}

#[async_trait]
impl RowBatchSource for SpoolSource<'_> {
    async fn next_batch(&mut self) -> Result<Vec<Vec<String>>> {
        let mut rows = Vec::with_capacity(BATCH_SIZE);
        let mut record = csv::StringRecord::new();
        while rows.len() < BATCH_SIZE {
            if !self.reader.read_record(&mut record).context("read spool record")? {
                break;
            }
            rows.push(record.iter().map(String::from).collect());
        }

        if !rows.is_empty() {
            self.batches_since_ping += 1;
            if self.batches_since_ping >= PING_INTERVAL {
                self.connection.ping().await?;
                self.batches_since_ping = 0;
            }
        }
        Ok(rows)
    }
}
