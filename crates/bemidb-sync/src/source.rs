//! Source database access: a single connection holding the snapshot
//! transaction all reads of one sync run observe.

use std::io::Write;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bemidb_core::{BemiError, SchemaTable, SourceColumn, PG_NULL_STRING};
use futures::TryStreamExt;
use indexmap::IndexMap;
use tempfile::NamedTempFile;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::url::normalize_database_url;

/// Source-side checksum computation, factored out so non-Postgres dialects
/// can supply an equivalent additive row hash.
#[async_trait]
pub trait ChecksumSource {
    /// `"<count>:<sumhash>"` for the table's current contents; `"0:"` for
    /// an empty table. Errors collapse to `""`, which never matches a
    /// stored checksum and so forces a full sync.
    async fn table_checksum(&self, table: &SchemaTable) -> String;
}

/// An ordinary table at the source, with its parent when the table is a
/// partition.
#[derive(Debug, Clone)]
pub struct SourceTable {
    pub table: SchemaTable,
    pub parent_partitioned_table: Option<SchemaTable>,
}

pub struct SourceConnection {
    client: Client,
}

impl SourceConnection {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let normalized = normalize_database_url(database_url);
        let (client, connection) = tokio_postgres::connect(&normalized, NoTls)
            .await
            .map_err(|e| BemiError::SourceUnavailable(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "source connection terminated");
            }
        });
        Ok(Self { client })
    }

    /// Open the deferred serializable read-only transaction that pins one
    /// consistent snapshot for every subsequent read of this run.
    pub async fn begin_snapshot(&self) -> Result<()> {
        self.client
            .batch_execute("BEGIN TRANSACTION ISOLATION LEVEL SERIALIZABLE READ ONLY DEFERRABLE")
            .await
            .map_err(|e| BemiError::SourceUnavailable(e.to_string()).into())
    }

    /// User schemas, excluding the catalog's own.
    pub async fn schemas(&self) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT schema_name::text \
                 FROM information_schema.schemata \
                 WHERE schema_name NOT IN ('pg_catalog', 'information_schema') \
                   AND schema_name NOT LIKE 'pg_toast%' \
                   AND schema_name NOT LIKE 'pg_temp%' \
                 ORDER BY schema_name",
                &[],
            )
            .await
            .map_err(|e| BemiError::SourceUnavailable(e.to_string()))?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// Ordinary tables of a schema, each with its parent partitioned table
    /// when inherited.
    pub async fn tables(&self, schema: &str) -> Result<Vec<SourceTable>> {
        let rows = self
            .client
            .query(
                "SELECT c.relname::text, pn.nspname::text, pc.relname::text \
                 FROM pg_catalog.pg_class c \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 LEFT JOIN pg_catalog.pg_inherits i ON i.inhrelid = c.oid \
                 LEFT JOIN pg_catalog.pg_class pc ON pc.oid = i.inhparent \
                 LEFT JOIN pg_catalog.pg_namespace pn ON pn.oid = pc.relnamespace \
                 WHERE n.nspname = $1 AND c.relkind = 'r' \
                 ORDER BY c.relname",
                &[&schema],
            )
            .await
            .map_err(|e| BemiError::SourceUnavailable(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| {
                let table = SchemaTable::new(schema, row.get::<_, String>(0));
                let parent_schema: Option<String> = row.get(1);
                let parent_table: Option<String> = row.get(2);
                let parent_partitioned_table = match (parent_schema, parent_table) {
                    (Some(s), Some(t)) => Some(SchemaTable::new(s, t)),
                    _ => None,
                };
                SourceTable { table, parent_partitioned_table }
            })
            .collect())
    }

    /// Column metadata keyed by name, in ordinal order. The spool header
    /// decides the order actually used; partitioned parents and column
    /// reordering can desynchronize ordinal positions from the CSV.
    pub async fn columns(&self, table: &SchemaTable) -> Result<IndexMap<String, SourceColumn>> {
        let rows = self
            .client
            .query(
                "SELECT column_name::text, data_type::text, udt_name::text, udt_schema::text, \
                        (is_nullable = 'YES'), ordinal_position::int4, \
                        COALESCE(character_maximum_length, 0)::int4, \
                        COALESCE(numeric_precision, 0)::int4, \
                        COALESCE(numeric_scale, 0)::int4, \
                        COALESCE(datetime_precision, 0)::int4 \
                 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                &[&table.schema, &table.table],
            )
            .await
            .map_err(|e| BemiError::SourceUnavailable(e.to_string()))?;

        let mut columns = IndexMap::with_capacity(rows.len());
        for row in rows {
            let column = SourceColumn {
                name: row.get(0),
                data_type: row.get(1),
                udt_name: row.get(2),
                namespace: row.get(3),
                is_nullable: row.get(4),
                ordinal_position: row.get(5),
                character_maximum_length: row.get(6),
                numeric_precision: row.get(7),
                numeric_scale: row.get(8),
                datetime_precision: row.get(9),
            };
            columns.insert(column.name.clone(), column);
        }
        Ok(columns)
    }

    /// Keepalive issued between long-running spool reads so idle timeouts
    /// do not kill the snapshot transaction.
    pub async fn ping(&self) -> Result<()> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| BemiError::SourceUnavailable(e.to_string()).into())
    }

    /// `COPY` the table to a uniquely named spool file as CSV with header,
    /// NULLs rendered as the reserved sentinel. The temp file is removed
    /// on every exit path once dropped.
    pub async fn copy_to_spool(&self, table: &SchemaTable) -> Result<NamedTempFile> {
        let sql = format!(
            "COPY {table} TO STDOUT WITH (FORMAT csv, HEADER true, NULL '{PG_NULL_STRING}')"
        );
        let stream = self
            .client
            .copy_out(&sql)
            .await
            .map_err(|e| BemiError::SourceUnavailable(e.to_string()))?;
        futures::pin_mut!(stream);

        let mut spool = NamedTempFile::new().context("create spool file")?;
        let mut bytes: u64 = 0;
        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|e| BemiError::SourceUnavailable(e.to_string()))?
        {
            bytes += chunk.len() as u64;
            spool.write_all(&chunk)?;
        }
        spool.flush()?;
        debug!(table = %table, bytes, "spooled");
        Ok(spool)
    }
}

#[async_trait]
impl ChecksumSource for SourceConnection {
    async fn table_checksum(&self, table: &SchemaTable) -> String {
        let sql = format!(
            "SELECT COUNT(*)::bigint, SUM(hashtext(t::text)::bigint)::bigint FROM {table} t"
        );
        match self.client.query_one(&sql, &[]).await {
            Ok(row) => format_checksum(row.get(0), row.get(1)),
            Err(e) => {
                warn!(table = %table, error = %e, "checksum query failed");
                String::new()
            }
        }
    }
}

/// Count plus order-independent row-hash sum. The sum is additive, so row
/// order never affects it; the count catches insert/delete and the sum
/// catches updates.
pub fn format_checksum(count: i64, sum: Option<i64>) -> String {
    match sum {
        Some(sum) => format!("{count}:{sum}"),
        None => format!("{count}:"),
    }
}
