//! Embedded analytical engine: a DataFusion session whose catalog mirrors
//! the lake's current snapshots.

use std::sync::Arc;

use anyhow::{Context, Result};
use bemidb_core::{BemiError, Config};
use bemidb_lake::{lake_file_path, LakeReader};
use datafusion::catalog::{CatalogProvider, MemoryCatalogProvider, MemorySchemaProvider};
use datafusion::datasource::file_format::parquet::ParquetFormat;
use datafusion::datasource::listing::{
    ListingOptions, ListingTable, ListingTableConfig, ListingTableUrl,
};
use datafusion::datasource::MemTable;
use datafusion::execution::SendableRecordBatchStream;
use datafusion::prelude::{SessionConfig, SessionContext};
use datafusion::sql::sqlparser::ast::Statement;
use datafusion::sql::sqlparser::dialect::PostgreSqlDialect;
use datafusion::sql::sqlparser::parser::Parser as SqlParser;
use tracing::debug;

const CATALOG_NAME: &str = "bemidb";
const DEFAULT_SCHEMA: &str = "public";

pub struct QueryEngine {
    config: Arc<Config>,
    reader: LakeReader,
}

impl QueryEngine {
    pub fn new(config: Arc<Config>, reader: LakeReader) -> Self {
        Self { config, reader }
    }

    /// Run one read query and stream its result batches. The catalog is
    /// resolved once per call, so a query sees either the old or the new
    /// snapshot of every table, never a mix.
    pub async fn execute(&self, sql: &str) -> Result<SendableRecordBatchStream> {
        reject_write_statements(sql)?;
        let sql = self.rewrite_catalog_references(sql).await?;
        let ctx = self.session().await?;
        let df = ctx.sql(&sql).await.context("plan query")?;
        df.execute_stream().await.context("execute query")
    }

    /// Plan a query and report its output schema without executing it.
    pub async fn describe(&self, sql: &str) -> Result<datafusion::arrow::datatypes::Schema> {
        reject_write_statements(sql)?;
        let sql = self.rewrite_catalog_references(sql).await?;
        let ctx = self.session().await?;
        let df = ctx.sql(&sql).await.context("plan query")?;
        Ok(df.schema().into())
    }

    /// Schema names currently in the lake, for catalog introspection.
    pub async fn lake_schemas(&self) -> Result<Vec<String>> {
        Ok(self.reader.schemas().await?)
    }

    /// Tables currently in the lake, for catalog introspection.
    pub async fn lake_tables(&self) -> Result<Vec<bemidb_core::SchemaTable>> {
        Ok(self.reader.schema_tables().await?)
    }

    pub fn database_name(&self) -> &str {
        &self.config.database
    }

    async fn session(&self) -> Result<SessionContext> {
        let session_config = SessionConfig::new()
            .with_default_catalog_and_schema(CATALOG_NAME, DEFAULT_SCHEMA)
            .with_information_schema(true);
        let ctx = SessionContext::new_with_config(session_config);

        let catalog = MemoryCatalogProvider::new();
        for schema in self.reader.schemas().await? {
            catalog
                .register_schema(&schema, Arc::new(MemorySchemaProvider::new()))
                .map_err(|e| BemiError::CatalogUnavailable(e.to_string()))?;
        }

        for table in self.reader.schema_tables().await? {
            let snapshot = self.reader.current_snapshot(&table).await?;
            let provider: Arc<dyn datafusion::datasource::TableProvider> =
                if snapshot.data_files.is_empty() {
                    Arc::new(MemTable::try_new(snapshot.arrow_schema.clone(), vec![vec![]])?)
                } else {
                    let urls = snapshot
                        .data_files
                        .iter()
                        .map(|rel| {
                            let path = lake_file_path(&self.config.storage_path, rel);
                            ListingTableUrl::parse(path.to_string_lossy().as_ref())
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    let options = ListingOptions::new(Arc::new(ParquetFormat::default()));
                    let listing_config = ListingTableConfig::new_with_multi_paths(urls)
                        .with_listing_options(options)
                        .with_schema(snapshot.arrow_schema.clone());
                    Arc::new(ListingTable::try_new(listing_config)?)
                };

            let schema_provider = catalog
                .schema(&table.schema)
                .ok_or_else(|| BemiError::CatalogUnavailable(format!("schema {}", table.schema)))?;
            schema_provider.register_table(table.table.clone(), provider)?;
            debug!(table = %table, snapshot_id = snapshot.snapshot_id, "registered");
        }

        ctx.register_catalog(CATALOG_NAME, Arc::new(catalog));
        Ok(ctx)
    }

    /// Apply the configured schema prefix to qualified table references,
    /// so clients keep addressing tables by their source schema names.
    async fn rewrite_catalog_references(&self, sql: &str) -> Result<String> {
        if self.config.schema_prefix.is_empty() {
            return Ok(sql.to_string());
        }
        let prefix = &self.config.schema_prefix;
        let mut rewritten = sql.to_string();
        for lake_schema in self.reader.schemas().await? {
            if let Some(source_schema) = lake_schema.strip_prefix(prefix.as_str()) {
                rewritten = replace_qualified(&rewritten, source_schema, &lake_schema);
            }
        }
        Ok(rewritten)
    }
}

/// Replace `from.` with `to.` wherever `from` stands alone as the leading
/// qualifier of an identifier (not inside a longer identifier).
fn replace_qualified(sql: &str, from: &str, to: &str) -> String {
    if from.is_empty() {
        return sql.to_string();
    }
    let needle = format!("{from}.");
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(idx) = rest.find(&needle) {
        let preceded_by_ident = rest[..idx]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '"');
        out.push_str(&rest[..idx]);
        if preceded_by_ident {
            out.push_str(&needle);
        } else {
            out.push_str(to);
            out.push('.');
        }
        rest = &rest[idx + needle.len()..];
    }
    out.push_str(rest);
    out
}

/// Statements with write intent never reach the engine.
fn reject_write_statements(sql: &str) -> Result<()> {
    let statements = match SqlParser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(statements) => statements,
        // Unparseable input falls through to the engine, whose own parse
        // error reaches the client.
        Err(_) => return Ok(()),
    };
    for statement in statements {
        match statement {
            Statement::Query(_) | Statement::Explain { .. } | Statement::ShowVariable { .. } => {}
            _ => return Err(BemiError::ReadOnlyViolation.into()),
        }
    }
    Ok(())
}
