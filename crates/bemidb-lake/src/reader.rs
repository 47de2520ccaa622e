//! Catalog enumeration and snapshot resolution.

use std::sync::Arc;

use bemidb_core::{BemiError, IcebergField, SchemaTable};
use datafusion::arrow::datatypes::SchemaRef;
use indexmap::IndexSet;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;

use crate::metadata::{self, ManifestDoc, TableMetadataDoc};

/// Opaque handle to a table's current snapshot: its lake schema and the
/// relative paths of the data files the snapshot references.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub snapshot_id: i64,
    pub fields: Vec<IcebergField>,
    pub arrow_schema: SchemaRef,
    pub data_files: Vec<String>,
}

/// Read side of the lake catalog. Observations are consistent within a
/// call; a newer snapshot may be observed across calls.
#[derive(Clone)]
pub struct LakeReader {
    store: Arc<dyn ObjectStore>,
}

impl LakeReader {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Schema names present in the catalog, in listing order.
    pub async fn schemas(&self) -> Result<Vec<String>, BemiError> {
        let listing = self
            .store
            .list_with_delimiter(None)
            .await
            .map_err(|e| BemiError::CatalogUnavailable(e.to_string()))?;
        let mut schemas = IndexSet::new();
        for prefix in listing.common_prefixes {
            if let Some(name) = prefix.filename() {
                schemas.insert(name.to_string());
            }
        }
        Ok(schemas.into_iter().collect())
    }

    /// Every table in the catalog, ordered by schema then table.
    pub async fn schema_tables(&self) -> Result<Vec<SchemaTable>, BemiError> {
        let mut tables = Vec::new();
        for schema in self.schemas().await? {
            let prefix = ObjectPath::from(schema.as_str());
            let listing = self
                .store
                .list_with_delimiter(Some(&prefix))
                .await
                .map_err(|e| BemiError::CatalogUnavailable(e.to_string()))?;
            for table_prefix in listing.common_prefixes {
                if let Some(name) = table_prefix.filename() {
                    tables.push(SchemaTable::new(schema.clone(), name.to_string()));
                }
            }
        }
        Ok(tables)
    }

    /// Resolve a table's current snapshot. `NotFound` when the table or a
    /// committed snapshot does not exist.
    pub async fn current_snapshot(&self, table: &SchemaTable) -> Result<TableSnapshot, BemiError> {
        let doc = self
            .load_metadata(table)
            .await?
            .ok_or_else(|| BemiError::NotFound(table.to_string()))?;
        let snapshot = doc
            .current_snapshot()
            .ok_or_else(|| BemiError::NotFound(format!("{table} has no committed snapshot")))?;

        let schema = doc
            .schemas
            .iter()
            .find(|s| s.schema_id == snapshot.schema_id)
            .ok_or_else(|| {
                BemiError::CatalogUnavailable(format!(
                    "{table} snapshot {} references missing schema {}",
                    snapshot.snapshot_id, snapshot.schema_id
                ))
            })?;
        let fields = schema
            .to_fields()
            .map_err(|e| BemiError::CatalogUnavailable(e.to_string()))?;
        let arrow_schema = schema
            .to_arrow()
            .map_err(|e| BemiError::CatalogUnavailable(e.to_string()))?;

        let manifest_path = ObjectPath::from(snapshot.manifest_list.as_str());
        let manifest: ManifestDoc = match self.store.get(&manifest_path).await {
            Ok(data) => {
                let bytes = data
                    .bytes()
                    .await
                    .map_err(|e| BemiError::CatalogUnavailable(e.to_string()))?;
                serde_json::from_slice(&bytes)
                    .map_err(|e| BemiError::CatalogUnavailable(e.to_string()))?
            }
            Err(object_store::Error::NotFound { .. }) => {
                return Err(BemiError::NotFound(format!(
                    "{table} manifest {}",
                    snapshot.manifest_list
                )))
            }
            Err(e) => return Err(BemiError::CatalogUnavailable(e.to_string())),
        };

        Ok(TableSnapshot {
            snapshot_id: snapshot.snapshot_id,
            fields,
            arrow_schema,
            data_files: manifest.entries.into_iter().map(|e| e.data_file.file_path).collect(),
        })
    }

    async fn load_metadata(&self, table: &SchemaTable) -> Result<Option<TableMetadataDoc>, BemiError> {
        let path = metadata::metadata_path(table);
        match self.store.get(&path).await {
            Ok(data) => {
                let bytes = data
                    .bytes()
                    .await
                    .map_err(|e| BemiError::CatalogUnavailable(e.to_string()))?;
                let doc = serde_json::from_slice(&bytes)
                    .map_err(|e| BemiError::CatalogUnavailable(e.to_string()))?;
                Ok(Some(doc))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(BemiError::CatalogUnavailable(e.to_string())),
        }
    }
}
