//! Iceberg metadata documents: table metadata, schemas, snapshots and
//! manifests, serialized as JSON under each table's `metadata/` prefix.
//!
//! The table metadata document is the commit point: readers resolve the
//! current snapshot from it, and the writer publishes a new snapshot by
//! overwriting it after all data files and manifests are in place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use bemidb_core::{IcebergField, LakeType, SchemaTable};
use datafusion::arrow::datatypes::{Schema, SchemaRef};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};

/// Snapshots kept in the metadata document beyond the current one.
pub const SNAPSHOT_RETENTION: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableMetadataDoc {
    pub format_version: i32,
    pub table_uuid: String,
    pub location: String,
    pub last_updated_ms: i64,
    pub last_column_id: i32,
    pub current_schema_id: i32,
    pub schemas: Vec<SchemaDoc>,
    pub current_snapshot_id: Option<i64>,
    pub snapshots: Vec<SnapshotDoc>,
    pub snapshot_log: Vec<SnapshotLogEntry>,
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchemaDoc {
    pub schema_id: i32,
    pub fields: Vec<FieldDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FieldDoc {
    pub id: i32,
    pub name: String,
    /// Iceberg type string; list types render as `list<element>`.
    #[serde(rename = "type")]
    pub field_type: String,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotDoc {
    pub snapshot_id: i64,
    pub parent_snapshot_id: Option<i64>,
    pub sequence_number: i64,
    pub timestamp_ms: i64,
    pub schema_id: i32,
    /// Lake-relative path of the manifest document.
    pub manifest_list: String,
    pub summary: SnapshotSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotSummary {
    pub operation: String,
    pub added_data_files: i32,
    pub added_records: i64,
    pub added_files_size: i64,
    pub total_records: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotLogEntry {
    pub timestamp_ms: i64,
    pub snapshot_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestDoc {
    pub schema_id: i32,
    pub snapshot_id: i64,
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestEntry {
    /// 1 existing, 2 added in this snapshot.
    pub status: i32,
    pub data_file: DataFileDoc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DataFileDoc {
    /// Lake-relative path of the Parquet file.
    pub file_path: String,
    pub file_format: String,
    pub record_count: i64,
    pub file_size_in_bytes: i64,
}

impl TableMetadataDoc {
    pub fn new(table: &SchemaTable, schema: SchemaDoc) -> Self {
        let mut properties = HashMap::new();
        properties.insert("write.format.default".to_string(), "parquet".to_string());
        Self {
            format_version: 2,
            table_uuid: uuid::Uuid::new_v4().to_string(),
            location: table_prefix(table),
            last_updated_ms: now_ms(),
            last_column_id: schema.fields.iter().map(|f| f.id).max().unwrap_or(0),
            current_schema_id: schema.schema_id,
            schemas: vec![schema],
            current_snapshot_id: None,
            snapshots: Vec::new(),
            snapshot_log: Vec::new(),
            properties,
        }
    }

    pub fn current_schema(&self) -> Option<&SchemaDoc> {
        self.schemas.iter().find(|s| s.schema_id == self.current_schema_id)
    }

    pub fn current_snapshot(&self) -> Option<&SnapshotDoc> {
        let id = self.current_snapshot_id?;
        self.snapshots.iter().find(|s| s.snapshot_id == id)
    }

    /// Append a snapshot, advance the current pointer and prune history
    /// beyond the retention window.
    pub fn commit_snapshot(&mut self, snapshot: SnapshotDoc) {
        self.snapshot_log.push(SnapshotLogEntry {
            timestamp_ms: snapshot.timestamp_ms,
            snapshot_id: snapshot.snapshot_id,
        });
        self.current_snapshot_id = Some(snapshot.snapshot_id);
        self.last_updated_ms = snapshot.timestamp_ms;
        self.snapshots.push(snapshot);
        if self.snapshots.len() > SNAPSHOT_RETENTION {
            let cut = self.snapshots.len() - SNAPSHOT_RETENTION;
            self.snapshots.drain(..cut);
        }
    }
}

impl SchemaDoc {
    pub fn to_fields(&self) -> Result<Vec<IcebergField>> {
        self.fields.iter().map(FieldDoc::to_field).collect()
    }

    pub fn to_arrow(&self) -> Result<SchemaRef> {
        let fields = self
            .to_fields()?
            .iter()
            .map(|f| f.arrow_field())
            .collect::<Vec<_>>();
        Ok(Arc::new(Schema::new(fields)))
    }
}

impl FieldDoc {
    pub fn to_field(&self) -> Result<IcebergField> {
        let (type_str, is_list) = match self
            .field_type
            .strip_prefix("list<")
            .and_then(|s| s.strip_suffix('>'))
        {
            Some(elem) => (elem, true),
            None => (self.field_type.as_str(), false),
        };
        let field_type = LakeType::from_iceberg(type_str)
            .ok_or_else(|| anyhow!("unknown lake type {:?} for field {}", self.field_type, self.name))?;
        Ok(IcebergField {
            name: self.name.clone(),
            field_type,
            required: self.required,
            is_list,
        })
    }

    pub fn from_field(id: i32, field: &IcebergField) -> Self {
        let base = field.field_type.iceberg_type();
        let field_type = if field.is_list { format!("list<{base}>") } else { base };
        Self { id, name: field.name.clone(), field_type, required: field.required }
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Lake-relative prefix of a table.
pub fn table_prefix(table: &SchemaTable) -> String {
    format!("{}/{}", table.schema, table.table)
}

pub fn metadata_path(table: &SchemaTable) -> ObjectPath {
    ObjectPath::from(format!("{}/metadata/metadata.json", table_prefix(table)))
}

/// Load a table's metadata document; `Ok(None)` when the table does not
/// exist yet.
pub async fn load_table_metadata(
    store: &dyn ObjectStore,
    table: &SchemaTable,
) -> Result<Option<TableMetadataDoc>> {
    let path = metadata_path(table);
    match store.get(&path).await {
        Ok(data) => {
            let bytes = data.bytes().await?;
            let doc = serde_json::from_slice(&bytes)?;
            Ok(Some(doc))
        }
        Err(object_store::Error::NotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn store_table_metadata(
    store: &dyn ObjectStore,
    table: &SchemaTable,
    doc: &TableMetadataDoc,
) -> Result<()> {
    let json = serde_json::to_string_pretty(doc)?;
    store.put(&metadata_path(table), json.into_bytes().into()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_field_docs_round_trip() {
        let field = IcebergField {
            name: "prices".into(),
            field_type: LakeType::Decimal { precision: 10, scale: 2 },
            required: false,
            is_list: true,
        };
        let doc = FieldDoc::from_field(3, &field);
        assert_eq!(doc.field_type, "list<decimal(10, 2)>");
        assert_eq!(doc.to_field().unwrap(), field);
    }

    #[test]
    fn commit_snapshot_advances_and_prunes() {
        let table = SchemaTable::new("s", "t");
        let schema = SchemaDoc { schema_id: 0, fields: vec![] };
        let mut doc = TableMetadataDoc::new(&table, schema);

        for id in 1..=(SNAPSHOT_RETENTION as i64 + 5) {
            doc.commit_snapshot(SnapshotDoc {
                snapshot_id: id,
                parent_snapshot_id: doc.current_snapshot_id,
                sequence_number: id,
                timestamp_ms: id,
                schema_id: 0,
                manifest_list: format!("s/t/metadata/manifest-{id}.json"),
                summary: SnapshotSummary {
                    operation: "append".into(),
                    added_data_files: 1,
                    added_records: 1,
                    added_files_size: 1,
                    total_records: id,
                },
            });
        }

        assert_eq!(doc.current_snapshot().unwrap().snapshot_id, SNAPSHOT_RETENTION as i64 + 5);
        assert_eq!(doc.snapshots.len(), SNAPSHOT_RETENTION);
        // The log keeps full history even after snapshot pruning.
        assert_eq!(doc.snapshot_log.len(), SNAPSHOT_RETENTION + 5);
    }

    #[test]
    fn metadata_doc_serializes_kebab_case() {
        let table = SchemaTable::new("s", "t");
        let doc = TableMetadataDoc::new(
            &table,
            SchemaDoc {
                schema_id: 0,
                fields: vec![FieldDoc::from_field(
                    1,
                    &IcebergField {
                        name: "id".into(),
                        field_type: LakeType::Long,
                        required: true,
                        is_list: false,
                    },
                )],
            },
        );
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"format-version\":2"));
        assert!(json.contains("\"current-schema-id\":0"));
        assert!(json.contains("\"type\":\"long\""));
    }
}
