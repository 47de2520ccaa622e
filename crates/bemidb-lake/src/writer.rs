//! Streaming writer: row batches in, Parquet data files and an atomically
//! committed snapshot out.

use std::sync::Arc;

use anyhow::{Context, Result};
use bemidb_core::{map_column, BemiError, IcebergField, LakeType, RowBatchSource, SchemaTable, SourceColumn};
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::{Schema, SchemaRef};
use datafusion::parquet::arrow::arrow_writer::ArrowWriter;
use datafusion::parquet::file::properties::WriterProperties;
use futures::TryStreamExt;
use indexmap::IndexMap;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::metadata::{
    self, DataFileDoc, FieldDoc, ManifestDoc, ManifestEntry, SchemaDoc, SnapshotDoc,
    SnapshotSummary, TableMetadataDoc,
};

/// Row budget per Parquet data file; batches buffer until it is reached.
pub const TARGET_ROWS_PER_DATA_FILE: usize = 100_000;

pub struct LakeWriter {
    store: Arc<dyn ObjectStore>,
}

impl LakeWriter {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Stream `source` into `table`, committing one new snapshot that
    /// replaces the table's contents. Nothing becomes visible to readers
    /// before the final metadata publish; on any earlier failure the
    /// written data files are best-effort deleted.
    ///
    /// Returns the number of rows written.
    pub async fn write(
        &self,
        table: &SchemaTable,
        columns: &[SourceColumn],
        source: &mut dyn RowBatchSource,
    ) -> Result<i64> {
        let derived: Vec<IcebergField> =
            columns.iter().map(map_column).collect::<Result<_, _>>()?;

        let (mut doc, fields) = match metadata::load_table_metadata(self.store.as_ref(), table).await? {
            Some(mut doc) => {
                let current = doc
                    .current_schema()
                    .cloned()
                    .unwrap_or(SchemaDoc { schema_id: doc.current_schema_id, fields: vec![] });
                let (schema, fields) = evolve_schema(&current, &derived, doc.last_column_id)?;
                if schema.schema_id != doc.current_schema_id {
                    info!(table = %table, schema_id = schema.schema_id, "schema evolved");
                    doc.last_column_id =
                        doc.last_column_id.max(schema.fields.iter().map(|f| f.id).max().unwrap_or(0));
                    doc.current_schema_id = schema.schema_id;
                    doc.schemas.push(schema);
                }
                (doc, fields)
            }
            None => {
                let docs = derived
                    .iter()
                    .enumerate()
                    .map(|(i, f)| FieldDoc::from_field(i as i32 + 1, f))
                    .collect();
                let schema = SchemaDoc { schema_id: 0, fields: docs };
                (TableMetadataDoc::new(table, schema), derived.clone())
            }
        };

        let arrow_schema: SchemaRef =
            Arc::new(Schema::new(fields.iter().map(|f| f.arrow_field()).collect::<Vec<_>>()));
        let prefix = metadata::table_prefix(table);

        let mut data_files: Vec<DataFileDoc> = Vec::new();
        let total_rows = match self
            .spool_batches(&prefix, &fields, &arrow_schema, source, &mut data_files)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                self.discard_data_files(&data_files).await;
                return Err(e);
            }
        };

        let snapshot_id = doc.current_snapshot_id.unwrap_or(0) + 1;
        let manifest_rel = format!("{prefix}/metadata/manifest-{snapshot_id}-{}.json", Uuid::new_v4());
        let manifest = ManifestDoc {
            schema_id: doc.current_schema_id,
            snapshot_id,
            entries: data_files
                .iter()
                .map(|df| ManifestEntry { status: 2, data_file: df.clone() })
                .collect(),
        };
        let commit = async {
            let json = serde_json::to_string_pretty(&manifest)?;
            self.store
                .put(&ObjectPath::from(manifest_rel.as_str()), json.into_bytes().into())
                .await
                .context("write manifest")?;

            doc.commit_snapshot(SnapshotDoc {
                snapshot_id,
                parent_snapshot_id: doc.current_snapshot_id,
                sequence_number: snapshot_id,
                timestamp_ms: metadata::now_ms(),
                schema_id: doc.current_schema_id,
                manifest_list: manifest_rel.clone(),
                summary: SnapshotSummary {
                    operation: "overwrite".into(),
                    added_data_files: data_files.len() as i32,
                    added_records: total_rows,
                    added_files_size: data_files.iter().map(|df| df.file_size_in_bytes).sum(),
                    total_records: total_rows,
                },
            });
            metadata::store_table_metadata(self.store.as_ref(), table, &doc)
                .await
                .context("publish snapshot")
        };
        if let Err(e) = commit.await {
            self.discard_data_files(&data_files).await;
            let _ = self.store.delete(&ObjectPath::from(manifest_rel.as_str())).await;
            return Err(e);
        }

        info!(table = %table, rows = total_rows, files = data_files.len(), snapshot_id, "committed snapshot");
        self.expire_unreferenced_files(table, &doc).await;
        Ok(total_rows)
    }

    async fn spool_batches(
        &self,
        prefix: &str,
        fields: &[IcebergField],
        arrow_schema: &SchemaRef,
        source: &mut dyn RowBatchSource,
        data_files: &mut Vec<DataFileDoc>,
    ) -> Result<i64> {
        let mut pending: Vec<RecordBatch> = Vec::new();
        let mut pending_rows = 0usize;
        let mut total_rows = 0i64;

        loop {
            let rows = source.next_batch().await?;
            if rows.is_empty() {
                break;
            }
            total_rows += rows.len() as i64;
            pending_rows += rows.len();
            pending.push(crate::batch::rows_to_batch(fields, &rows)?);

            if pending_rows >= TARGET_ROWS_PER_DATA_FILE {
                data_files.push(self.flush_data_file(prefix, arrow_schema, &mut pending).await?);
                pending_rows = 0;
            }
        }
        if !pending.is_empty() {
            data_files.push(self.flush_data_file(prefix, arrow_schema, &mut pending).await?);
        }
        Ok(total_rows)
    }

    async fn flush_data_file(
        &self,
        prefix: &str,
        arrow_schema: &SchemaRef,
        pending: &mut Vec<RecordBatch>,
    ) -> Result<DataFileDoc> {
        let record_count: i64 = pending.iter().map(|b| b.num_rows() as i64).sum();
        let file_rel = format!("{prefix}/data/{}.parquet", Uuid::new_v4());

        let mut buffer = Vec::new();
        let props = WriterProperties::builder()
            .set_max_row_group_size(TARGET_ROWS_PER_DATA_FILE)
            .build();
        let mut writer = ArrowWriter::try_new(&mut buffer, arrow_schema.clone(), Some(props))?;
        for batch in pending.drain(..) {
            writer.write(&batch)?;
        }
        writer.close()?;

        let file_size_in_bytes = buffer.len() as i64;
        self.store
            .put(&ObjectPath::from(file_rel.as_str()), buffer.into())
            .await
            .map_err(|e| BemiError::ObjectStore(e.to_string()))?;

        Ok(DataFileDoc {
            file_path: file_rel,
            file_format: "PARQUET".into(),
            record_count,
            file_size_in_bytes,
        })
    }

    async fn discard_data_files(&self, data_files: &[DataFileDoc]) {
        for df in data_files {
            if let Err(e) = self.store.delete(&ObjectPath::from(df.file_path.as_str())).await {
                warn!(file = %df.file_path, error = %e, "failed to discard data file");
            }
        }
    }

    /// Drop data files no retained snapshot references. Best-effort; the
    /// next sync retries anything left behind.
    async fn expire_unreferenced_files(&self, table: &SchemaTable, doc: &TableMetadataDoc) {
        let mut referenced = std::collections::HashSet::new();
        for snapshot in &doc.snapshots {
            let path = ObjectPath::from(snapshot.manifest_list.as_str());
            let manifest: ManifestDoc = match self.store.get(&path).await {
                Ok(data) => match data.bytes().await.map(|b| serde_json::from_slice(&b)) {
                    Ok(Ok(m)) => m,
                    _ => continue,
                },
                Err(_) => continue,
            };
            for entry in manifest.entries {
                referenced.insert(entry.data_file.file_path);
            }
        }

        let data_prefix = ObjectPath::from(format!("{}/data", metadata::table_prefix(table)));
        let listed = self
            .store
            .list(Some(&data_prefix))
            .map_ok(|m| m.location)
            .try_collect::<Vec<_>>()
            .await;
        match listed {
            Ok(paths) => {
                for path in paths {
                    if !referenced.contains(path.as_ref()) {
                        if let Err(e) = self.store.delete(&path).await {
                            warn!(file = %path, error = %e, "failed to expire data file");
                        }
                    }
                }
            }
            Err(e) => warn!(table = %table, error = %e, "failed to list data files for expiry"),
        }
    }

    /// Remove a table's metadata and data files. Idempotent.
    pub async fn delete_schema_table(&self, table: &SchemaTable) -> Result<()> {
        self.delete_prefix(&metadata::table_prefix(table)).await
    }

    /// Remove every table of a schema. Idempotent.
    pub async fn delete_schema(&self, schema: &str) -> Result<()> {
        self.delete_prefix(schema).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let prefix = ObjectPath::from(prefix);
        let paths: Vec<ObjectPath> = match self
            .store
            .list(Some(&prefix))
            .map_ok(|m| m.location)
            .try_collect()
            .await
        {
            Ok(paths) => paths,
            Err(object_store::Error::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for path in paths {
            match self.store.delete(&path).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Reconcile the derived schema against the table's current one.
///
/// New columns join as nullable, compatible widenings (int to long, float
/// to double, decimal precision growth) take the wider type, nullability
/// is sticky once relaxed, and columns absent from the source drop out.
/// Narrowings and type changes are rejected.
fn evolve_schema(
    current: &SchemaDoc,
    derived: &[IcebergField],
    last_column_id: i32,
) -> Result<(SchemaDoc, Vec<IcebergField>)> {
    let mut existing: IndexMap<String, (i32, IcebergField)> = IndexMap::new();
    for field_doc in &current.fields {
        existing.insert(field_doc.name.clone(), (field_doc.id, field_doc.to_field()?));
    }

    let mut next_id = last_column_id.max(current.fields.iter().map(|f| f.id).max().unwrap_or(0)) + 1;
    let mut out_docs = Vec::with_capacity(derived.len());
    let mut out_fields = Vec::with_capacity(derived.len());

    for field in derived {
        let (id, resolved) = match existing.get(&field.name) {
            Some((id, old)) => {
                if old.is_list != field.is_list {
                    return Err(BemiError::SchemaIncompatible {
                        column: field.name.clone(),
                        detail: "list-ness changed".into(),
                    }
                    .into());
                }
                let field_type = widen(old.field_type, field.field_type).ok_or_else(|| {
                    BemiError::SchemaIncompatible {
                        column: field.name.clone(),
                        detail: format!(
                            "{} cannot become {}",
                            old.field_type.iceberg_type(),
                            field.field_type.iceberg_type()
                        ),
                    }
                })?;
                let resolved = IcebergField {
                    name: field.name.clone(),
                    field_type,
                    required: old.required && field.required,
                    is_list: field.is_list,
                };
                (*id, resolved)
            }
            None => {
                let id = next_id;
                next_id += 1;
                (id, IcebergField { required: false, ..field.clone() })
            }
        };
        out_docs.push(FieldDoc::from_field(id, &resolved));
        out_fields.push(resolved);
    }

    let changed = out_docs.len() != current.fields.len()
        || out_docs
            .iter()
            .zip(&current.fields)
            .any(|(a, b)| a.id != b.id || a.name != b.name || a.field_type != b.field_type || a.required != b.required);
    let schema_id = if changed { current.schema_id + 1 } else { current.schema_id };

    Ok((SchemaDoc { schema_id, fields: out_docs }, out_fields))
}

/// The type both old and new data fit in, or None when the change narrows.
fn widen(old: LakeType, new: LakeType) -> Option<LakeType> {
    use LakeType::*;
    match (old, new) {
        _ if old == new => Some(old),
        (Int, Long) => Some(Long),
        (Float, Double) => Some(Double),
        (Decimal { precision: p1, scale: s1 }, Decimal { precision: p2, scale: s2 })
            if s1 == s2 && p2 >= p1 =>
        {
            Some(new)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(name: &str, field_type: LakeType, required: bool) -> IcebergField {
        IcebergField { name: name.into(), field_type, required, is_list: false }
    }

    fn schema_of(fields: &[IcebergField]) -> SchemaDoc {
        SchemaDoc {
            schema_id: 0,
            fields: fields
                .iter()
                .enumerate()
                .map(|(i, field)| FieldDoc::from_field(i as i32 + 1, field))
                .collect(),
        }
    }

    #[test]
    fn unchanged_schema_keeps_id() {
        let fields = vec![f("id", LakeType::Long, true), f("name", LakeType::String, false)];
        let current = schema_of(&fields);
        let (schema, resolved) = evolve_schema(&current, &fields, 2).unwrap();
        assert_eq!(schema.schema_id, 0);
        assert_eq!(resolved, fields);
    }

    #[test]
    fn new_columns_join_as_nullable() {
        let current = schema_of(&[f("id", LakeType::Long, true)]);
        let derived = vec![f("id", LakeType::Long, true), f("added", LakeType::Int, true)];
        let (schema, resolved) = evolve_schema(&current, &derived, 1).unwrap();
        assert_eq!(schema.schema_id, 1);
        assert!(!resolved[1].required);
        assert_eq!(schema.fields[1].id, 2);
    }

    #[test]
    fn widening_takes_the_wider_type() {
        let current = schema_of(&[f("v", LakeType::Int, false)]);
        let derived = vec![f("v", LakeType::Long, false)];
        let (_, resolved) = evolve_schema(&current, &derived, 1).unwrap();
        assert_eq!(resolved[0].field_type, LakeType::Long);

        let current = schema_of(&[f("n", LakeType::Decimal { precision: 10, scale: 2 }, false)]);
        let derived = vec![f("n", LakeType::Decimal { precision: 20, scale: 2 }, false)];
        let (_, resolved) = evolve_schema(&current, &derived, 1).unwrap();
        assert_eq!(resolved[0].field_type, LakeType::Decimal { precision: 20, scale: 2 });
    }

    #[test]
    fn narrowing_and_type_changes_are_rejected() {
        let current = schema_of(&[f("v", LakeType::Long, false)]);
        assert!(evolve_schema(&current, &[f("v", LakeType::Int, false)], 1).is_err());

        let current = schema_of(&[f("v", LakeType::String, false)]);
        assert!(evolve_schema(&current, &[f("v", LakeType::Boolean, false)], 1).is_err());

        let current = schema_of(&[f("n", LakeType::Decimal { precision: 20, scale: 2 }, false)]);
        assert!(
            evolve_schema(&current, &[f("n", LakeType::Decimal { precision: 10, scale: 2 }, false)], 1)
                .is_err()
        );
    }

    #[test]
    fn nullability_is_sticky() {
        let current = schema_of(&[f("v", LakeType::Int, false)]);
        let (_, resolved) = evolve_schema(&current, &[f("v", LakeType::Int, true)], 1).unwrap();
        assert!(!resolved[0].required);
    }

    #[test]
    fn dropped_columns_leave_the_schema() {
        let current = schema_of(&[f("keep", LakeType::Int, false), f("drop", LakeType::Int, false)]);
        let (schema, resolved) = evolve_schema(&current, &[f("keep", LakeType::Int, false)], 2).unwrap();
        assert_eq!(schema.schema_id, 1);
        assert_eq!(resolved.len(), 1);
        assert_eq!(schema.fields.len(), 1);
    }
}
