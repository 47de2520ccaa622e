//! Writer-to-reader round trips over a local filesystem store.

use bemidb_core::{LakeType, SchemaTable, SourceColumn, VecBatchSource};
use bemidb_lake::{local_lake_store, LakeReader, LakeWriter};
use datafusion::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

fn column(name: &str, udt_name: &str, is_nullable: bool, position: i32) -> SourceColumn {
    SourceColumn {
        name: name.into(),
        data_type: udt_name.into(),
        udt_name: udt_name.into(),
        namespace: "pg_catalog".into(),
        is_nullable,
        ordinal_position: position,
        character_maximum_length: 0,
        numeric_precision: 0,
        numeric_scale: 0,
        datetime_precision: 0,
    }
}

#[tokio::test]
async fn write_then_read_single_row() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = local_lake_store(dir.path()).unwrap();
    let writer = LakeWriter::new(store.clone());
    let reader = LakeReader::new(store);

    let table = SchemaTable::new("test_schema", "simple_table");
    let columns = vec![column("id", "int8", false, 1)];
    let mut source = VecBatchSource::single(vec![vec!["1".to_string()]]);

    let rows = writer.write(&table, &columns, &mut source).await.unwrap();
    assert_eq!(rows, 1);

    assert_eq!(reader.schemas().await.unwrap(), vec!["test_schema".to_string()]);
    assert_eq!(reader.schema_tables().await.unwrap(), vec![table.clone()]);

    let snapshot = reader.current_snapshot(&table).await.unwrap();
    assert_eq!(snapshot.data_files.len(), 1);
    assert_eq!(snapshot.fields.len(), 1);
    assert_eq!(snapshot.fields[0].field_type, LakeType::Long);
    assert!(snapshot.fields[0].required);

    // The parquet file holds exactly the row that went in.
    let file = std::fs::File::open(dir.path().join("iceberg").join(&snapshot.data_files[0])).unwrap();
    let mut parquet = ParquetRecordBatchReaderBuilder::try_new(file).unwrap().build().unwrap();
    let batch = parquet.next().unwrap().unwrap();
    assert_eq!(batch.num_rows(), 1);
    let ids = batch
        .column(0)
        .as_any()
        .downcast_ref::<datafusion::arrow::array::Int64Array>()
        .unwrap();
    assert_eq!(ids.value(0), 1);
}

#[tokio::test]
async fn resync_evolves_schema_and_expires_old_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = local_lake_store(dir.path()).unwrap();
    let writer = LakeWriter::new(store.clone());
    let reader = LakeReader::new(store);

    let table = SchemaTable::new("public", "users");
    let v1 = vec![column("id", "int8", false, 1)];
    let mut source = VecBatchSource::single(vec![vec!["1".to_string()]]);
    writer.write(&table, &v1, &mut source).await.unwrap();
    let first = reader.current_snapshot(&table).await.unwrap();

    let v2 = vec![column("id", "int8", false, 1), column("email", "text", true, 2)];
    let mut source = VecBatchSource::single(vec![
        vec!["1".to_string(), "a@example.com".to_string()],
        vec!["2".to_string(), "BEMIDB_NULL".to_string()],
    ]);
    writer.write(&table, &v2, &mut source).await.unwrap();

    let second = reader.current_snapshot(&table).await.unwrap();
    assert!(second.snapshot_id > first.snapshot_id);
    assert_eq!(second.fields.len(), 2);
    assert_eq!(second.fields[1].name, "email");
    // Readers resolve only the new snapshot's files.
    assert!(!second.data_files.contains(&first.data_files[0]));
}

#[tokio::test]
async fn empty_table_commits_an_empty_snapshot() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = local_lake_store(dir.path()).unwrap();
    let writer = LakeWriter::new(store.clone());
    let reader = LakeReader::new(store);

    let table = SchemaTable::new("public", "empty");
    let columns = vec![column("id", "int4", true, 1)];
    let mut source = VecBatchSource::new(vec![]);
    let rows = writer.write(&table, &columns, &mut source).await.unwrap();
    assert_eq!(rows, 0);

    let snapshot = reader.current_snapshot(&table).await.unwrap();
    assert!(snapshot.data_files.is_empty());
    assert_eq!(snapshot.fields.len(), 1);
}

#[tokio::test]
async fn unsupported_column_publishes_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = local_lake_store(dir.path()).unwrap();
    let writer = LakeWriter::new(store.clone());
    let reader = LakeReader::new(store);

    let table = SchemaTable::new("public", "vectors");
    let columns = vec![column("v", "tsvector", true, 1)];
    let mut source = VecBatchSource::single(vec![vec!["x".to_string()]]);
    assert!(writer.write(&table, &columns, &mut source).await.is_err());

    assert!(matches!(
        reader.current_snapshot(&table).await,
        Err(bemidb_core::BemiError::NotFound(_))
    ));
}

#[tokio::test]
async fn deletion_is_idempotent() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = local_lake_store(dir.path()).unwrap();
    let writer = LakeWriter::new(store.clone());
    let reader = LakeReader::new(store);

    let table = SchemaTable::new("public", "gone");
    let columns = vec![column("id", "int4", true, 1)];
    let mut source = VecBatchSource::single(vec![vec!["1".to_string()]]);
    writer.write(&table, &columns, &mut source).await.unwrap();

    writer.delete_schema_table(&table).await.unwrap();
    writer.delete_schema_table(&table).await.unwrap();
    assert!(reader.schema_tables().await.unwrap().is_empty());

    writer.delete_schema("public").await.unwrap();
}

