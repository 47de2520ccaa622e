//! Arrow-to-wire encoding: row descriptions from Arrow schemas and data
//! rows streamed batch by batch, all in text format.

use std::sync::Arc;

use datafusion::arrow::array::Array;
use datafusion::arrow::datatypes::{DataType, Schema};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::arrow::util::display::array_value_to_string;
use datafusion::execution::SendableRecordBatchStream;
use futures::{stream, StreamExt, TryStreamExt};
use pgwire::api::results::{DataRowEncoder, FieldFormat, FieldInfo, QueryResponse};
use pgwire::api::Type;
use pgwire::error::{PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;

pub fn field_infos(schema: &Schema) -> Vec<FieldInfo> {
    schema
        .fields()
        .iter()
        .map(|field| {
            FieldInfo::new(field.name().clone(), None, None, pg_type(field.data_type()), FieldFormat::Text)
        })
        .collect()
}

fn pg_type(data_type: &DataType) -> Type {
    match data_type {
        DataType::Boolean => Type::BOOL,
        DataType::Int16 => Type::INT2,
        DataType::Int32 => Type::INT4,
        DataType::Int64 => Type::INT8,
        DataType::Float32 => Type::FLOAT4,
        DataType::Float64 => Type::FLOAT8,
        DataType::Decimal128(_, _) => Type::NUMERIC,
        DataType::Date32 => Type::DATE,
        DataType::Time64(_) => Type::TIME,
        DataType::Timestamp(_, None) => Type::TIMESTAMP,
        DataType::Timestamp(_, Some(_)) => Type::TIMESTAMPTZ,
        DataType::Binary | DataType::LargeBinary => Type::BYTEA,
        DataType::FixedSizeBinary(16) => Type::UUID,
        // Lists and everything else travel in their text rendering.
        _ => Type::VARCHAR,
    }
}

fn encode_batch(
    batch: &RecordBatch,
    fields: &Arc<Vec<FieldInfo>>,
) -> Vec<PgWireResult<DataRow>> {
    (0..batch.num_rows())
        .map(|row| {
            let mut encoder = DataRowEncoder::new(fields.clone());
            for column in batch.columns() {
                let value: Option<String> = if column.is_null(row) {
                    None
                } else {
                    Some(
                        array_value_to_string(column, row)
                            .map_err(|e| PgWireError::ApiError(Box::new(e)))?,
                    )
                };
                encoder.encode_field(&value)?;
            }
            encoder.finish()
        })
        .collect()
}

/// Wrap an engine result stream as a wire query response without
/// collecting the full result set.
pub fn stream_response(stream: SendableRecordBatchStream) -> QueryResponse {
    let fields = Arc::new(field_infos(stream.schema().as_ref()));
    let row_fields = fields.clone();
    let rows = stream
        .map_err(|e| PgWireError::ApiError(Box::new(e)))
        .map_ok(move |batch| stream::iter(encode_batch(&batch, &row_fields)))
        .try_flatten();
    QueryResponse::new(fields, rows.boxed())
}

/// Fixed-table response for built-in catalog answers.
pub fn rows_response(
    fields: Vec<FieldInfo>,
    rows: Vec<Vec<Option<String>>>,
) -> QueryResponse {
    let fields = Arc::new(fields);
    let row_fields = fields.clone();
    let data_rows: Vec<PgWireResult<DataRow>> = rows
        .into_iter()
        .map(|row| {
            let mut encoder = DataRowEncoder::new(row_fields.clone());
            for value in &row {
                encoder.encode_field(value)?;
            }
            encoder.finish()
        })
        .collect();
    QueryResponse::new(fields, stream::iter(data_rows).boxed())
}

pub fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.to_string(), None, None, Type::VARCHAR, FieldFormat::Text)
}
