//! Conversion of spooled text rows into Arrow record batches.
//!
//! Every cell arrives as the raw text the source's CSV export produced;
//! the reserved NULL sentinel becomes a true null irrespective of the
//! target type. Array cells carry the source dialect's `{...}` literal
//! and parse into Arrow lists.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use bemidb_core::{IcebergField, LakeType, PG_NULL_STRING};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use datafusion::arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Decimal128Builder, FixedSizeBinaryBuilder,
    ListArray, PrimitiveBuilder, RecordBatch, StringBuilder,
};
use datafusion::arrow::buffer::{NullBuffer, OffsetBuffer};
use datafusion::arrow::datatypes::{
    ArrowPrimitiveType, Date32Type, Field, Float32Type, Float64Type, Int32Type, Int64Type,
    Schema, Time64MicrosecondType, TimestampMicrosecondType,
};

/// Assemble a record batch from text rows ordered like `fields`.
pub fn rows_to_batch(fields: &[IcebergField], rows: &[Vec<String>]) -> Result<RecordBatch> {
    let arrow_fields: Vec<Field> = fields.iter().map(|f| f.arrow_field()).collect();
    let schema = Arc::new(Schema::new(arrow_fields));

    for (i, row) in rows.iter().enumerate() {
        if row.len() != fields.len() {
            bail!("row {} has {} fields, expected {}", i, row.len(), fields.len());
        }
    }

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(fields.len());
    for (idx, field) in fields.iter().enumerate() {
        let cells: Vec<Option<&str>> = rows
            .iter()
            .map(|row| {
                let cell = row[idx].as_str();
                (cell != PG_NULL_STRING).then_some(cell)
            })
            .collect();
        let array = field_array(field, &cells)
            .with_context(|| format!("column {:?}", field.name))?;
        columns.push(array);
    }

    RecordBatch::try_new(schema, columns).map_err(Into::into)
}

fn field_array(field: &IcebergField, cells: &[Option<&str>]) -> Result<ArrayRef> {
    if !field.is_list {
        return scalar_array(field.field_type, cells);
    }

    // Flatten parsed array literals, tracking offsets and list validity.
    let mut offsets: Vec<i32> = Vec::with_capacity(cells.len() + 1);
    offsets.push(0);
    let mut validity: Vec<bool> = Vec::with_capacity(cells.len());
    let mut flat: Vec<Option<String>> = Vec::new();

    for cell in cells {
        match cell {
            None => {
                validity.push(false);
                offsets.push(flat.len() as i32);
            }
            Some(text) => {
                let items = parse_pg_array(text)?;
                flat.extend(items);
                validity.push(true);
                offsets.push(flat.len() as i32);
            }
        }
    }

    let flat_refs: Vec<Option<&str>> = flat.iter().map(|v| v.as_deref()).collect();
    let values = scalar_array(field.field_type, &flat_refs)?;
    let item = Arc::new(Field::new("item", field.field_type.arrow_type(), true));
    let list = ListArray::try_new(
        item,
        OffsetBuffer::new(offsets.into()),
        values,
        Some(NullBuffer::from(validity)),
    )?;
    Ok(Arc::new(list))
}

fn scalar_array(ty: LakeType, cells: &[Option<&str>]) -> Result<ArrayRef> {
    match ty {
        LakeType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(cells.len());
            for cell in cells {
                match cell {
                    None => b.append_null(),
                    Some(s) => b.append_value(parse_bool(s)?),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        LakeType::Int => primitive::<Int32Type>(cells, |s| s.parse().map_err(Into::into)),
        LakeType::Long => primitive::<Int64Type>(cells, |s| s.parse().map_err(Into::into)),
        LakeType::Float => primitive::<Float32Type>(cells, |s| s.parse().map_err(Into::into)),
        LakeType::Double => primitive::<Float64Type>(cells, |s| s.parse().map_err(Into::into)),
        LakeType::Decimal { precision, scale } => {
            let mut b = Decimal128Builder::with_capacity(cells.len())
                .with_precision_and_scale(precision, scale)?;
            for cell in cells {
                match cell {
                    None => b.append_null(),
                    Some(s) => b.append_value(parse_decimal(s, precision, scale)?),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        LakeType::Date => primitive::<Date32Type>(cells, parse_date_days),
        LakeType::Time => primitive::<Time64MicrosecondType>(cells, parse_time_micros),
        LakeType::Timestamp => primitive::<TimestampMicrosecondType>(cells, parse_timestamp_micros),
        LakeType::Timestamptz => {
            let mut b = PrimitiveBuilder::<TimestampMicrosecondType>::with_capacity(cells.len())
                .with_timezone("+00:00");
            for cell in cells {
                match cell {
                    None => b.append_null(),
                    Some(s) => b.append_value(parse_timestamptz_micros(s)?),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        LakeType::String => {
            let mut b = StringBuilder::new();
            for cell in cells {
                b.append_option(*cell);
            }
            Ok(Arc::new(b.finish()))
        }
        LakeType::Binary => {
            let mut b = BinaryBuilder::new();
            for cell in cells {
                match cell {
                    None => b.append_null(),
                    Some(s) => b.append_value(parse_bytea(s)?),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        LakeType::Uuid => {
            let mut b = FixedSizeBinaryBuilder::with_capacity(cells.len(), 16);
            for cell in cells {
                match cell {
                    None => b.append_null(),
                    Some(s) => {
                        let id = uuid::Uuid::parse_str(s)
                            .with_context(|| format!("invalid uuid {s:?}"))?;
                        b.append_value(id.into_bytes())?;
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
    }
}

fn primitive<T>(
    cells: &[Option<&str>],
    parse: impl Fn(&str) -> Result<T::Native>,
) -> Result<ArrayRef>
where
    T: ArrowPrimitiveType,
{
    let mut b = PrimitiveBuilder::<T>::with_capacity(cells.len());
    for cell in cells {
        match cell {
            None => b.append_null(),
            Some(s) => b.append_value(parse(s)?),
        }
    }
    Ok(Arc::new(b.finish()))
}

fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "t" | "true" | "TRUE" => Ok(true),
        "f" | "false" | "FALSE" => Ok(false),
        other => Err(anyhow!("invalid boolean {other:?}")),
    }
}

/// Scaled integer representation of a numeric literal. Fractional digits
/// beyond the declared scale are truncated.
fn parse_decimal(s: &str, precision: u8, scale: i8) -> Result<i128> {
    let negative = s.starts_with('-');
    let digits = s.trim_start_matches(['+', '-']);
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));

    let mut value: i128 = 0;
    let mut push = |c: char| -> Result<()> {
        let d = c.to_digit(10).ok_or_else(|| anyhow!("invalid numeric {s:?}"))?;
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(d as i128))
            .ok_or_else(|| anyhow!("numeric {s:?} overflows decimal({precision}, {scale})"))?;
        Ok(())
    };

    for c in int_part.chars() {
        push(c)?;
    }
    let mut frac = frac_part.chars();
    for _ in 0..scale.max(0) {
        push(frac.next().unwrap_or('0'))?;
    }

    let limit = 10i128.pow(precision as u32);
    if value >= limit {
        bail!("numeric {s:?} overflows decimal({precision}, {scale})");
    }
    Ok(if negative { -value } else { value })
}

fn parse_date_days(s: &str) -> Result<i32> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("invalid date {s:?}"))?;
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
    Ok((date - epoch).num_days() as i32)
}

fn parse_time_micros(s: &str) -> Result<i64> {
    // timetz values carry a trailing offset; the clock reading is kept.
    let clock = s.split(['+']).next().unwrap_or(s);
    let clock = match clock.char_indices().find(|(i, c)| *c == '-' && *i >= 2) {
        Some((i, _)) => &clock[..i],
        None => clock,
    };
    let time = NaiveTime::parse_from_str(clock, "%H:%M:%S%.f")
        .with_context(|| format!("invalid time {s:?}"))?;
    Ok(time.num_seconds_from_midnight() as i64 * 1_000_000 + (time.nanosecond() / 1_000) as i64)
}

fn parse_timestamp_micros(s: &str) -> Result<i64> {
    let ts = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .with_context(|| format!("invalid timestamp {s:?}"))?;
    Ok(ts.and_utc().timestamp_micros())
}

fn parse_timestamptz_micros(s: &str) -> Result<i64> {
    DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .map(|ts| ts.timestamp_micros())
        .with_context(|| format!("invalid timestamptz {s:?}"))
}

fn parse_bytea(s: &str) -> Result<Vec<u8>> {
    let hex = s
        .strip_prefix("\\x")
        .ok_or_else(|| anyhow!("invalid bytea literal {s:?}"))?;
    if hex.len() % 2 != 0 {
        bail!("invalid bytea literal {s:?}");
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair)?;
            u8::from_str_radix(pair, 16).with_context(|| format!("invalid bytea literal {s:?}"))
        })
        .collect()
}

/// Parse a one-dimensional source array literal (`{a,"b c",NULL}`) into
/// element strings. Unquoted NULL is an element-level null.
pub fn parse_pg_array(s: &str) -> Result<Vec<Option<String>>> {
    let inner = s
        .trim()
        .strip_prefix('{')
        .and_then(|x| x.strip_suffix('}'))
        .ok_or_else(|| anyhow!("invalid array literal {s:?}"))?;
    if inner.is_empty() {
        return Ok(Vec::new());
    }

    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut chars = inner.chars();

    let finish = |current: &mut String, quoted: &mut bool, items: &mut Vec<Option<String>>| {
        let text = std::mem::take(current);
        if !*quoted && text == "NULL" {
            items.push(None);
        } else {
            items.push(Some(text));
        }
        *quoted = false;
    };

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ',' if !in_quotes => finish(&mut current, &mut quoted, &mut items),
            _ => current.push(c),
        }
    }
    if in_quotes {
        bail!("unterminated quote in array literal {s:?}");
    }
    finish(&mut current, &mut quoted, &mut items);

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::Array;

    fn field(name: &str, field_type: LakeType, is_list: bool) -> IcebergField {
        IcebergField { name: name.into(), field_type, required: false, is_list }
    }

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn null_sentinel_becomes_null_for_every_type() {
        let fields = vec![
            field("b", LakeType::Boolean, false),
            field("i", LakeType::Int, false),
            field("l", LakeType::Long, false),
            field("f", LakeType::Float, false),
            field("d", LakeType::Double, false),
            field("n", LakeType::Decimal { precision: 10, scale: 2 }, false),
            field("dt", LakeType::Date, false),
            field("tm", LakeType::Time, false),
            field("ts", LakeType::Timestamp, false),
            field("tz", LakeType::Timestamptz, false),
            field("s", LakeType::String, false),
            field("by", LakeType::Binary, false),
            field("u", LakeType::Uuid, false),
            field("a", LakeType::Int, true),
        ];
        let rows = vec![row(&[PG_NULL_STRING; 14])];
        let batch = rows_to_batch(&fields, &rows).unwrap();
        assert_eq!(batch.num_rows(), 1);
        for column in batch.columns() {
            assert!(column.is_null(0));
        }
    }

    #[test]
    fn typed_values_parse() {
        let fields = vec![
            field("b", LakeType::Boolean, false),
            field("l", LakeType::Long, false),
            field("n", LakeType::Decimal { precision: 10, scale: 2 }, false),
            field("dt", LakeType::Date, false),
            field("ts", LakeType::Timestamp, false),
            field("tz", LakeType::Timestamptz, false),
            field("by", LakeType::Binary, false),
            field("u", LakeType::Uuid, false),
        ];
        let rows = vec![row(&[
            "t",
            "-42",
            "123.456",
            "1970-01-02",
            "2024-06-01 12:30:00.25",
            "2024-06-01 12:30:00+00",
            "\\x0102ff",
            "00000000-0000-0000-0000-000000000001",
        ])];
        let batch = rows_to_batch(&fields, &rows).unwrap();

        use datafusion::arrow::array::{
            BinaryArray, BooleanArray, Date32Array, Decimal128Array, Int64Array,
            TimestampMicrosecondArray,
        };
        assert!(batch.column(0).as_any().downcast_ref::<BooleanArray>().unwrap().value(0));
        assert_eq!(batch.column(1).as_any().downcast_ref::<Int64Array>().unwrap().value(0), -42);
        // 123.456 truncates to scale 2.
        assert_eq!(
            batch.column(2).as_any().downcast_ref::<Decimal128Array>().unwrap().value(0),
            12345
        );
        assert_eq!(batch.column(3).as_any().downcast_ref::<Date32Array>().unwrap().value(0), 1);
        let ts = batch.column(4).as_any().downcast_ref::<TimestampMicrosecondArray>().unwrap();
        assert_eq!(ts.value(0) % 1_000_000, 250_000);
        let tz = batch.column(5).as_any().downcast_ref::<TimestampMicrosecondArray>().unwrap();
        assert_eq!(tz.value(0), ts.value(0) - 250_000);
        assert_eq!(
            batch.column(6).as_any().downcast_ref::<BinaryArray>().unwrap().value(0),
            &[0x01, 0x02, 0xff]
        );
    }

    #[test]
    fn array_cells_become_lists() {
        let fields = vec![field("a", LakeType::Int, true)];
        let rows = vec![
            row(&["{1,2,3}"]),
            row(&["{}"]),
            row(&[PG_NULL_STRING]),
            row(&["{4,NULL}"]),
        ];
        let batch = rows_to_batch(&fields, &rows).unwrap();
        let list = batch.column(0).as_any().downcast_ref::<ListArray>().unwrap();
        assert_eq!(list.value_length(0), 3);
        assert_eq!(list.value_length(1), 0);
        assert!(list.is_null(2));
        assert_eq!(list.value_length(3), 2);
        assert!(list.values().is_null(4));
    }

    #[test]
    fn pg_array_literal_quoting() {
        assert_eq!(
            parse_pg_array("{a,\"b, c\",NULL,\"NULL\",\"d\\\"e\"}").unwrap(),
            vec![
                Some("a".to_string()),
                Some("b, c".to_string()),
                None,
                Some("NULL".to_string()),
                Some("d\"e".to_string()),
            ]
        );
        assert_eq!(parse_pg_array("{}").unwrap(), Vec::<Option<String>>::new());
        assert!(parse_pg_array("1,2").is_err());
    }

    #[test]
    fn decimal_edge_cases() {
        assert_eq!(parse_decimal("0", 10, 2).unwrap(), 0);
        assert_eq!(parse_decimal("-0.5", 10, 2).unwrap(), -50);
        assert_eq!(parse_decimal("7", 10, 2).unwrap(), 700);
        assert!(parse_decimal("100", 3, 2).is_err());
        assert!(parse_decimal("abc", 10, 2).is_err());
    }

    #[test]
    fn time_with_zone_keeps_clock_reading() {
        assert_eq!(parse_time_micros("00:00:01").unwrap(), 1_000_000);
        assert_eq!(
            parse_time_micros("12:00:00.5+02").unwrap(),
            parse_time_micros("12:00:00.5").unwrap()
        );
        assert_eq!(
            parse_time_micros("12:00:00-05").unwrap(),
            parse_time_micros("12:00:00").unwrap()
        );
    }

    #[test]
    fn row_width_mismatch_fails() {
        let fields = vec![field("a", LakeType::Int, false), field("b", LakeType::Int, false)];
        assert!(rows_to_batch(&fields, &[row(&["1"])]).is_err());
    }
}
