//! Value types naming schemas, tables and columns in source and lake
//! vocabularies.

use std::fmt;
use std::sync::Arc;

use datafusion::arrow::datatypes::{DataType, Field, TimeUnit};
use serde::{Deserialize, Serialize};

/// Ordered pair of schema and table name, rendered as a quoted dotted
/// identifier. Case is preserved exactly as observed at the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaTable {
    pub schema: String,
    pub table: String,
}

impl SchemaTable {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self { schema: schema.into(), table: table.into() }
    }

    /// Parse a `schema.table` identifier. Only the first dot splits, so
    /// table names containing dots survive.
    pub fn parse(s: &str) -> Option<Self> {
        let (schema, table) = s.split_once('.')?;
        if schema.is_empty() || table.is_empty() {
            return None;
        }
        Some(Self::new(schema, table))
    }

    /// The lake-side identity of this source table under an optional
    /// schema prefix.
    pub fn with_prefix(&self, prefix: &str) -> SchemaTable {
        if prefix.is_empty() {
            self.clone()
        } else {
            SchemaTable::new(format!("{prefix}{}", self.schema), self.table.clone())
        }
    }
}

impl fmt::Display for SchemaTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

/// Quote an identifier for splicing into SQL, doubling embedded quotes.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A column as observed in the source's information schema. Fetched per
/// sync, never persisted. `(namespace, udt_name)` uniquely identifies a
/// type instance; numeric attributes missing at the source are zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceColumn {
    pub name: String,
    /// Generic category reported by the source (`integer`, `ARRAY`,
    /// `USER-DEFINED`, ...).
    pub data_type: String,
    /// Precise type name in the source dialect (`int4`, `_text`, ...).
    pub udt_name: String,
    /// Schema the type lives in (`pg_catalog` for built-ins).
    pub namespace: String,
    pub is_nullable: bool,
    /// Unique and contiguous from 1 within a table.
    pub ordinal_position: i32,
    pub character_maximum_length: i32,
    pub numeric_precision: i32,
    pub numeric_scale: i32,
    pub datetime_precision: i32,
}

/// Closed set of lake-side column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LakeType {
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Decimal { precision: u8, scale: i8 },
    Date,
    Time,
    Timestamp,
    Timestamptz,
    String,
    Binary,
    Uuid,
}

impl LakeType {
    /// Iceberg schema type string.
    pub fn iceberg_type(&self) -> String {
        match self {
            LakeType::Boolean => "boolean".into(),
            LakeType::Int => "int".into(),
            LakeType::Long => "long".into(),
            LakeType::Float => "float".into(),
            LakeType::Double => "double".into(),
            LakeType::Decimal { precision, scale } => format!("decimal({precision}, {scale})"),
            LakeType::Date => "date".into(),
            LakeType::Time => "time".into(),
            LakeType::Timestamp => "timestamp".into(),
            LakeType::Timestamptz => "timestamptz".into(),
            LakeType::String => "string".into(),
            LakeType::Binary => "binary".into(),
            LakeType::Uuid => "uuid".into(),
        }
    }

    /// Inverse of [`LakeType::iceberg_type`].
    pub fn from_iceberg(s: &str) -> Option<LakeType> {
        let t = match s {
            "boolean" => LakeType::Boolean,
            "int" => LakeType::Int,
            "long" => LakeType::Long,
            "float" => LakeType::Float,
            "double" => LakeType::Double,
            "date" => LakeType::Date,
            "time" => LakeType::Time,
            "timestamp" => LakeType::Timestamp,
            "timestamptz" => LakeType::Timestamptz,
            "string" => LakeType::String,
            "binary" => LakeType::Binary,
            "uuid" => LakeType::Uuid,
            other => {
                let inner = other.strip_prefix("decimal(")?.strip_suffix(')')?;
                let (p, s) = inner.split_once(',')?;
                LakeType::Decimal {
                    precision: p.trim().parse().ok()?,
                    scale: s.trim().parse().ok()?,
                }
            }
        };
        Some(t)
    }

    pub fn arrow_type(&self) -> DataType {
        match self {
            LakeType::Boolean => DataType::Boolean,
            LakeType::Int => DataType::Int32,
            LakeType::Long => DataType::Int64,
            LakeType::Float => DataType::Float32,
            LakeType::Double => DataType::Float64,
            LakeType::Decimal { precision, scale } => DataType::Decimal128(*precision, *scale),
            LakeType::Date => DataType::Date32,
            LakeType::Time => DataType::Time64(TimeUnit::Microsecond),
            LakeType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
            LakeType::Timestamptz => DataType::Timestamp(TimeUnit::Microsecond, Some("+00:00".into())),
            LakeType::String => DataType::Utf8,
            LakeType::Binary => DataType::Binary,
            LakeType::Uuid => DataType::FixedSizeBinary(16),
        }
    }
}

/// A lake column derived from a [`SourceColumn`] by the type mapper.
/// `required` iff the source column is non-nullable; `is_list` iff the
/// source type is an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcebergField {
    pub name: String,
    pub field_type: LakeType,
    pub required: bool,
    pub is_list: bool,
}

impl IcebergField {
    /// Arrow rendering of this field. List fields wrap the element type;
    /// list elements are always nullable.
    pub fn arrow_field(&self) -> Field {
        let elem = self.field_type.arrow_type();
        if self.is_list {
            let item = Arc::new(Field::new("item", elem, true));
            Field::new(&self.name, DataType::List(item), !self.required)
        } else {
            Field::new(&self.name, elem, !self.required)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_table_renders_quoted() {
        let t = SchemaTable::new("Sales", "Orders");
        assert_eq!(t.to_string(), "\"Sales\".\"Orders\"");
    }

    #[test]
    fn embedded_quotes_are_doubled() {
        let t = SchemaTable::new("s", "a\"b");
        assert_eq!(t.to_string(), "\"s\".\"a\"\"b\"");
    }

    #[test]
    fn schema_table_parse_splits_on_first_dot() {
        assert_eq!(
            SchemaTable::parse("public.events.v2"),
            Some(SchemaTable::new("public", "events.v2"))
        );
        assert_eq!(SchemaTable::parse("no_dot"), None);
        assert_eq!(SchemaTable::parse(".t"), None);
    }

    #[test]
    fn prefix_applies_to_schema_only() {
        let t = SchemaTable::new("public", "users");
        assert_eq!(t.with_prefix("tenant1_"), SchemaTable::new("tenant1_public", "users"));
        assert_eq!(t.with_prefix(""), t);
    }

    #[test]
    fn iceberg_type_round_trips() {
        for ty in [
            LakeType::Boolean,
            LakeType::Long,
            LakeType::Decimal { precision: 38, scale: 9 },
            LakeType::Timestamptz,
            LakeType::Uuid,
        ] {
            assert_eq!(LakeType::from_iceberg(&ty.iceberg_type()), Some(ty));
        }
        assert_eq!(LakeType::from_iceberg("struct<a:int>"), None);
    }

    #[test]
    fn list_fields_render_as_arrow_lists() {
        let f = IcebergField {
            name: "tags".into(),
            field_type: LakeType::String,
            required: false,
            is_list: true,
        };
        match f.arrow_field().data_type() {
            DataType::List(item) => assert_eq!(item.data_type(), &DataType::Utf8),
            other => panic!("expected list, got {other:?}"),
        }
    }
}
