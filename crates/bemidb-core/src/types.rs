//! Source-to-lake type mapping.
//!
//! The mapping is deterministic and stable across runs; changing it is a
//! breaking schema evolution for every table that uses the affected type.

use tracing::warn;

use crate::descriptors::{IcebergField, LakeType, SourceColumn};
use crate::error::BemiError;

/// Default precision/scale for numerics declared without one. Values wider
/// than this are truncated on write.
const DEFAULT_DECIMAL_PRECISION: u8 = 38;
const DEFAULT_DECIMAL_SCALE: i8 = 9;

/// Map one source column to its lake field. Arrays (`_`-prefixed
/// `udt_name`) recurse on the element type and set `is_list`.
pub fn map_column(column: &SourceColumn) -> Result<IcebergField, BemiError> {
    let (udt_name, is_list) = match column.udt_name.strip_prefix('_') {
        Some(elem) => (elem, true),
        None => (column.udt_name.as_str(), false),
    };

    let field_type = map_udt(column, udt_name)?;

    Ok(IcebergField {
        name: column.name.clone(),
        field_type,
        required: !column.is_nullable,
        is_list,
    })
}

fn map_udt(column: &SourceColumn, udt_name: &str) -> Result<LakeType, BemiError> {
    let ty = match udt_name {
        "int2" | "int4" => LakeType::Int,
        "int8" => LakeType::Long,
        "numeric" => {
            if column.numeric_precision == 0 {
                // Unconstrained numeric: widen to the default and accept
                // that values outside it are lossy.
                warn!(
                    column = %column.name,
                    "numeric without declared precision, using decimal({}, {})",
                    DEFAULT_DECIMAL_PRECISION,
                    DEFAULT_DECIMAL_SCALE
                );
                LakeType::Decimal {
                    precision: DEFAULT_DECIMAL_PRECISION,
                    scale: DEFAULT_DECIMAL_SCALE,
                }
            } else {
                LakeType::Decimal {
                    precision: column.numeric_precision.clamp(1, 38) as u8,
                    scale: column.numeric_scale.clamp(0, 38) as i8,
                }
            }
        }
        "float4" => LakeType::Float,
        "float8" => LakeType::Double,
        "text" | "varchar" | "char" | "bpchar" => LakeType::String,
        "bool" => LakeType::Boolean,
        "date" => LakeType::Date,
        "time" | "timetz" => LakeType::Time,
        "timestamp" => LakeType::Timestamp,
        "timestamptz" => LakeType::Timestamptz,
        "bytea" => LakeType::Binary,
        "uuid" => LakeType::Uuid,
        // Serialized form; queries see the JSON text.
        "json" | "jsonb" => LakeType::String,
        _ if column.data_type == "USER-DEFINED" => {
            // Composite and enum types surface as their dialect text
            // representation.
            LakeType::String
        }
        _ => {
            return Err(BemiError::UnsupportedType {
                namespace: column.namespace.clone(),
                udt_name: column.udt_name.clone(),
            })
        }
    };
    Ok(ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(udt_name: &str, data_type: &str) -> SourceColumn {
        SourceColumn {
            name: "c".into(),
            data_type: data_type.into(),
            udt_name: udt_name.into(),
            namespace: "pg_catalog".into(),
            is_nullable: true,
            ordinal_position: 1,
            character_maximum_length: 0,
            numeric_precision: 0,
            numeric_scale: 0,
            datetime_precision: 0,
        }
    }

    #[test]
    fn integer_widths() {
        assert_eq!(map_column(&column("int2", "smallint")).unwrap().field_type, LakeType::Int);
        assert_eq!(map_column(&column("int4", "integer")).unwrap().field_type, LakeType::Int);
        assert_eq!(map_column(&column("int8", "bigint")).unwrap().field_type, LakeType::Long);
    }

    #[test]
    fn numeric_with_and_without_precision() {
        let mut c = column("numeric", "numeric");
        c.numeric_precision = 10;
        c.numeric_scale = 2;
        assert_eq!(
            map_column(&c).unwrap().field_type,
            LakeType::Decimal { precision: 10, scale: 2 }
        );

        let unconstrained = column("numeric", "numeric");
        assert_eq!(
            map_column(&unconstrained).unwrap().field_type,
            LakeType::Decimal { precision: 38, scale: 9 }
        );
    }

    #[test]
    fn arrays_recurse_on_element_type() {
        let f = map_column(&column("_int4", "ARRAY")).unwrap();
        assert!(f.is_list);
        assert_eq!(f.field_type, LakeType::Int);

        let f = map_column(&column("_text", "ARRAY")).unwrap();
        assert!(f.is_list);
        assert_eq!(f.field_type, LakeType::String);
    }

    #[test]
    fn required_follows_nullability() {
        let mut c = column("int4", "integer");
        c.is_nullable = false;
        assert!(map_column(&c).unwrap().required);
        c.is_nullable = true;
        assert!(!map_column(&c).unwrap().required);
    }

    #[test]
    fn user_defined_types_map_to_string() {
        let mut c = column("order_status", "USER-DEFINED");
        c.namespace = "public".into();
        assert_eq!(map_column(&c).unwrap().field_type, LakeType::String);
    }

    #[test]
    fn unknown_types_fail_with_identity() {
        let mut c = column("tsvector", "tsvector");
        c.namespace = "pg_catalog".into();
        match map_column(&c) {
            Err(BemiError::UnsupportedType { namespace, udt_name }) => {
                assert_eq!(namespace, "pg_catalog");
                assert_eq!(udt_name, "tsvector");
            }
            other => panic!("expected UnsupportedType, got {other:?}"),
        }
    }

    #[test]
    fn mapping_preserves_category_nullability_listness() {
        // Mapping then reverse classification via the iceberg type string
        // keeps category, nullability and listness intact.
        for (udt, data_type) in [
            ("int8", "bigint"),
            ("float8", "double precision"),
            ("uuid", "uuid"),
            ("_bool", "ARRAY"),
            ("timestamptz", "timestamp with time zone"),
        ] {
            let mut c = column(udt, data_type);
            c.is_nullable = false;
            let mapped = map_column(&c).unwrap();
            let reparsed = LakeType::from_iceberg(&mapped.field_type.iceberg_type()).unwrap();
            assert_eq!(reparsed, mapped.field_type);
            assert!(mapped.required);
            assert_eq!(mapped.is_list, udt.starts_with('_'));
        }
    }
}
