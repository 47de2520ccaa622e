//! Immutable process configuration.
//!
//! The binary populates this from environment variables and flags; nothing
//! here re-reads the environment, so tests can construct configurations
//! directly.

use std::path::PathBuf;
use std::time::Duration;

use crate::descriptors::SchemaTable;

#[derive(Debug, Clone)]
pub struct Config {
    /// Wire server listen address.
    pub host: String,
    pub port: u16,
    /// Database name advertised to wire clients.
    pub database: String,
    /// Wire credentials; both unset means trust authentication.
    pub user: Option<String>,
    pub password: Option<String>,

    /// Root for lake data and per-table sync state.
    pub storage_path: PathBuf,

    /// Source connection URL; required for sync.
    pub database_url: Option<String>,
    /// When set, `sync` loops with this pause between runs.
    pub sync_interval: Option<Duration>,

    pub include_schemas: Option<Vec<String>>,
    pub exclude_schemas: Option<Vec<String>>,
    pub include_tables: Option<Vec<SchemaTable>>,
    pub exclude_tables: Option<Vec<SchemaTable>>,

    /// Prepended to lake schema names. Non-empty suppresses deletion
    /// reconciliation: other tenants' tables may share the lake.
    pub schema_prefix: String,

    pub disable_analytics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 54321,
            database: "bemidb".into(),
            user: None,
            password: None,
            storage_path: PathBuf::from("./bemidb-data"),
            database_url: None,
            sync_interval: None,
            include_schemas: None,
            exclude_schemas: None,
            include_tables: None,
            exclude_tables: None,
            schema_prefix: String::new(),
            disable_analytics: false,
        }
    }
}

impl Config {
    /// Whether a source table passes the sync filters.
    ///
    /// Precedence: include-schemas, exclude-schemas, include-tables,
    /// exclude-tables. An include list is exhaustive (only listed entries
    /// pass) and shadows the corresponding exclude list; with neither
    /// form present everything passes. Pure in (schema, table, config).
    pub fn should_sync(&self, table: &SchemaTable) -> bool {
        if let Some(include) = &self.include_schemas {
            if !include.contains(&table.schema) {
                return false;
            }
        } else if let Some(exclude) = &self.exclude_schemas {
            if exclude.contains(&table.schema) {
                return false;
            }
        }

        if let Some(include) = &self.include_tables {
            if !include.contains(table) {
                return false;
            }
        } else if let Some(exclude) = &self.exclude_tables {
            if exclude.contains(table) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> SchemaTable {
        SchemaTable::parse(s).unwrap()
    }

    #[test]
    fn no_filters_pass_everything() {
        let config = Config::default();
        assert!(config.should_sync(&t("public.users")));
        assert!(config.should_sync(&t("other.events")));
    }

    #[test]
    fn include_schemas_is_exhaustive_and_wins_over_exclude() {
        let config = Config {
            include_schemas: Some(vec!["public".into()]),
            // Shadowed: include takes priority.
            exclude_schemas: Some(vec!["public".into()]),
            ..Config::default()
        };
        assert!(config.should_sync(&t("public.users")));
        assert!(!config.should_sync(&t("other.users")));
    }

    #[test]
    fn exclude_tables_is_subtractive() {
        let config = Config {
            exclude_tables: Some(vec![t("test_schema.simple_table")]),
            ..Config::default()
        };
        assert!(!config.should_sync(&t("test_schema.simple_table")));
        assert!(config.should_sync(&t("test_schema.other_table")));
    }

    #[test]
    fn schema_and_table_filters_compose() {
        let config = Config {
            include_schemas: Some(vec!["sales".into()]),
            include_tables: Some(vec![t("sales.orders")]),
            ..Config::default()
        };
        assert!(config.should_sync(&t("sales.orders")));
        assert!(!config.should_sync(&t("sales.refunds")));
        assert!(!config.should_sync(&t("public.orders")));
    }

    #[test]
    fn filter_is_deterministic() {
        let config = Config {
            include_schemas: Some(vec!["a".into()]),
            exclude_tables: Some(vec![t("a.x")]),
            ..Config::default()
        };
        for _ in 0..3 {
            assert!(config.should_sync(&t("a.y")));
            assert!(!config.should_sync(&t("a.x")));
            assert!(!config.should_sync(&t("b.y")));
        }
    }
}
