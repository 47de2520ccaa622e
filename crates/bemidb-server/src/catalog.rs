//! Built-in answers for the system queries Postgres clients issue during
//! startup and introspection, served without touching the engine.

use pgwire::api::results::{Response, Tag};
use pgwire::error::PgWireResult;

use crate::encode::{rows_response, text_field};
use crate::engine::QueryEngine;

const SERVER_VERSION: &str = "16.6";

/// Answer a system query from the built-in table, or `None` when the
/// statement is a regular query for the engine.
pub async fn try_system_response(
    sql: &str,
    engine: &QueryEngine,
) -> PgWireResult<Option<Vec<Response>>> {
    let lower = sql.trim().trim_end_matches(';').to_lowercase();

    // Session control statements are acknowledged and otherwise ignored:
    // there is no transaction state to manage on a read-only catalog.
    for (keyword, tag) in [
        ("set ", "SET"),
        ("begin", "BEGIN"),
        ("start transaction", "BEGIN"),
        ("commit", "COMMIT"),
        ("rollback", "ROLLBACK"),
        ("discard ", "DISCARD"),
        ("deallocate ", "DEALLOCATE"),
        ("close ", "CLOSE"),
    ] {
        if lower == tag.to_lowercase() || lower.starts_with(keyword) {
            return Ok(Some(vec![Response::Execution(Tag::new(tag))]));
        }
    }

    if lower.starts_with("show ") {
        let variable = lower.trim_start_matches("show ").trim();
        let value = show_variable(variable);
        return Ok(Some(vec![Response::Query(rows_response(
            vec![text_field(variable)],
            vec![vec![Some(value.to_string())]],
        ))]));
    }

    if lower.contains("version()") {
        return Ok(Some(single_value(
            "version",
            format!("PostgreSQL {SERVER_VERSION} (BemiDB)"),
        )));
    }
    if lower.contains("current_database()") {
        return Ok(Some(single_value("current_database", engine.database_name().to_string())));
    }
    if lower.contains("current_schema") {
        return Ok(Some(single_value("current_schema", "public".to_string())));
    }
    if lower.contains("pg_backend_pid()") {
        return Ok(Some(single_value("pg_backend_pid", std::process::id().to_string())));
    }

    if lower.contains("pg_namespace") {
        let schemas = engine.lake_schemas().await.map_err(crate::handler::api_error)?;
        return Ok(Some(vec![Response::Query(rows_response(
            vec![text_field("nspname")],
            schemas.into_iter().map(|s| vec![Some(s)]).collect(),
        ))]));
    }
    if lower.contains("pg_tables") || lower.contains("pg_catalog.pg_class") {
        let tables = engine.lake_tables().await.map_err(crate::handler::api_error)?;
        return Ok(Some(vec![Response::Query(rows_response(
            vec![text_field("schemaname"), text_field("tablename")],
            tables
                .into_iter()
                .map(|t| vec![Some(t.schema), Some(t.table)])
                .collect(),
        ))]));
    }

    Ok(None)
}

fn single_value(name: &str, value: String) -> Vec<Response> {
    vec![Response::Query(rows_response(vec![text_field(name)], vec![vec![Some(value)]]))]
}

fn show_variable(variable: &str) -> &'static str {
    match variable {
        "server_version" => SERVER_VERSION,
        "search_path" => "\"$user\", public",
        "timezone" | "time zone" => "UTC",
        "client_encoding" | "server_encoding" => "UTF8",
        "standard_conforming_strings" => "on",
        "transaction isolation level" => "read committed",
        "datestyle" => "ISO, MDY",
        _ => "",
    }
}

/// System statements are recognized by shape, not by executing them.
pub fn is_system_query(sql: &str) -> bool {
    let lower = sql.trim().to_lowercase();
    ["set ", "begin", "start transaction", "commit", "rollback", "show ", "discard ", "deallocate ", "close "]
        .iter()
        .any(|prefix| lower.starts_with(prefix))
        || ["version()", "current_database()", "current_schema", "pg_backend_pid()", "pg_namespace", "pg_tables", "pg_catalog.pg_class"]
            .iter()
            .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_client_bootstrap_queries() {
        assert!(is_system_query("SELECT version()"));
        assert!(is_system_query("SHOW search_path"));
        assert!(is_system_query("SET client_encoding TO 'UTF8'"));
        assert!(is_system_query("BEGIN"));
        assert!(is_system_query("select nspname from pg_catalog.pg_namespace"));
        assert!(!is_system_query("SELECT id FROM test_schema.simple_table"));
    }

    #[test]
    fn show_variables_have_answers() {
        assert_eq!(show_variable("server_version"), "16.6");
        assert_eq!(show_variable("search_path"), "\"$user\", public");
        assert_eq!(show_variable("made_up_setting"), "");
    }
}
