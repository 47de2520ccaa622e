//! # bemidb
//!
//! Entry point for the three process roles: `start` serves the wire
//! protocol over the lake, `sync` runs the extraction pipeline (once, or
//! on an interval when `PG_SYNC_INTERVAL` is set), `version` prints the
//! release and exits.
//!
//! Configuration is environment-first; every flag mirrors an environment
//! variable so containerized deployments need no arguments at all.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bemidb_core::{Config, SchemaTable};
use bemidb_sync::{SyncOptions, Syncer};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "bemidb")]
#[command(about = "Postgres-compatible analytical read replica backed by Apache Iceberg")]
struct Args {
    /// Only re-sync tables changed since this instant; accepts a duration
    /// ("24h", "90m") or an RFC 3339 timestamp.
    #[arg(long, value_name = "DURATION_OR_RFC3339")]
    since: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,

    /// Wire server listen host.
    #[arg(long, env = "BEMIDB_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Wire server listen port.
    #[arg(long, env = "BEMIDB_PORT", default_value_t = 54321)]
    port: u16,

    /// Database name advertised to wire clients.
    #[arg(long, env = "BEMIDB_DATABASE", default_value = "bemidb")]
    database: String,

    /// Wire username; together with --password enables cleartext auth.
    #[arg(long, env = "BEMIDB_USER")]
    user: Option<String>,

    /// Wire password; unset means trust authentication.
    #[arg(long, env = "BEMIDB_PASSWORD")]
    password: Option<String>,

    /// Root directory for lake data and sync state.
    #[arg(long, env = "BEMIDB_STORAGE_PATH", default_value = "./bemidb-data")]
    storage_path: PathBuf,

    /// Source Postgres connection URL; required for sync.
    #[arg(long, env = "PG_DATABASE_URL")]
    pg_database_url: Option<String>,

    /// When set, `sync` loops with this pause between runs (e.g. "10m").
    #[arg(long, env = "PG_SYNC_INTERVAL")]
    pg_sync_interval: Option<String>,

    /// Only sync these schemas (comma separated).
    #[arg(long, env = "PG_INCLUDE_SCHEMAS", value_delimiter = ',')]
    pg_include_schemas: Option<Vec<String>>,

    /// Skip these schemas (comma separated).
    #[arg(long, env = "PG_EXCLUDE_SCHEMAS", value_delimiter = ',')]
    pg_exclude_schemas: Option<Vec<String>>,

    /// Only sync these tables, as schema.table (comma separated).
    #[arg(long, env = "PG_INCLUDE_TABLES", value_delimiter = ',')]
    pg_include_tables: Option<Vec<String>>,

    /// Skip these tables, as schema.table (comma separated).
    #[arg(long, env = "PG_EXCLUDE_TABLES", value_delimiter = ',')]
    pg_exclude_tables: Option<Vec<String>>,

    /// Prefix prepended to lake schema names. Non-empty disables deletion
    /// reconciliation.
    #[arg(long, env = "PG_SCHEMA_PREFIX", default_value = "")]
    pg_schema_prefix: String,

    /// Disable the anonymous usage beacon.
    #[arg(long, env = "BEMIDB_DISABLE_ANONYMOUS_ANALYTICS")]
    disable_analytics: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the Postgres wire protocol (default).
    Start,
    /// Extract the source database into the lake.
    Sync,
    /// Print the version and exit.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let since = args.since.as_deref().map(parse_since).transpose()?;
    let config = Arc::new(build_config(&args)?);

    match args.command.unwrap_or(Command::Start) {
        Command::Version => {
            println!("bemidb {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Start => {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("shutting down");
                    Ok(())
                }
                result = bemidb_server::serve(config) => result,
            }
        }
        Command::Sync => {
            let syncer = Syncer::new(config.clone())?;
            let options = SyncOptions { since };
            match config.sync_interval {
                Some(interval) => loop {
                    if let Err(e) = syncer.sync_from_source(&options).await {
                        // Daemon mode: log and retry on the next interval.
                        error!(error = ?e, "sync run failed");
                    }
                    info!(interval = ?interval, "sleeping until next sync");
                    tokio::time::sleep(interval).await;
                },
                None => syncer.sync_from_source(&options).await,
            }
        }
    }
}

fn build_config(args: &Args) -> Result<Config> {
    Ok(Config {
        host: args.host.clone(),
        port: args.port,
        database: args.database.clone(),
        user: args.user.clone(),
        password: args.password.clone(),
        storage_path: args.storage_path.clone(),
        database_url: args.pg_database_url.clone(),
        sync_interval: args
            .pg_sync_interval
            .as_deref()
            .map(humantime::parse_duration)
            .transpose()
            .context("parse PG_SYNC_INTERVAL")?,
        include_schemas: args.pg_include_schemas.clone(),
        exclude_schemas: args.pg_exclude_schemas.clone(),
        include_tables: args.pg_include_tables.as_deref().map(parse_tables).transpose()?,
        exclude_tables: args.pg_exclude_tables.as_deref().map(parse_tables).transpose()?,
        schema_prefix: args.pg_schema_prefix.clone(),
        disable_analytics: args.disable_analytics,
    })
}

fn parse_tables(entries: &[String]) -> Result<Vec<SchemaTable>> {
    entries
        .iter()
        .map(|entry| {
            SchemaTable::parse(entry)
                .ok_or_else(|| anyhow!("table filter {entry:?} is not schema.table"))
        })
        .collect()
}

/// A duration ("24h") counts back from now; otherwise an RFC 3339 instant.
fn parse_since(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(duration) = humantime::parse_duration(value) {
        let duration = ChronoDuration::from_std(duration).context("--since duration too large")?;
        return Ok(Utc::now() - duration);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|instant| instant.with_timezone(&Utc))
        .with_context(|| format!("--since {value:?} is neither a duration nor RFC 3339"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_accepts_durations_and_instants() {
        let yesterday = parse_since("24h").unwrap();
        assert!(yesterday < Utc::now());

        let fixed = parse_since("2026-01-02T03:04:05Z").unwrap();
        assert_eq!(fixed, "2026-01-02T03:04:05Z".parse::<DateTime<Utc>>().unwrap());

        assert!(parse_since("soon").is_err());
    }

    #[test]
    fn table_filters_must_be_qualified() {
        assert!(parse_tables(&["public.users".into()]).is_ok());
        assert!(parse_tables(&["users".into()]).is_err());
    }
}
