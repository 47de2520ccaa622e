use thiserror::Error;

/// Surface error kinds for BemiDB operations.
///
/// Per-table errors (`UnsupportedType`, `SchemaIncompatible`) are fatal to
/// that table's sync only; cross-cutting errors (`SourceUnavailable`,
/// `CatalogUnavailable`) abort the current run. Wire sessions serialize
/// these as protocol error responses without affecting other sessions.
#[derive(Debug, Error)]
pub enum BemiError {
    /// Required configuration absent; fatal at startup.
    #[error("missing required configuration: {0}")]
    ConfigMissing(&'static str),

    /// Cannot connect to the source, or the connection died mid-sync.
    #[error("source database unavailable: {0}")]
    SourceUnavailable(String),

    /// Column type with no lake mapping; the rest of the run continues.
    #[error("unsupported column type {namespace}.{udt_name}")]
    UnsupportedType { namespace: String, udt_name: String },

    /// Schema evolution rejected (narrowing or type change).
    #[error("incompatible schema change for column {column}: {detail}")]
    SchemaIncompatible { column: String, detail: String },

    #[error("iceberg catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("object store error: {0}")]
    ObjectStore(String),

    /// Write statement rejected on the wire; the session continues.
    #[error("cannot execute a write statement against a read-only server")]
    ReadOnlyViolation,

    /// Client-initiated cancellation of an in-flight query.
    #[error("query canceled on user request")]
    QueryCanceled,
}
