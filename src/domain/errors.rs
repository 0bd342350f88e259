//! Domain Errors
//!
//! Typed failures for each stage of the pipeline. Application code wraps
//! these in `anyhow` once they cross a service boundary.

use crate::domain::value_objects::{BatchStatus, DataEventType, DetectConflict};
use thiserror::Error;

/// Failures raised by a target database.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DbError {
    #[error("unique constraint violated on {table}: {message}")]
    UniqueViolation { table: String, message: String },

    #[error("foreign key constraint violated on {table}: {message}")]
    ForeignKeyViolation { table: String, message: String },

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("database error: {0}")]
    Sql(String),
}

impl DbError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { .. })
    }
}

/// How a detected conflict ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// The fallback statement affected no rows
    Unresolved,
    /// Resolution is configured as manual
    Manual,
}

/// Failures raised while applying a batch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WriterError {
    #[error("{kind:?} conflict on {table} ({event} with {detect:?}) for data id {data_id}")]
    Conflict {
        kind: ConflictKind,
        table: String,
        event: DataEventType,
        detect: DetectConflict,
        data_id: i64,
    },

    #[error("target table not found: {0}")]
    TableNotFound(String),

    #[error("{table} expects {expected} values but row has {actual}")]
    ColumnCountMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("no primary key columns available for {0}")]
    NoKeys(String),

    #[error("script failed: {0}")]
    Script(String),

    #[error("no batch started")]
    NoBatch,

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl WriterError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Failures raised by column transforms.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransformError {
    #[error("unknown transform type '{0}'")]
    UnknownTransform(String),

    #[error("invalid expression for column {column}: {message}")]
    InvalidExpression { column: String, message: String },

    #[error("transform {0} has no primary key columns")]
    NoPrimaryKey(String),

    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Failures talking to a remote node.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("connection rejected by {0}")]
    ConnectionRejected(String),

    #[error("authentication failed against {0}")]
    AuthenticationFailed(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("unexpected HTTP status {status} from {url}")]
    Http { status: u16, url: String },

    #[error("transport already closed")]
    Closed,
}

impl TransportError {
    /// Whether the next push cycle may succeed without operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionRefused(_) | Self::ConnectionRejected(_) | Self::Socket(_) => true,
            Self::Http { status, .. } => *status >= 500,
            Self::AuthenticationFailed(_) | Self::Closed => false,
        }
    }
}

/// Failures parsing the line protocol or an acknowledgement.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("line {line}: '{token}' before a batch was started")]
    OutsideBatch { line: usize, token: String },

    #[error("line {line}: row for unknown table")]
    NoTable { line: usize },

    #[error("invalid acknowledgement token '{0}'")]
    InvalidAck(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateError {
    #[error("batch {batch_id} cannot move from {from} to {to}")]
    IllegalTransition {
        batch_id: i64,
        from: BatchStatus,
        to: BatchStatus,
    },
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_transport_transient() {
        assert!(TransportError::ConnectionRefused("a".into()).is_transient());
        assert!(TransportError::Http { status: 503, url: "u".into() }.is_transient());
        assert!(!TransportError::AuthenticationFailed("a".into()).is_transient());
        assert!(!TransportError::Http { status: 404, url: "u".into() }.is_transient());
    }

    #[test]
    fn test_writer_error_from_db() {
        let err: WriterError = DbError::Sql("boom".into()).into();
        assert!(matches!(err, WriterError::Db(_)));
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_error_display() {
        let err = StateError::IllegalTransition {
            batch_id: 7,
            from: BatchStatus::Ok,
            to: BatchStatus::Sending,
        };
        assert_eq!(err.to_string(), "batch 7 cannot move from OK to SE");
    }
}
