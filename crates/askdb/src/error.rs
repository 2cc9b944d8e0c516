//! Error taxonomy for the run pipeline and its collaborators.
//!
//! `ErrorKind` is what gets persisted on a failed run and echoed to API
//! clients; `CoreError` carries the message alongside the kind.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for core operations
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Failure categories persisted on run records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    ConnectError,
    SchemaError,
    QueryError,
    ModelError,
    TimeoutError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ConnectError => "connect_error",
            ErrorKind::SchemaError => "schema_error",
            ErrorKind::QueryError => "query_error",
            ErrorKind::ModelError => "model_error",
            ErrorKind::TimeoutError => "timeout_error",
            ErrorKind::InternalError => "internal_error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "invalid_input" => ErrorKind::InvalidInput,
            "connect_error" => ErrorKind::ConnectError,
            "schema_error" => ErrorKind::SchemaError,
            "query_error" => ErrorKind::QueryError,
            "model_error" => ErrorKind::ModelError,
            "timeout_error" => ErrorKind::TimeoutError,
            _ => ErrorKind::InternalError,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("schema inspection failed: {0}")]
    Schema(String),

    #[error("query execution failed: {0}")]
    Query(String),

    #[error("model call failed: {0}")]
    Model(String),

    #[error("run budget of {0:?} elapsed")]
    Timeout(Duration),

    #[error("not found: {category}/{id}")]
    NotFound { category: &'static str, id: String },

    #[error("job queue saturated")]
    BrokerSaturated,

    #[error("database error: {0}")]
    Db(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidInput(_) => ErrorKind::InvalidInput,
            CoreError::Connect(_) => ErrorKind::ConnectError,
            CoreError::Schema(_) => ErrorKind::SchemaError,
            CoreError::Query(_) => ErrorKind::QueryError,
            CoreError::Model(_) => ErrorKind::ModelError,
            CoreError::Timeout(_) => ErrorKind::TimeoutError,
            CoreError::NotFound { .. } => ErrorKind::InvalidInput,
            CoreError::BrokerSaturated | CoreError::Db(_) | CoreError::Internal(_) => {
                ErrorKind::InternalError
            }
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Db(e.to_string())
    }
}

impl From<r2d2::Error> for CoreError {
    fn from(e: r2d2::Error) -> Self {
        CoreError::Db(format!("connection pool: {}", e))
    }
}

/// Masks the password of a `user:password@host` DSN so error text and
/// probe responses never echo secrets.
pub fn mask_dsn(dsn: &str) -> String {
    if let Some((scheme, rest)) = dsn.split_once("://") {
        if let Some((creds, hostdb)) = rest.split_once('@') {
            if let Some((user, _)) = creds.split_once(':') {
                return format!("{}://{}:***@{}", scheme, user, hostdb);
            }
        }
    }
    dsn.to_string()
}
