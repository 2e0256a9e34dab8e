//! The structured error taxonomy for everything that crosses the Source boundary.
//!
//! Application-level plumbing uses [`color_eyre`] (see the crate prelude); anything
//! that a template or wire frame may need to reason about is a [`SourceError`].

use serde::Serialize;
use thiserror::Error;

/// Classifies a [`SourceError`] for templates, wire frames and retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Operation exceeded its deadline.
    Timeout,
    /// Network, socket or driver connection failure (includes `SQLITE_BUSY` and HTTP 5xx).
    Connection,
    /// Input failed schema validation (config, params).
    Validation,
    /// Source or action name unknown.
    NotFound,
    /// Writable op on a readonly source, or exec without `--allow-exec`.
    Permission,
    /// Markdown mtime drift detected at write time.
    Conflict,
    /// Circuit breaker is open.
    CircuitOpen,
    /// WASM memory or CPU limit breached.
    Resource,
    /// Bug or panic.
    Internal,
}

impl ErrorKind {
    pub fn retryable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Connection)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SourceError {
    pub kind: ErrorKind,
    /// Name of the source involved, when known.
    pub source_name: Option<String>,
    /// Operation in flight (`fetch`, `add`, `update`, ...), when known.
    pub op: Option<String>,
    pub message: String,
}

pub type SourceResult<T> = Result<T, SourceError>;

impl SourceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            source_name: None,
            op: None,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_source(mut self, name: impl Into<String>) -> Self {
        self.source_name = Some(name.into());
        self
    }

    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::permission(err.to_string()),
            std::io::ErrorKind::TimedOut => Self::timeout(err.to_string()),
            _ => Self::connection(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        Self::validation(format!("malformed JSON: {err}"))
    }
}

impl From<rusqlite::Error> for SourceError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;

        if let rusqlite::Error::SqliteFailure(inner, _) = &err {
            if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) {
                return Self::connection(err.to_string());
            }
        }

        Self::new(ErrorKind::Internal, err.to_string())
    }
}

impl From<r2d2::Error> for SourceError {
    fn from(err: r2d2::Error) -> Self {
        Self::connection(err.to_string())
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_server_error() {
                Self::connection(err.to_string())
            } else {
                Self::validation(err.to_string())
            }
        } else {
            Self::connection(err.to_string())
        }
    }
}
