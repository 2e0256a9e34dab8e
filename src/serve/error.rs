use axum::http::StatusCode;

use crate::error::{ErrorKind, SourceError};

/// HTTP status for a structured source error (API and webhook surfaces).
pub fn status_for(err: &SourceError) -> StatusCode {
    match err.kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Permission => StatusCode::FORBIDDEN,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Connection | ErrorKind::CircuitOpen => StatusCode::BAD_GATEWAY,
        ErrorKind::Resource | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
