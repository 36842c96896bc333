use crate::oplog::OplogError;
use crate::persistence::PersistenceError;
use crate::replication::ReplicationError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Main error type for client-visible operations
#[derive(Debug, Error)]
pub enum TideError {
    #[error("READONLY You can't write against a read only slave.")]
    ReadOnly,

    #[error("RESYNC_REQUIRED oplog seq {requested} is below the retained range (oldest {oldest})")]
    ResyncRequired { requested: u64, oldest: u64 },

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Memory limit exceeded")]
    MemoryLimitExceeded,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Durability error: {0}")]
    Durability(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl TideError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ReadOnly => StatusCode::FORBIDDEN,
            Self::ResyncRequired { .. } => StatusCode::GONE,
            Self::InvalidValue(_) | Self::InvalidRequest(_) | Self::UnknownCommand(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::MemoryLimitExceeded => StatusCode::INSUFFICIENT_STORAGE,
            Self::Durability(_) | Self::SerializationError(_) | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<OplogError> for TideError {
    fn from(e: OplogError) -> Self {
        match e {
            OplogError::Unavailable { requested, oldest } => {
                TideError::ResyncRequired { requested, oldest }
            }
            OplogError::Io(_) | OplogError::Corrupted { .. } => TideError::Durability(e.to_string()),
            other => TideError::InternalError(other.to_string()),
        }
    }
}

impl From<PersistenceError> for TideError {
    fn from(e: PersistenceError) -> Self {
        TideError::Durability(e.to_string())
    }
}

impl From<ReplicationError> for TideError {
    fn from(e: ReplicationError) -> Self {
        match e {
            ReplicationError::InvalidAddress(msg) => TideError::InvalidRequest(msg),
            other => TideError::InternalError(other.to_string()),
        }
    }
}

/// Implement IntoResponse for Axum integration
impl IntoResponse for TideError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

/// Result type alias for client-visible operations
pub type Result<T> = std::result::Result<T, TideError>;
