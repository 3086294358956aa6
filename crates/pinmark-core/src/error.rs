//! Session-level errors.

use crate::api::ApiError;
use crate::channel::ChannelError;
use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::raster::RasterError;
use crate::storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the session controller.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Rejected input; nothing changed.
    #[error("Invalid input: {0}")]
    Validation(String),
    /// The request clashes with the current session.
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Network error: {0}")]
    Network(ApiError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Live channel lost: {0}")]
    ChannelLoss(#[from] ChannelError),
    #[error("No active session")]
    NoSession,
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Raster error: {0}")]
    Raster(#[from] RasterError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SessionError {
    /// Whether the host should block further input until acknowledged.
    pub fn is_blocking(&self) -> bool {
        matches!(self, SessionError::Validation(_))
    }
}

impl From<ApiError> for SessionError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Decode(message) => SessionError::Protocol(ProtocolError::Malformed(message)),
            other => SessionError::Network(other),
        }
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
