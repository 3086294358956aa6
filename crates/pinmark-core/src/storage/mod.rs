//! Remembered-session storage.
//!
//! The engine remembers the last joined image so a bare page load can
//! resume it when the link carries no id.

mod file;
mod memory;

pub use file::FileSessionStore;
pub use memory::MemorySessionStore;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Storage error: {0}")]
    Other(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// What is kept about the last session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RememberedSession {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_link: Option<String>,
}

/// Backend for the remembered session.
pub trait SessionMemory: Send + Sync {
    /// Replace the remembered session.
    fn remember(&self, session: &RememberedSession) -> StorageResult<()>;

    /// The remembered session, if any.
    fn recall(&self) -> StorageResult<Option<RememberedSession>>;

    fn forget(&self) -> StorageResult<()>;
}
