//! In-memory session store.

use super::{RememberedSession, SessionMemory, StorageError, StorageResult};
use std::sync::RwLock;

/// In-memory store for tests and ephemeral use.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: RwLock<Option<RememberedSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionMemory for MemorySessionStore {
    fn remember(&self, session: &RememberedSession) -> StorageResult<()> {
        let mut slot = self
            .session
            .write()
            .map_err(|e| StorageError::Other(format!("Lock error: {}", e)))?;
        *slot = Some(session.clone());
        Ok(())
    }

    fn recall(&self) -> StorageResult<Option<RememberedSession>> {
        let slot = self
            .session
            .read()
            .map_err(|e| StorageError::Other(format!("Lock error: {}", e)))?;
        Ok(slot.clone())
    }

    fn forget(&self) -> StorageResult<()> {
        let mut slot = self
            .session
            .write()
            .map_err(|e| StorageError::Other(format!("Lock error: {}", e)))?;
        *slot = None;
        Ok(())
    }
}
