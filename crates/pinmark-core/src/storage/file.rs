//! File-based session store.

use super::{RememberedSession, SessionMemory, StorageError, StorageResult};
use std::fs;
use std::path::{Path, PathBuf};

const FILE_NAME: &str = "last_session.json";

/// Keeps the remembered session as a JSON file in a directory.
#[derive(Debug)]
pub struct FileSessionStore {
    base_path: PathBuf,
}

impl FileSessionStore {
    /// Create a store in `base_path`, creating the directory if needed.
    pub fn new(base_path: PathBuf) -> StorageResult<Self> {
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                StorageError::Io(format!("Failed to create storage directory: {}", e))
            })?;
        }
        Ok(Self { base_path })
    }

    /// Create the store in the default location.
    ///
    /// On Unix: `~/.local/share/pinmark/`
    pub fn default_location() -> StorageResult<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| StorageError::Io("Could not determine home directory".to_string()))?;
        Self::new(base.join("pinmark"))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn file_path(&self) -> PathBuf {
        self.base_path.join(FILE_NAME)
    }
}

impl SessionMemory for FileSessionStore {
    fn remember(&self, session: &RememberedSession) -> StorageResult<()> {
        let path = self.file_path();
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        fs::write(&path, json)
            .map_err(|e| StorageError::Io(format!("Failed to write {}: {}", path.display(), e)))
    }

    fn recall(&self) -> StorageResult<Option<RememberedSession>> {
        let path = self.file_path();
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .map_err(|e| StorageError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&json).map(Some).map_err(|e| {
            StorageError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    fn forget(&self) -> StorageResult<()> {
        let path = self.file_path();
        if path.exists() {
            fs::remove_file(&path).map_err(|e| {
                StorageError::Io(format!("Failed to delete {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }
}
