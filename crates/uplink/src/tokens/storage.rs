//! Key-value storage scopes backing the token store.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
};

use parking_lot::{Mutex, RwLock};

use crate::error::{TransportError, TransportResult};

/// A string key-value scope.
pub trait TokenStorage: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> TransportResult<()> {
        self.set_all(&[(key, value)])
    }

    /// Write every entry or none of them. Readers never see part of a batch.
    fn set_all(&self, entries: &[(&str, &str)]) -> TransportResult<()>;

    fn remove(&self, key: &str) -> TransportResult<()>;
}

/// Process-lifetime storage. Used for the session scope.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set_all(&self, entries: &[(&str, &str)]) -> TransportResult<()> {
        let mut stored = self.entries.write();
        for (key, value) in entries {
            stored.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> TransportResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Storage persisted as a JSON object in a single file. Used for the durable
/// scope.
///
/// The file is loaded once on open and replaced on every mutation by writing
/// a sibling temp file and renaming it over the original. The in-memory view
/// only changes once the rename succeeded.
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStorage")
            .field("path", &self.path)
            .finish()
    }
}

impl FileStorage {
    /// Open (or lazily create) the storage file at `path`.
    pub fn open(path: impl AsRef<Path>) -> TransportResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => HashMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(TransportError::storage(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn persist(&self, entries: &HashMap<String, String>) -> TransportResult<()> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        let temp = self.temp_path();
        std::fs::write(&temp, bytes).map_err(|e| {
            TransportError::storage(format!("failed to write {}: {e}", temp.display()))
        })?;
        std::fs::rename(&temp, &self.path).map_err(|e| {
            TransportError::storage(format!(
                "failed to rename {} to {}: {e}",
                temp.display(),
                self.path.display()
            ))
        })
    }
}

impl TokenStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set_all(&self, entries: &[(&str, &str)]) -> TransportResult<()> {
        let mut stored = self.entries.lock();
        let mut next = stored.clone();
        for (key, value) in entries {
            next.insert(key.to_string(), value.to_string());
        }
        self.persist(&next)?;
        *stored = next;
        Ok(())
    }

    fn remove(&self, key: &str) -> TransportResult<()> {
        let mut stored = self.entries.lock();
        if !stored.contains_key(key) {
            return Ok(());
        }
        let mut next = stored.clone();
        next.remove(key);
        self.persist(&next)?;
        *stored = next;
        Ok(())
    }
}
