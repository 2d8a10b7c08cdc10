//! Durable key-value storage for guest state and its built-in backends.
//!
//! The guest cart and guest wishlist each live under one string key, like
//! browser local storage. [`FileStorage`] keeps one JSON file per key under
//! a base directory:
//!
//! ```text
//! <base_dir>/
//!     guest_cart.json
//!     guest_wishlist.json
//! ```
//!
//! Writes are atomic via a temp-rename so a crash mid-write never leaves a
//! half-written payload behind.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StorageError;

/// Synchronous string key-value storage.
///
/// Implementations must make a completed [`set`](KeyValueStorage::set)
/// visible to every later [`get`](KeyValueStorage::get), including after a
/// process restart for durable backends.
pub trait KeyValueStorage: Send + Sync {
    /// Read the raw value for `key`, or `None` if it was never written.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Replace the value for `key`.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// File-backed storage: one `<key>.json` file per key.
///
/// Cheap to clone (wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_dir: PathBuf,
}

impl FileStorage {
    /// Create a storage rooted at `base_dir`.
    ///
    /// The directory does not need to exist yet; it is created on the
    /// first write.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this storage.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the file path backing `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] if the key is empty or contains
    /// anything besides ASCII alphanumerics, `_` and `-`.
    pub fn key_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.base_dir.join(format!("{key}.json")))
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.key_path(key)?;
        match std::fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            // Non-UTF-8 bytes are corruption, not an I/O failure; hand the
            // caller something that will fail to parse.
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Ok(Some(String::new())),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.key_path(key)?;
        std::fs::create_dir_all(&self.base_dir)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, value)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.key_path(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory storage for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    read_only: Mutex<bool>,
}

impl MemoryStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set`/`remove` fail, simulating a full or
    /// locked storage quota.
    pub fn set_read_only(&self, read_only: bool) {
        *self.read_only.lock().expect("read_only mutex poisoned") = read_only;
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if *self.read_only.lock().expect("read_only mutex poisoned") {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "storage is read-only",
            )));
        }
        Ok(())
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().expect("storage mutex poisoned");
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut entries = self.entries.lock().expect("storage mutex poisoned");
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut entries = self.entries.lock().expect("storage mutex poisoned");
        entries.remove(key);
        Ok(())
    }
}
