//! Persistence for key metadata: [`KeyStore`] plus in-memory and JSON-file
//! implementations.
//!
//! A store only ever sees the complete record set. Every registry commit is a
//! single [`KeyStore::save`], so a transition is either fully persisted or not
//! at all.

use std::fmt::Debug;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use common::{CryptoError, KeyRecord};

/// Durable home of the key registry.
pub trait KeyStore: Send + Sync + Debug {
    /// Load every key record. An absent store is an empty registry.
    fn load(&self) -> Result<Vec<KeyRecord>, CryptoError>;

    /// Atomically replace the stored record set.
    fn save(&self, records: &[KeyRecord]) -> Result<(), CryptoError>;
}

/// Volatile store for tests and embedding callers that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    records: Mutex<Vec<KeyRecord>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with existing records.
    pub fn with_records(records: Vec<KeyRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self) -> Result<Vec<KeyRecord>, CryptoError> {
        let lock = self
            .records
            .lock()
            .map_err(|_| CryptoError::Storage("key store lock poisoned".into()))?;
        Ok(lock.clone())
    }

    fn save(&self, records: &[KeyRecord]) -> Result<(), CryptoError> {
        let mut lock = self
            .records
            .lock()
            .map_err(|_| CryptoError::Storage("key store lock poisoned".into()))?;
        *lock = records.to_vec();
        Ok(())
    }
}

/// JSON file store. Writes go to a sibling temp file that is then renamed over
/// the target, so readers never observe a half-written registry.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> Result<Vec<KeyRecord>, CryptoError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path).map_err(|e| {
            CryptoError::Storage(format!("failed to read key store {}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            CryptoError::Storage(format!("key store {} is corrupt: {e}", self.path.display()))
        })
    }

    fn save(&self, records: &[KeyRecord]) -> Result<(), CryptoError> {
        let json = serde_json::to_vec_pretty(records)
            .map_err(|e| CryptoError::Storage(format!("failed to serialise key store: {e}")))?;
        write_atomically(&self.path, &json)
    }
}

/// Write `bytes` to `path` via a temp file + rename.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), CryptoError> {
    let tmp = path.with_extension("tmp");
    let io_err = |e: std::io::Error| {
        CryptoError::Storage(format!("failed to write {}: {e}", path.display()))
    };
    let mut file = fs::File::create(&tmp).map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryKeyStore::new();
        assert!(store.load().unwrap().is_empty());
        let rec = KeyRecord::pending("key_a", "00", Utc::now());
        store.save(std::slice::from_ref(&rec)).unwrap();
        assert_eq!(store.load().unwrap(), vec![rec]);
    }

    #[test]
    fn file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("keys.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let rec = KeyRecord::pending("key_b", "11", Utc::now());
        FileKeyStore::new(&path).save(std::slice::from_ref(&rec)).unwrap();
        let loaded = FileKeyStore::new(&path).load().unwrap();
        assert_eq!(loaded, vec![rec]);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn file_store_rejects_corrupt_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            FileKeyStore::new(&path).load(),
            Err(CryptoError::Storage(_))
        ));
    }
}
