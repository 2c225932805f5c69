use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;

/// A persistent mapping from call fingerprints to results.
///
/// Stores must tolerate concurrent writers of disjoint keys. Writes to the same
/// key are idempotent: the last write wins.
pub trait Store: Send + Sync {
    /// Look up the bytes stored for a fingerprint.
    fn get(&self, key: Fingerprint) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store bytes for a fingerprint.
    fn set(&self, key: Fingerprint, value: &[u8]) -> Result<(), StoreError>;

    /// Where other processes can find this store, if they can.
    fn locator(&self) -> Option<Locator> {
        None
    }
}

/// Describes how to reach a store from another process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Locator {
    /// A [`FsStore`] rooted at a directory.
    Directory(PathBuf),
}

impl Locator {
    /// Reconnect to the store.
    pub fn open(&self) -> Result<Arc<dyn Store>, StoreError> {
        match self {
            Self::Directory(path) => Ok(Arc::new(FsStore::open(path)?)),
        }
    }
}

/// An in-memory store, shared by everything in the current process.
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<FxHashMap<Fingerprint, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of stored entries.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: Fingerprint) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.read().get(&key).cloned())
    }

    fn set(&self, key: Fingerprint, value: &[u8]) -> Result<(), StoreError> {
        self.map.write().insert(key, value.to_vec());
        Ok(())
    }
}

/// A store keeping one file per fingerprint in a directory.
///
/// Each entry is written to a temporary file in the same directory and then
/// renamed into place, so readers never observe a partial entry.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open a store rooted at `path`, creating the directory if necessary.
    ///
    /// The root is made absolute, so that processes started in another
    /// working directory find the same entries through the [`Locator`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path.exists() {
            if !path.is_dir() {
                return Err(StoreError::NotADirectory(path.into()));
            }
        } else {
            fs::create_dir_all(path)
                .map_err(|source| StoreError::Io { path: path.into(), source })?;
        }

        let root = fs::canonicalize(path)
            .map_err(|source| StoreError::Io { path: path.into(), source })?;
        Ok(Self { root })
    }

    /// The directory holding the entries.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry(&self, key: Fingerprint) -> PathBuf {
        self.root.join(key.to_string())
    }
}

impl Store for FsStore {
    fn get(&self, key: Fingerprint) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.entry(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn set(&self, key: Fingerprint, value: &[u8]) -> Result<(), StoreError> {
        let path = self.entry(key);
        let io = |source| StoreError::Io { path: path.clone(), source };
        let mut file = tempfile::NamedTempFile::new_in(&self.root).map_err(io)?;
        file.write_all(value).map_err(io)?;
        file.as_file().sync_all().map_err(io)?;
        file.persist(&path).map_err(|err| io(err.error))?;
        Ok(())
    }

    fn locator(&self) -> Option<Locator> {
        Some(Locator::Directory(self.root.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn Store) {
        let a = Fingerprint::of("f", &[1]);
        let b = Fingerprint::of("f", &[2]);
        assert_eq!(store.get(a).unwrap(), None);
        store.set(a, b"one").unwrap();
        store.set(b, b"two").unwrap();
        assert_eq!(store.get(a).unwrap().as_deref(), Some(&b"one"[..]));
        store.set(a, b"uno").unwrap();
        assert_eq!(store.get(a).unwrap().as_deref(), Some(&b"uno"[..]));
        assert_eq!(store.get(b).unwrap().as_deref(), Some(&b"two"[..]));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        exercise(&store);
        assert_eq!(store.len(), 2);
        assert!(store.locator().is_none());
    }

    #[test]
    fn test_fs_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path().join("cache")).unwrap();
        exercise(&store);

        let reopened = store.locator().unwrap().open().unwrap();
        assert_eq!(
            reopened.get(Fingerprint::of("f", &[2])).unwrap().as_deref(),
            Some(&b"two"[..])
        );
    }

    #[test]
    fn test_fs_store_root_is_absolute() {
        let dir = tempfile::Builder::new().prefix("parmemo-store").tempdir_in(".").unwrap();
        assert!(dir.path().is_relative());

        let store = FsStore::open(dir.path().join("cache")).unwrap();
        assert!(store.root().is_absolute());
        assert_eq!(store.locator(), Some(Locator::Directory(store.root().into())));
    }

    #[test]
    fn test_fs_store_rejects_files() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(FsStore::open(file.path()), Err(StoreError::NotADirectory(_))));
    }
}
