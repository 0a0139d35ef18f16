//  Copyright 2024. The CBDC Development Community
//
//  Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
//  following conditions are met:
//
//  1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
//  disclaimer.
//
//  2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
//  following disclaimer in the documentation and/or other materials provided with the distribution.
//
//  3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
//  products derived from this software without specific prior written permission.
//
//  THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
//  INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
//  DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
//  SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
//  SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
//  WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
//  USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Ordered key-value storage behind a trait. The on-disk format is an opaque
//! collaborator of the settlement core; implementations only have to honor
//! the atomicity and durability contract of [`KeyValueStore::apply_batch`].

use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    sync::RwLock,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt store {path}: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("Storage lock poisoned")]
    Poisoned,
}

/// An ordered map of byte keys to byte values.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Insert or overwrite a single key. Durable before returning.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.apply_batch(vec![(key.to_vec(), value.to_vec())], Vec::new())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.apply_batch(Vec::new(), vec![key.to_vec()])
    }

    /// Apply a set of puts and deletes atomically with respect to crash:
    /// after recovery either every mutation is visible or none is.
    fn apply_batch(&self, puts: Vec<(Vec<u8>, Vec<u8>)>, deletes: Vec<Vec<u8>>) -> Result<(), StorageError>;

    /// All entries with keys in the inclusive range `[lo, hi]`, in key order.
    fn range(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    fn len(&self) -> Result<usize, StorageError>;

    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

/// Volatile store used by tests and by components whose durability comes
/// from replication snapshots instead of local disk.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        Ok(inner.get(key).cloned())
    }

    fn apply_batch(&self, puts: Vec<(Vec<u8>, Vec<u8>)>, deletes: Vec<Vec<u8>>) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(|_| StorageError::Poisoned)?;
        for (key, value) in puts {
            inner.insert(key, value);
        }
        for key in deletes {
            inner.remove(&key);
        }
        Ok(())
    }

    fn range(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        Ok(inner
            .range(lo.to_vec()..=hi.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn len(&self) -> Result<usize, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        Ok(inner.len())
    }
}

/// Durable store that rewrites its backing file atomically on every batch:
/// the map is serialized to a temp file, flushed to disk and renamed over
/// the old one.
pub struct FileStore {
    path: PathBuf,
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl FileStore {
    /// Open a store, loading existing contents if the file is present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let inner = if path.exists() {
            let bytes = std::fs::read(&path).map_err(|source| StorageError::Io {
                path: path.display().to_string(),
                source,
            })?;
            bincode::deserialize(&bytes).map_err(|e| StorageError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            inner: RwLock::new(inner),
        })
    }

    fn persist(&self, inner: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(), StorageError> {
        let io_err = |source| StorageError::Io {
            path: self.path.display().to_string(),
            source,
        };
        let bytes = bincode::serialize(inner).map_err(|e| StorageError::Corrupt {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = std::fs::File::create(&tmp_path).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.sync_all().map_err(io_err)?;
        std::fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        Ok(inner.get(key).cloned())
    }

    fn apply_batch(&self, puts: Vec<(Vec<u8>, Vec<u8>)>, deletes: Vec<Vec<u8>>) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(|_| StorageError::Poisoned)?;
        for (key, value) in puts {
            inner.insert(key, value);
        }
        for key in deletes {
            inner.remove(&key);
        }
        self.persist(&inner)
    }

    fn range(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        Ok(inner
            .range(lo.to_vec()..=hi.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn len(&self) -> Result<usize, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        Ok(inner.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn exercise_store(store: &dyn KeyValueStore) {
        assert!(store.is_empty().unwrap());
        store.put(b"b", b"2").unwrap();
        store.put(b"a", b"1").unwrap();
        store.put(b"c", b"3").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"missing").unwrap(), None);

        let range = store.range(b"a", b"b").unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].0, b"a".to_vec());
        assert_eq!(range[1].0, b"b".to_vec());

        store.delete(b"b").unwrap();
        assert_eq!(store.get(b"b").unwrap(), None);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn memory_store_contract() {
        exercise_store(&MemoryStore::new());
    }

    #[test]
    fn file_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise_store(&FileStore::open(dir.path().join("kv.dat")).unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.dat");
        {
            let store = FileStore::open(&path).unwrap();
            store.apply_batch(
                vec![(b"k".to_vec(), b"v".to_vec()), (b"dead".to_vec(), b"x".to_vec())],
                Vec::new(),
            )
            .unwrap();
            store.delete(b"dead").unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.get(b"dead").unwrap(), None);
    }

    #[test]
    fn batch_is_applied_in_one_step() {
        let store = MemoryStore::new();
        store.put(b"old", b"1").unwrap();
        store
            .apply_batch(vec![(b"new".to_vec(), b"2".to_vec())], vec![b"old".to_vec()])
            .unwrap();
        assert_eq!(store.get(b"new").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get(b"old").unwrap(), None);
    }
}
