//! In-memory storage backend.
//!
//! [`InMemoryBackend`] is a thread-safe [`StoreBackend`] built on
//! `DashMap<String, Entry>`. It is a dumb versioned KV store with no domain
//! logic; creation order is tracked with a monotonic sequence number so
//! [`list`](StoreBackend::list) can return records oldest first.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use flowtrace::store::memory::InMemoryBackend;
//! use flowtrace::store::DocumentStore;
//!
//! let store = DocumentStore::new(Arc::new(InMemoryBackend::new()), "task_id");
//! assert_eq!(store.correlation_key(), "task_id");
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

use crate::store::backend::{StorageError, StoreBackend, VersionedRecord};

#[derive(Debug)]
struct Entry {
    data: Vec<u8>,
    version: u64,
    seq: u64,
}

/// Thread-safe in-memory storage backend using [`DashMap`].
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: DashMap<String, Entry>,
    next_seq: AtomicU64,
}

impl InMemoryBackend {
    /// Creates an empty in-memory backend.
    ///
    /// # Examples
    ///
    /// ```
    /// use flowtrace::store::memory::InMemoryBackend;
    ///
    /// let backend = InMemoryBackend::new();
    /// assert!(backend.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the backend contains no records.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl StoreBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let entry = self.data.get(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;
        Ok(VersionedRecord {
            data: entry.data.clone(),
            version: entry.version,
        })
    }

    async fn create(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        match self.data.entry(key.to_string()) {
            MapEntry::Occupied(_) => Err(StorageError::AlreadyExists {
                key: key.to_string(),
            }),
            MapEntry::Vacant(slot) => {
                slot.insert(Entry {
                    data: data.to_vec(),
                    version: 1,
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                });
                Ok(1)
            },
        }
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let mut entry = self
            .data
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        if entry.version != expected_version {
            return Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: entry.version,
            });
        }
        entry.version += 1;
        entry.data = data.to_vec();
        Ok(entry.version)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.remove(key).is_some())
    }

    async fn list(&self) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        let mut rows: Vec<(u64, String, VersionedRecord)> = self
            .data
            .iter()
            .map(|entry| {
                (
                    entry.seq,
                    entry.key().clone(),
                    VersionedRecord {
                        data: entry.data.clone(),
                        version: entry.version,
                    },
                )
            })
            .collect();
        rows.sort_by_key(|(seq, _, _)| *seq);
        Ok(rows
            .into_iter()
            .map(|(_, key, record)| (key, record))
            .collect())
    }

    async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.data.len())
    }
}

#[cfg(test)]
mod backend_tests {
    use super::*;

    // ---- get tests ----

    #[tokio::test]
    async fn get_missing_key_returns_not_found() {
        let backend = InMemoryBackend::new();
        let result = backend.get("nonexistent").await;
        assert!(
            matches!(&result, Err(StorageError::NotFound { key }) if key == "nonexistent"),
            "expected NotFound, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn get_returns_created_data() {
        let backend = InMemoryBackend::new();
        let version = backend.create("key-1", b"hello").await.unwrap();
        let record = backend.get("key-1").await.unwrap();
        assert_eq!(record.data, b"hello");
        assert_eq!(record.version, version);
    }

    // ---- create tests ----

    #[tokio::test]
    async fn create_new_key_returns_version_1() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.create("key-1", b"data").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn create_existing_key_fails() {
        let backend = InMemoryBackend::new();
        backend.create("key-1", b"first").await.unwrap();
        let result = backend.create("key-1", b"second").await;
        assert!(matches!(result, Err(StorageError::AlreadyExists { .. })));
        assert_eq!(backend.get("key-1").await.unwrap().data, b"first");
    }

    // ---- put_if_version tests ----

    #[tokio::test]
    async fn put_if_version_succeeds_on_match() {
        let backend = InMemoryBackend::new();
        let v1 = backend.create("key-1", b"v1").await.unwrap();
        let v2 = backend.put_if_version("key-1", b"v2", v1).await.unwrap();
        assert_eq!(v2, 2);
        assert_eq!(backend.get("key-1").await.unwrap().data, b"v2");
    }

    #[tokio::test]
    async fn put_if_version_fails_on_mismatch() {
        let backend = InMemoryBackend::new();
        backend.create("key-1", b"v1").await.unwrap();
        backend.put_if_version("key-1", b"v2", 1).await.unwrap();
        let result = backend.put_if_version("key-1", b"stale", 1).await;
        assert!(matches!(
            result,
            Err(StorageError::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn put_if_version_fails_on_missing_key() {
        let backend = InMemoryBackend::new();
        let result = backend.put_if_version("missing", b"data", 1).await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    // ---- delete tests ----

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = InMemoryBackend::new();
        backend.create("key-1", b"data").await.unwrap();
        assert!(backend.delete("key-1").await.unwrap());
        assert!(!backend.delete("key-1").await.unwrap());
        assert!(backend.is_empty());
    }

    // ---- list tests ----

    #[tokio::test]
    async fn list_returns_creation_order() {
        let backend = InMemoryBackend::new();
        for key in ["c", "a", "b"] {
            backend.create(key, key.as_bytes()).await.unwrap();
        }
        // An update must not move a record.
        backend.put_if_version("c", b"c2", 1).await.unwrap();

        let keys: Vec<String> = backend
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
        assert_eq!(backend.len().await.unwrap(), 3);
    }
}
