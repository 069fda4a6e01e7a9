//! Document store: persistence of merged task records.
//!
//! # Architecture
//!
//! Storage has two layers:
//!
//! 1. **[`DocumentStore`]** -- All domain logic: the correlation-key unique
//!    index, field-level upsert (create-if-absent, one-level merge into an
//!    existing record), `_id` assignment, `timestamp` stamping, deletes and
//!    query execution. Every operation logs backend failures before
//!    returning them.
//!
//! 2. **[`StoreBackend`]** -- Dumb versioned KV trait that backends
//!    implement. No domain logic.
//!
//! # Backends
//!
//! - [`InMemoryBackend`](crate::store::memory::InMemoryBackend) -- `DashMap`
//!   backed, used for embedded deployments and tests.
//! - [`RedisBackend`](crate::store::redis::RedisBackend) -- Redis backend for
//!   long-running deployments. Available behind the `redis` feature flag.
//!
//! # Concurrency
//!
//! Upserts are read-merge-CAS loops over
//! [`put_if_version`](StoreBackend::put_if_version), retried up to
//! [`MAX_CAS_ATTEMPTS`] times, so concurrent writers to the same record
//! never drop each other's fields. A bulk upsert is not atomic across
//! records: each operation succeeds or fails on its own and failures are
//! reported in [`BulkWriteSummary`].

pub mod backend;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

pub use backend::{StorageError, StoreBackend, VersionedRecord};

use crate::config::{DbBackend, DbConfig};
use crate::curator::{correlation_value, merge_fields, Curated};
use crate::message::Document;
use crate::query::{eval, planner, AggregationSpec, Plan, QueryError};

/// Internal record identifier field assigned by the store.
pub const ID_FIELD: &str = "_id";

/// Last-modified stamp (RFC 3339, UTC) written on every upsert.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Number of read-merge-CAS attempts per upsert before giving up.
pub const MAX_CAS_ATTEMPTS: u32 = 3;

/// Errors raised by [`DocumentStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A raw insert collided with the correlation-key unique index.
    #[error("duplicate value {value:?} for unique field {field}")]
    DuplicateKey {
        /// The indexed field.
        field: String,
        /// The colliding value.
        value: String,
    },

    /// A stored record could not be deserialized.
    #[error("corrupt record at {key}: {source}")]
    Corrupt {
        /// Storage key of the record.
        key: String,
        /// The JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Concurrent writers kept winning the CAS race for one record.
    #[error("gave up upserting {key} after {attempts} conflicting attempts")]
    Contention {
        /// Correlation-key value of the record.
        key: String,
        /// Attempts made.
        attempts: u32,
    },
}

/// One field-level upsert: match by correlation-key value, create if absent.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOp {
    /// Correlation-key value of the target record.
    pub key: String,
    /// Fields to set (object fields merge one level deep).
    pub fields: Document,
}

impl UpsertOp {
    /// Creates an upsert operation.
    pub fn new(key: impl Into<String>, fields: Document) -> Self {
        Self {
            key: key.into(),
            fields,
        }
    }

    /// Converts curated updates into upsert operations, preserving order.
    pub fn from_curated(curated: Curated) -> Vec<Self> {
        curated
            .updates
            .into_iter()
            .map(|(key, fields)| Self { key, fields })
            .collect()
    }
}

/// Outcome of a bulk upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteSummary {
    /// Existing records updated.
    pub matched: usize,
    /// Records created.
    pub upserted: usize,
    /// Operations that failed (logged individually).
    pub failed: usize,
}

impl BulkWriteSummary {
    /// Returns `true` if no operation failed.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

enum UpsertOutcome {
    Matched,
    Upserted,
}

/// Domain-level document store over a [`StoreBackend`].
///
/// Cheap to clone: clones share the backend.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use flowtrace::store::memory::InMemoryBackend;
/// use flowtrace::store::{DocumentStore, UpsertOp};
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() {
/// let store = DocumentStore::new(Arc::new(InMemoryBackend::new()), "task_id");
/// let fields = json!({"task_id": "t1", "used": {"x": 1}});
/// let fields = fields.as_object().cloned().unwrap();
/// let summary = store.upsert_many(vec![UpsertOp::new("t1", fields)]).await;
/// assert_eq!(summary.upserted, 1);
/// assert_eq!(store.count().await.unwrap(), 1);
/// # }
/// ```
#[derive(Clone)]
pub struct DocumentStore {
    backend: Arc<dyn StoreBackend>,
    correlation_key: String,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("backend", &self.backend.name())
            .field("correlation_key", &self.correlation_key)
            .finish()
    }
}

impl DocumentStore {
    /// Creates a store whose unique index is on `correlation_key`.
    pub fn new(backend: Arc<dyn StoreBackend>, correlation_key: impl Into<String>) -> Self {
        Self {
            backend,
            correlation_key: correlation_key.into(),
        }
    }

    /// Builds the configured backend and wraps it in a store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend cannot be reached, or
    /// was not compiled in.
    pub async fn open(config: &DbConfig) -> Result<Self, StoreError> {
        let backend: Arc<dyn StoreBackend> = match config.backend {
            DbBackend::Memory => Arc::new(memory::InMemoryBackend::new()),
            #[cfg(feature = "redis")]
            DbBackend::Redis => Arc::new(
                redis::RedisBackend::new(&config.url())
                    .await?
                    .with_prefix(config.key_prefix.clone()),
            ),
            #[allow(unreachable_patterns)]
            other => {
                return Err(StorageError::Backend {
                    message: format!("unsupported store backend {other} (rebuild with the `{other}` feature)"),
                    source: None,
                }
                .into())
            },
        };
        Ok(Self::new(backend, config.correlation_key.clone()))
    }

    /// Returns the indexed correlation-key field name.
    pub fn correlation_key(&self) -> &str {
        &self.correlation_key
    }

    /// Returns the backend name for diagnostics.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    // ---- write path ----

    /// Applies a bulk of field-level upserts.
    ///
    /// Each operation is independent: a failure is logged and counted in
    /// [`BulkWriteSummary::failed`] while the remaining operations proceed.
    /// Partial application is never rolled back.
    pub async fn upsert_many(&self, ops: Vec<UpsertOp>) -> BulkWriteSummary {
        let started = Instant::now();
        let mut summary = BulkWriteSummary::default();
        for op in ops {
            let key = op.key.clone();
            match self.upsert(op).await {
                Ok(UpsertOutcome::Matched) => summary.matched += 1,
                Ok(UpsertOutcome::Upserted) => summary.upserted += 1,
                Err(e) => {
                    error!(error = %e, key = %key, "upsert failed");
                    summary.failed += 1;
                },
            }
        }
        debug!(
            matched = summary.matched,
            upserted = summary.upserted,
            failed = summary.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "bulk upsert finished"
        );
        summary
    }

    async fn upsert(&self, op: UpsertOp) -> Result<UpsertOutcome, StoreError> {
        let storage_key = backend::keyed(&op.key);
        let mut fields = op.fields;
        if !fields.contains_key(&self.correlation_key) {
            fields.insert(self.correlation_key.clone(), Value::String(op.key.clone()));
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            match self.backend.get(&storage_key).await {
                Ok(current) => {
                    let mut record = decode(&storage_key, &current.data)?;
                    merge_fields(&mut record, fields.clone());
                    stamp(&mut record);
                    match self
                        .backend
                        .put_if_version(&storage_key, &encode(&record), current.version)
                        .await
                    {
                        Ok(_) => return Ok(UpsertOutcome::Matched),
                        Err(StorageError::VersionConflict { .. } | StorageError::NotFound { .. }) => {
                            continue
                        },
                        Err(e) => return Err(e.into()),
                    }
                },
                Err(StorageError::NotFound { .. }) => {
                    let mut record = Document::new();
                    record.insert(ID_FIELD.to_string(), Value::String(new_id()));
                    merge_fields(&mut record, fields.clone());
                    stamp(&mut record);
                    match self.backend.create(&storage_key, &encode(&record)).await {
                        Ok(_) => return Ok(UpsertOutcome::Upserted),
                        Err(StorageError::AlreadyExists { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Contention {
            key: op.key,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Inserts one raw document, returning its `_id`.
    ///
    /// An `_id` (UUID v4) is assigned unless the document carries one. The
    /// correlation-key unique index still applies.
    ///
    /// # Errors
    ///
    /// - [`StoreError::DuplicateKey`] if a record with the same
    ///   correlation-key value exists.
    /// - [`StoreError::Storage`] on backend failures.
    pub async fn insert_one(&self, document: Document) -> Result<String, StoreError> {
        self.insert(document).await.inspect_err(|e| {
            error!(error = %e, "insert failed");
        })
    }

    /// Inserts raw documents in order, stopping at the first failure.
    ///
    /// Documents before the failing one stay inserted.
    ///
    /// # Errors
    ///
    /// Same as [`insert_one`](Self::insert_one).
    pub async fn insert_many(&self, documents: Vec<Document>) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::with_capacity(documents.len());
        for document in documents {
            match self.insert(document).await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    error!(error = %e, inserted = ids.len(), "bulk insert stopped");
                    return Err(e);
                },
            }
        }
        Ok(ids)
    }

    async fn insert(&self, mut document: Document) -> Result<String, StoreError> {
        let id = match document.get(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => {
                let id = new_id();
                document.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                id
            },
        };
        let key_value = correlation_value(&document, &self.correlation_key);
        let storage_key = match &key_value {
            Some(value) => backend::keyed(value),
            None => backend::anonymous(&id),
        };
        match self.backend.create(&storage_key, &encode(&document)).await {
            Ok(_) => Ok(id),
            Err(StorageError::AlreadyExists { .. }) => Err(StoreError::DuplicateKey {
                field: key_value
                    .as_ref()
                    .map_or(ID_FIELD, |_| self.correlation_key.as_str())
                    .to_string(),
                value: key_value.unwrap_or(id),
            }),
            Err(e) => Err(e.into()),
        }
    }

    // ---- delete path ----

    /// Deletes records by internal `_id`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failures.
    pub async fn delete_ids(&self, ids: &[String]) -> Result<usize, StoreError> {
        let result = self
            .delete_where(|record| {
                matches!(record.get(ID_FIELD), Some(Value::String(id)) if ids.contains(id))
            })
            .await;
        result.inspect_err(|e| error!(error = %e, "delete by id failed"))
    }

    /// Deletes records whose `field` equals any of `values`.
    ///
    /// Deleting by the correlation key goes straight to the unique index;
    /// any other field (dotted paths allowed) scans.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failures.
    pub async fn delete_keys(&self, field: &str, values: &[Value]) -> Result<usize, StoreError> {
        let result = if field == self.correlation_key {
            self.delete_indexed(values).await
        } else {
            self.delete_where(|record| {
                eval::lookup(record, field).is_some_and(|v| values.contains(v))
            })
            .await
        };
        result.inspect_err(|e| error!(error = %e, field, "delete by key failed"))
    }

    async fn delete_indexed(&self, values: &[Value]) -> Result<usize, StoreError> {
        let mut removed = 0;
        for value in values {
            let key = match value {
                Value::String(s) if !s.is_empty() => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            if self.backend.delete(&backend::keyed(&key)).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_where<F>(&self, predicate: F) -> Result<usize, StoreError>
    where
        F: Fn(&Document) -> bool + Send,
    {
        let mut removed = 0;
        for (key, stored) in self.backend.list().await? {
            let record = decode(&key, &stored.data)?;
            if predicate(&record) && self.backend.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ---- read path ----

    /// Returns the number of stored records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failures.
    pub async fn count(&self) -> Result<usize, StoreError> {
        self.backend
            .len()
            .await
            .map_err(StoreError::from)
            .inspect_err(|e| error!(error = %e, "count failed"))
    }

    /// Returns every stored record in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failures or corrupt records.
    pub async fn documents(&self) -> Result<Vec<Document>, StoreError> {
        let rows = self.backend.list().await?;
        let mut documents = Vec::with_capacity(rows.len());
        for (key, stored) in rows {
            documents.push(decode(&key, &stored.data)?);
        }
        Ok(documents)
    }

    /// Fetches one record by correlation-key value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failures or a corrupt record.
    pub async fn get(&self, key: &str) -> Result<Option<Document>, StoreError> {
        let storage_key = backend::keyed(key);
        match self.backend.get(&storage_key).await {
            Ok(stored) => decode(&storage_key, &stored.data).map(Some),
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Executes a compiled plan.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Store`] if the records cannot be read.
    pub async fn execute(&self, plan: &Plan) -> Result<Vec<Document>, QueryError> {
        let started = Instant::now();
        let documents = self.documents().await.inspect_err(|e| {
            error!(error = %e, "query read failed");
        })?;
        let scanned = documents.len();
        let results = eval::execute(plan, documents);
        debug!(
            scanned,
            returned = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query executed"
        );
        Ok(results)
    }

    /// Compiles and executes a declarative query.
    ///
    /// # Errors
    ///
    /// - [`QueryError::ProjectionTooWide`] or [`QueryError::InvalidFilter`]
    ///   if the request does not compile (nothing is executed).
    /// - [`QueryError::Store`] if the records cannot be read.
    pub async fn query(&self, spec: &AggregationSpec) -> Result<Vec<Document>, QueryError> {
        let plan = planner::compile(spec).inspect_err(|e| {
            warn!(error = %e, "rejected query");
        })?;
        self.execute(&plan).await
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn stamp(record: &mut Document) {
    record.insert(
        TIMESTAMP_FIELD.to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );
}

fn encode(record: &Document) -> Vec<u8> {
    // Serializing a JSON map cannot fail.
    serde_json::to_vec(record).unwrap_or_default()
}

fn decode(key: &str, data: &[u8]) -> Result<Document, StoreError> {
    serde_json::from_slice(data).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}
