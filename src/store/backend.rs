//! Low-level record storage backend trait and supporting types.
//!
//! The [`StoreBackend`] trait is the contract every storage engine
//! implements: [`get`](StoreBackend::get), [`create`](StoreBackend::create),
//! [`put_if_version`](StoreBackend::put_if_version),
//! [`delete`](StoreBackend::delete), [`list`](StoreBackend::list) and
//! [`len`](StoreBackend::len).
//!
//! Domain logic (curation merge, correlation-key uniqueness, `_id`
//! assignment, timestamp stamping, query evaluation) does **not** belong
//! here. Backends are dumb versioned key-value stores; domain logic lives in
//! [`DocumentStore`](crate::store::DocumentStore).
//!
//! # Key Structure
//!
//! A record carrying a correlation-key value is stored under
//! `key:{value}` (see [`keyed`]); the key itself is the unique index, so two
//! records can never share a correlation-key value. Raw inserts without a
//! correlation-key value are stored under `id:{_id}` (see [`anonymous`]).
//!
//! # Versioning
//!
//! Each stored record carries a monotonic `u64` version starting at 1,
//! incremented on every successful write. [`put_if_version`](StoreBackend::put_if_version)
//! provides compare-and-swap semantics so concurrent upserts of the same key
//! never lose a field.

use std::fmt;

use async_trait::async_trait;

/// A stored record paired with its monotonic version number.
///
/// `data` holds the serialized record (canonical JSON produced by
/// [`DocumentStore`](crate::store::DocumentStore)).
///
/// # Examples
///
/// ```
/// use flowtrace::store::backend::VersionedRecord;
///
/// let record = VersionedRecord {
///     data: b"{}".to_vec(),
///     version: 1,
/// };
/// assert_eq!(record.version, 1);
/// ```
#[derive(Debug, Clone)]
pub struct VersionedRecord {
    /// The serialized record bytes (JSON object).
    pub data: Vec<u8>,

    /// Monotonic version number. Starts at 1, increments on each
    /// successful write.
    pub version: u64,
}

/// Errors that can occur during raw storage operations.
///
/// [`DocumentStore`](crate::store::DocumentStore) maps these to
/// [`StoreError`](crate::store::StoreError) before surfacing them.
///
/// # Examples
///
/// ```
/// use flowtrace::store::backend::StorageError;
///
/// let err = StorageError::AlreadyExists { key: "key:t-1".to_string() };
/// assert!(err.to_string().contains("key:t-1"));
/// ```
#[derive(Debug)]
pub enum StorageError {
    /// The requested key was not found in storage.
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// A [`create`](StoreBackend::create) call found the key already present.
    AlreadyExists {
        /// The key that already exists.
        key: String,
    },

    /// A [`put_if_version`](StoreBackend::put_if_version) call failed
    /// because the stored version does not match the expected version.
    VersionConflict {
        /// The key where the conflict occurred.
        key: String,
        /// The version the caller expected.
        expected: u64,
        /// The actual version found in storage.
        actual: u64,
    },

    /// An I/O or backend-specific error occurred (network failure,
    /// script error, corrupt entry).
    Backend {
        /// Human-readable description of the error.
        message: String,
        /// The underlying error, if available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "key not found: {key}"),
            Self::AlreadyExists { key } => write!(f, "key already exists: {key}"),
            Self::VersionConflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "version conflict on key {key}: expected {expected}, found {actual}"
            ),
            Self::Backend { message, .. } => write!(f, "backend error: {message}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

/// Versioned key-value storage for merged task records.
///
/// Implementations must be `Send + Sync`: the inserter writes while query
/// callers read concurrently.
///
/// # Ordering
///
/// [`list`](StoreBackend::list) returns records in creation order. Query
/// operators such as `first`/`last` and unsorted reads rely on it.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Returns a short backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Retrieves a record by key.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if no record exists for the key.
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError>;

    /// Stores a new record at version 1, failing if the key exists.
    ///
    /// # Errors
    ///
    /// - [`StorageError::AlreadyExists`] if the key is already present.
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn create(&self, key: &str, data: &[u8]) -> Result<u64, StorageError>;

    /// Replaces a record only if its version matches `expected_version`.
    ///
    /// Returns the new version on success.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if no record exists for the key.
    /// - [`StorageError::VersionConflict`] on a version mismatch.
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    /// Deletes a record by key, returning whether it existed.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Lists every record in creation order.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn list(&self) -> Result<Vec<(String, VersionedRecord)>, StorageError>;

    /// Returns the number of stored records.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn len(&self) -> Result<usize, StorageError>;
}

/// Storage key of a record with a correlation-key value.
///
/// # Examples
///
/// ```
/// use flowtrace::store::backend::keyed;
///
/// assert_eq!(keyed("t-1"), "key:t-1");
/// ```
pub fn keyed(correlation_value: &str) -> String {
    format!("key:{correlation_value}")
}

/// Storage key of a raw record without a correlation-key value.
///
/// # Examples
///
/// ```
/// use flowtrace::store::backend::anonymous;
///
/// assert_eq!(anonymous("6f1c"), "id:6f1c");
/// ```
pub fn anonymous(record_id: &str) -> String {
    format!("id:{record_id}")
}
