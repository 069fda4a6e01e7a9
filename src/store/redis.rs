//! Redis storage backend for merged task records.
//!
//! [`RedisBackend`] implements [`StoreBackend`] on Redis: `HGETALL` for
//! reads and Lua scripts (`redis::Script`) for writes, so the record hash,
//! the creation-order index and the sequence counter change in one atomic
//! round-trip.
//!
//! # Key Schema
//!
//! | Key Pattern | Type | Purpose |
//! |-------------|------|---------|
//! | `{prefix}:records:{key}` | Hash | Record storage |
//! | `{prefix}:idx` | Sorted Set | Creation-order index (member = key) |
//! | `{prefix}:seq` | String | Creation sequence counter |
//!
//! Each record hash has two fields:
//!
//! | Field | Type | Description |
//! |-------|------|-------------|
//! | `version` | String (u64) | Monotonic CAS version, starts at 1 |
//! | `data` | String (JSON) | Serialized record |
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowtrace::store::redis::RedisBackend;
//! use flowtrace::store::DocumentStore;
//!
//! # async fn example() {
//! let backend = RedisBackend::new("redis://127.0.0.1:6379").await.unwrap();
//! let store = DocumentStore::new(Arc::new(backend), "task_id");
//! # }
//! ```

use std::collections::HashMap;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;

use crate::store::backend::{StorageError, StoreBackend, VersionedRecord};

// ---------------------------------------------------------------------------
// Lua script constants
// ---------------------------------------------------------------------------

/// Create-if-absent: write version 1 and append to the creation index.
///
/// KEYS[1] = record hash key, KEYS[2] = index sorted set, KEYS[3] = sequence.
/// ARGV[1] = data JSON, ARGV[2] = record key (index member).
/// Returns: 1 if created, 0 if the key already existed.
const LUA_CREATE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'version', '1', 'data', ARGV[1])
local seq = redis.call('INCR', KEYS[3])
redis.call('ZADD', KEYS[2], seq, ARGV[2])
return 1
"#;

/// Conditional put (CAS): check version, then update or reject.
///
/// KEYS[1] = record hash key.
/// ARGV[1] = data, ARGV[2] = expected_version.
/// Returns: {status, value} where status 1=success, 0=mismatch, -1=missing.
const LUA_PUT_IF_VERSION: &str = r#"
local current_version = redis.call('HGET', KEYS[1], 'version')
if not current_version then
    return {-1, 0}
end

local expected = tonumber(ARGV[2])
local actual = tonumber(current_version)
if actual ~= expected then
    return {0, actual}
end

local new_version = actual + 1
redis.call('HSET', KEYS[1], 'version', tostring(new_version), 'data', ARGV[1])
return {1, new_version}
"#;

/// Delete: remove hash and index entry.
///
/// KEYS[1] = record hash key, KEYS[2] = index sorted set.
/// ARGV[1] = record key (index member).
/// Returns: 1 if the key existed and was deleted, 0 otherwise.
const LUA_DELETE: &str = r#"
local existed = redis.call('EXISTS', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
if existed == 1 then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

// ---------------------------------------------------------------------------
// RedisBackend struct
// ---------------------------------------------------------------------------

/// Redis storage backend for merged task records.
///
/// Holds a [`MultiplexedConnection`], which is cheap to clone; every method
/// clones it so concurrent callers share one TCP connection.
#[derive(Debug, Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisBackend {
    /// Creates a backend by connecting to Redis at the given URL.
    ///
    /// Uses the default key prefix `"flowtrace"`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the client cannot be created or
    /// the connection cannot be established.
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let client = ::redis::Client::open(url).map_err(|e| StorageError::Backend {
            message: format!("failed to create Redis client: {e}"),
            source: Some(Box::new(e)),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StorageError::Backend {
                message: format!("failed to connect to Redis: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self::with_connection(conn))
    }

    /// Creates a backend with a pre-built multiplexed connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: "flowtrace".to_string(),
        }
    }

    /// Sets a custom key prefix (builder pattern).
    ///
    /// Separate prefixes isolate deployments (and test runs) sharing one
    /// Redis instance.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn record_key(prefix: &str, key: &str) -> String {
    format!("{prefix}:records:{key}")
}

fn index_key(prefix: &str) -> String {
    format!("{prefix}:idx")
}

fn seq_key(prefix: &str) -> String {
    format!("{prefix}:seq")
}

fn map_redis_error(err: ::redis::RedisError, key: &str) -> StorageError {
    StorageError::Backend {
        message: format!("Redis error for key {key}: {err}"),
        source: Some(Box::new(err)),
    }
}

fn as_utf8(data: &[u8]) -> Result<&str, StorageError> {
    std::str::from_utf8(data).map_err(|e| StorageError::Backend {
        message: format!("data is not valid UTF-8: {e}"),
        source: Some(Box::new(e)),
    })
}

fn parse_fields(
    key: &str,
    fields: &HashMap<String, String>,
) -> Result<VersionedRecord, StorageError> {
    let version: u64 = fields
        .get("version")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| StorageError::Backend {
            message: format!("missing or invalid version field for key {key}"),
            source: None,
        })?;
    let data = fields.get("data").ok_or_else(|| StorageError::Backend {
        message: format!("missing data field for key {key}"),
        source: None,
    })?;
    Ok(VersionedRecord {
        data: data.as_bytes().to_vec(),
        version,
    })
}

// ---------------------------------------------------------------------------
// StoreBackend implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl StoreBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let fields: HashMap<String, String> = self
            .conn
            .clone()
            .hgetall(record_key(&self.key_prefix, key))
            .await
            .map_err(|e| map_redis_error(e, key))?;
        if fields.is_empty() {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        parse_fields(key, &fields)
    }

    async fn create(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        let created: i64 = Script::new(LUA_CREATE)
            .key(record_key(&self.key_prefix, key))
            .key(index_key(&self.key_prefix))
            .key(seq_key(&self.key_prefix))
            .arg(as_utf8(data)?)
            .arg(key)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        if created == 1 {
            Ok(1)
        } else {
            Err(StorageError::AlreadyExists {
                key: key.to_string(),
            })
        }
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let (status, value): (i64, i64) = Script::new(LUA_PUT_IF_VERSION)
            .key(record_key(&self.key_prefix, key))
            .arg(as_utf8(data)?)
            .arg(expected_version)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;

        match status {
            1 => Ok(value as u64),
            0 => Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: value as u64,
            }),
            _ => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let result: i64 = Script::new(LUA_DELETE)
            .key(record_key(&self.key_prefix, key))
            .key(index_key(&self.key_prefix))
            .arg(key)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(result == 1)
    }

    async fn list(&self) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        let idx = index_key(&self.key_prefix);
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn
            .zrange(&idx, 0, -1)
            .await
            .map_err(|e| map_redis_error(e, &idx))?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = ::redis::pipe();
        for key in &keys {
            pipe.hgetall(record_key(&self.key_prefix, key));
        }
        let hashes: Vec<HashMap<String, String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, &idx))?;

        let mut results = Vec::with_capacity(keys.len());
        let mut orphaned: Vec<&String> = Vec::new();
        for (key, fields) in keys.iter().zip(hashes.iter()) {
            if fields.is_empty() {
                orphaned.push(key);
                continue;
            }
            results.push((key.clone(), parse_fields(key, fields)?));
        }

        // Best-effort cleanup of index entries whose hash is gone.
        if !orphaned.is_empty() {
            let _: Result<(), ::redis::RedisError> = conn.zrem(&idx, orphaned).await;
        }
        Ok(results)
    }

    async fn len(&self) -> Result<usize, StorageError> {
        let idx = index_key(&self.key_prefix);
        self.conn
            .clone()
            .zcard(&idx)
            .await
            .map_err(|e| map_redis_error(e, &idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_schema() {
        assert_eq!(record_key("ft", "key:t-1"), "ft:records:key:t-1");
        assert_eq!(index_key("ft"), "ft:idx");
        assert_eq!(seq_key("ft"), "ft:seq");
    }

    #[test]
    fn parse_fields_reads_version_and_data() {
        let fields = HashMap::from([
            ("version".to_string(), "3".to_string()),
            ("data".to_string(), "{}".to_string()),
        ]);
        let record = parse_fields("k", &fields).unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.data, b"{}");
    }

    #[test]
    fn parse_fields_rejects_missing_version() {
        let fields = HashMap::from([("data".to_string(), "{}".to_string())]);
        assert!(matches!(
            parse_fields("k", &fields),
            Err(StorageError::Backend { .. })
        ));
    }

    #[test]
    fn invalid_utf8_is_a_backend_error() {
        assert!(as_utf8(&[0xff, 0xfe]).is_err());
    }
}

/// Contract tests against a real Redis instance.
///
/// Run with `cargo test --features redis-tests -- --test-threads=1`;
/// `REDIS_URL` overrides the default `redis://127.0.0.1:6379`.
#[cfg(all(test, feature = "redis-tests"))]
mod integration_tests {
    use super::*;

    async fn test_backend() -> RedisBackend {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisBackend::new(&url)
            .await
            .expect("Redis connection failed -- is Redis running?")
            .with_prefix(format!("test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn redis_create_get_cas_delete() {
        let backend = test_backend().await;
        assert_eq!(backend.create("key:a", b"{\"v\":1}").await.unwrap(), 1);
        assert!(matches!(
            backend.create("key:a", b"{}").await,
            Err(StorageError::AlreadyExists { .. })
        ));
        assert_eq!(
            backend.put_if_version("key:a", b"{\"v\":2}", 1).await.unwrap(),
            2
        );
        assert!(matches!(
            backend.put_if_version("key:a", b"{}", 1).await,
            Err(StorageError::VersionConflict { actual: 2, .. })
        ));
        assert_eq!(backend.get("key:a").await.unwrap().data, b"{\"v\":2}");
        assert!(backend.delete("key:a").await.unwrap());
        assert!(!backend.delete("key:a").await.unwrap());
    }

    #[tokio::test]
    async fn redis_list_keeps_creation_order() {
        let backend = test_backend().await;
        for key in ["key:c", "key:a", "key:b"] {
            backend.create(key, b"{}").await.unwrap();
        }
        let keys: Vec<String> = backend
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["key:c", "key:a", "key:b"]);
        assert_eq!(backend.len().await.unwrap(), 3);
    }
}
