//! Error types for flowtrace operations.
//!
//! Each pipeline boundary has its own error enum so callers can tell a
//! transient broker hiccup from a malformed query:
//!
//! - [`CodecError`] - wire encoding and decoding of single messages
//! - [`ChannelError`] - broker transport failures, classified by
//!   [`ChannelError::is_transient`]
//! - [`StoreError`](crate::store::StoreError) - document store operations
//! - [`QueryError`](crate::query::QueryError) - query compilation and execution
//! - [`ConfigError`](crate::config::ConfigError) - configuration loading
//!
//! [`FlowError`] wraps all of them for callers that do not care which
//! layer failed.

use thiserror::Error;

use crate::config::ConfigError;
use crate::query::QueryError;
use crate::store::StoreError;

/// Errors raised while encoding or decoding one wire message.
///
/// A codec failure only ever affects a single message: bulk publish skips
/// the offending entry and the listen loop drops the undecodable payload.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The message could not be serialized to MessagePack.
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// The payload is not valid MessagePack for a known message shape.
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The encoded message exceeds the configured per-message limit.
    #[error("encoded message is {size} bytes, exceeding the {limit} byte limit")]
    TooLarge {
        /// Encoded size in bytes.
        size: usize,
        /// Configured maximum in bytes.
        limit: usize,
    },

    /// The payload decoded but is neither a task message nor a control message.
    #[error("unrecognised message shape: {0}")]
    Shape(String),
}

/// Errors raised by a [`Channel`](crate::channel::Channel) backend.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The broker could not be reached or the connection dropped.
    ///
    /// Retried by the listen loop with fixed backoff.
    #[error("{backend} connection error: {message}")]
    Connection {
        /// Backend name (`local`, `redis`, `kafka`).
        backend: &'static str,
        /// Human-readable description.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The broker answered with an error that retrying cannot fix.
    #[error("{backend} protocol error: {message}")]
    Protocol {
        /// Backend name (`local`, `redis`, `kafka`).
        backend: &'static str,
        /// Human-readable description.
        message: String,
    },

    /// `listen` was called before `subscribe`.
    #[error("listen called before subscribe")]
    NotSubscribed,

    /// The reconnect budget ran out.
    #[error("gave up after {attempts} reconnect attempts: {last}")]
    RetriesExhausted {
        /// Number of consecutive failed attempts.
        attempts: u32,
        /// The failure that exhausted the budget.
        last: Box<ChannelError>,
    },

    /// A message could not be encoded for publishing.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The configured backend is unknown or was not compiled in.
    #[error("unsupported channel backend: {0}")]
    UnsupportedBackend(String),
}

impl ChannelError {
    /// Returns `true` for connectivity failures that the listen loop retries.
    ///
    /// # Examples
    ///
    /// ```
    /// use flowtrace::ChannelError;
    ///
    /// let err = ChannelError::Connection {
    ///     backend: "redis",
    ///     message: "connection refused".to_string(),
    ///     source: None,
    /// };
    /// assert!(err.is_transient());
    ///
    /// let err = ChannelError::Protocol {
    ///     backend: "kafka",
    ///     message: "unknown topic".to_string(),
    /// };
    /// assert!(!err.is_transient());
    /// ```
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub(crate) fn connection(
        backend: &'static str,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            backend,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Umbrella error for callers that drive several components at once.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Channel failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Document store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Query failure.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The consumer task panicked or was aborted.
    #[error("consumer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = FlowError> = std::result::Result<T, E>;
