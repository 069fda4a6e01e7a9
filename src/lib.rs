//! Task telemetry ingestion.
//!
//! `flowtrace` captures task observations emitted by concurrently running
//! producers, carries them over a message broker, merges repeated partial
//! observations of the same task into one record, persists the result and
//! answers declarative queries over the stored records.
//!
//! # Overview
//!
//! ```text
//! Emitter --publish--> Channel --listen--> DocumentInserter
//!                                              | buffer, curate
//!                                              v
//!                       AggregationSpec --> DocumentStore (upsert)
//! ```
//!
//! # Module Organization
//!
//! - [`message`] - Task and control message shapes
//! - [`codec`] - MessagePack wire encoding
//! - [`channel`] - Publish/subscribe transport (local, Redis, Kafka)
//! - [`curator`] - Merge of partial observations
//! - [`inserter`] - Buffered inserter and its flush policy
//! - [`store`] - Document store with correlation-key upsert
//! - [`query`] - Declarative query compilation and evaluation
//! - [`emitter`] - Producer-side publishing
//! - [`consumer`] - Start/stop facade
//! - [`config`] - TOML and environment configuration
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use flowtrace::channel::local::LocalChannel;
//! use flowtrace::config::{InserterConfig, MqConfig};
//! use flowtrace::inserter::DocumentInserter;
//! use flowtrace::store::{memory::InMemoryBackend, DocumentStore};
//! use flowtrace::{AggregateOp, AggregationSpec, TaskMessage};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let channel = Arc::new(LocalChannel::new(&MqConfig::default()));
//! let store = DocumentStore::new(Arc::new(InMemoryBackend::new()), "task_id");
//! let inserter = DocumentInserter::new(
//!     channel.clone(),
//!     store.clone(),
//!     "interception",
//!     InserterConfig::default(),
//! );
//! let handle = inserter.start().await.unwrap();
//!
//! let emitter = flowtrace::Emitter::new(channel, "interception", Default::default());
//! emitter.emit(TaskMessage::new("t1").with_used("epochs", json!(10))).await;
//! emitter.emit(TaskMessage::new("t2").with_used("epochs", json!(20))).await;
//! // Flushes the emitter buffer, then tells the inserter to drain and stop.
//! emitter.stop().await;
//! handle.join().await.unwrap();
//!
//! let spec = AggregationSpec::new().aggregate(AggregateOp::Max, "used.epochs");
//! let rows = store.query(&spec).await.unwrap();
//! assert_eq!(rows[0]["max_used_epochs"], 20);
//! # }
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod curator;
pub mod emitter;
pub mod error;
pub mod inserter;
#[cfg(feature = "logging")]
pub mod logging;
pub mod message;
pub mod query;
pub mod store;

// Re-exports for ergonomic access
pub use channel::{Channel, ListenOutcome, MessageHandler, PublishReport};
pub use config::FlowConfig;
pub use consumer::Consumer;
pub use emitter::Emitter;
pub use error::{ChannelError, CodecError, FlowError, Result};
pub use inserter::{DocumentInserter, InserterHandle, InserterState};
pub use message::{ControlMessage, Document, Envelope, TaskMessage, TaskStatus};
pub use query::{AggregateOp, AggregationSpec, QueryError, SortDirection};
pub use store::{DocumentStore, StoreError};
