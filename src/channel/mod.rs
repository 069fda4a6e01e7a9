//! Publish/subscribe transport between producers and the inserter.
//!
//! # Architecture
//!
//! [`Channel`] is the capability interface every backend implements:
//! [`publish`](Channel::publish), [`publish_bulk`](Channel::publish_bulk),
//! [`subscribe`](Channel::subscribe), [`listen`](Channel::listen) and
//! [`liveness_probe`](Channel::liveness_probe). Backends only know how to
//! move bytes; the shared listen loop ([`drive`]) owns decoding, handler
//! dispatch and the reconnect budget, so retry behaviour is identical
//! across backends.
//!
//! # Backends
//!
//! - [`LocalChannel`](local::LocalChannel) -- in-process broadcast bus,
//!   used for embedded deployments and tests.
//! - [`RedisChannel`](redis::RedisChannel) -- Redis pub/sub (push-based).
//!   Available behind the `redis` feature flag.
//! - [`KafkaChannel`](kafka::KafkaChannel) -- Kafka topic with a consumer
//!   group (poll-based). Available behind the `kafka` feature flag.
//!
//! # Failure handling
//!
//! - A message that fails to encode is skipped by `publish_bulk` and the
//!   rest of the batch is still sent.
//! - A payload that fails to decode is logged and dropped; the loop goes on.
//! - Transient connectivity failures are retried per [`ReconnectPolicy`];
//!   a successfully processed message restores the budget.
//! - Protocol errors and budget exhaustion end `listen` with an error.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod local;
pub mod reconnect;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, warn};

pub use reconnect::{ReconnectPolicy, RetryBudget};

use crate::codec;
use crate::config::{MqBackend, MqConfig};
use crate::error::ChannelError;
use crate::message::{Envelope, Inbound};

/// Diagnostics of one bulk publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Messages handed to the broker.
    pub sent: usize,
    /// Messages skipped because they could not be encoded.
    pub skipped: usize,
    /// Total encoded bytes sent.
    pub bytes: usize,
    /// Wall time of the publish.
    pub elapsed: Duration,
}

/// Why a [`Channel::listen`] call returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
    /// The handler asked to stop.
    Stopped,
    /// The broker closed the subscription for good.
    Closed,
}

/// Receives decoded messages from [`Channel::listen`].
///
/// Returning `false` from either method ends the loop.
#[async_trait]
pub trait MessageHandler: Send {
    /// Handles one decoded message.
    async fn on_message(&mut self, message: Inbound) -> bool;

    /// Called when a poll times out without a message, and after each
    /// reconnect backoff, so time-based work and stop checks still run on a
    /// quiet channel.
    async fn on_idle(&mut self) -> bool {
        true
    }
}

/// Uniform publish/subscribe transport.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Returns the backend name (`local`, `redis`, `kafka`).
    fn backend(&self) -> &'static str;

    /// Encodes and sends one message, returning the encoded size.
    ///
    /// Failures are logged before being returned.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Codec`] if the message cannot be encoded.
    /// - [`ChannelError::Connection`] or [`ChannelError::Protocol`] if the
    ///   broker rejects it.
    async fn publish(&self, message: &Envelope, channel: &str) -> Result<usize, ChannelError>;

    /// Sends a batch in one round trip, skipping entries that fail to encode.
    ///
    /// # Errors
    ///
    /// Returns an error only if the broker write itself fails; encoding
    /// failures are counted in [`PublishReport::skipped`].
    async fn publish_bulk(
        &self,
        batch: &[Envelope],
        channel: &str,
    ) -> Result<PublishReport, ChannelError>;

    /// Establishes the read position on `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established.
    async fn subscribe(&self, channel: &str) -> Result<(), ChannelError>;

    /// Runs the receive loop until the handler stops it.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::NotSubscribed`] if [`subscribe`](Self::subscribe)
    ///   was not called.
    /// - [`ChannelError::RetriesExhausted`] once the reconnect budget runs out.
    /// - [`ChannelError::Protocol`] on a non-retryable broker error.
    async fn listen(&self, handler: &mut dyn MessageHandler)
        -> Result<ListenOutcome, ChannelError>;

    /// Returns `true` if the broker answers. Never fails.
    async fn liveness_probe(&self) -> bool;
}

impl std::fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channel({})", self.backend())
    }
}

/// Result of one receive attempt by a backend.
#[derive(Debug)]
pub enum Poll {
    /// A raw payload arrived.
    Payload(Vec<u8>),
    /// The poll timed out (or yielded something that is not a payload).
    Idle,
    /// The subscription ended and will not resume.
    Closed,
}

/// Backend half of the listen loop.
#[async_trait]
pub trait PayloadSource: Send {
    /// Backend name for diagnostics.
    fn backend(&self) -> &'static str;

    /// Waits up to the poll timeout for the next payload.
    async fn next(&mut self) -> Result<Poll, ChannelError>;

    /// Re-establishes the subscription after a transient failure.
    async fn reconnect(&mut self) -> Result<(), ChannelError>;
}

/// The listen loop shared by every backend.
///
/// # Errors
///
/// See [`Channel::listen`].
pub async fn drive(
    source: &mut dyn PayloadSource,
    handler: &mut dyn MessageHandler,
    policy: ReconnectPolicy,
) -> Result<ListenOutcome, ChannelError> {
    let backend = source.backend();
    let mut budget = RetryBudget::new(backend, policy);
    loop {
        match source.next().await {
            Ok(Poll::Payload(bytes)) => match codec::decode(&bytes) {
                Ok(message) => {
                    budget.reset();
                    if !handler.on_message(message).await {
                        return Ok(ListenOutcome::Stopped);
                    }
                },
                Err(e) => {
                    warn!(backend, error = %e, bytes = bytes.len(), "dropping undecodable message");
                },
            },
            Ok(Poll::Idle) => {
                if !handler.on_idle().await {
                    return Ok(ListenOutcome::Stopped);
                }
            },
            Ok(Poll::Closed) => {
                debug!(backend, "subscription closed");
                return Ok(ListenOutcome::Closed);
            },
            Err(e) if e.is_transient() => {
                budget.on_failure(e).await?;
                if !handler.on_idle().await {
                    return Ok(ListenOutcome::Stopped);
                }
                reconnect(source, &mut budget, handler).await?;
            },
            Err(e) => {
                error!(backend, error = %e, "non-retryable channel error");
                return Err(e);
            },
        }
    }
}

async fn reconnect(
    source: &mut dyn PayloadSource,
    budget: &mut RetryBudget,
    handler: &mut dyn MessageHandler,
) -> Result<(), ChannelError> {
    loop {
        match source.reconnect().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => {
                budget.on_failure(e).await?;
                // A stop request must not wait for the broker to come back.
                if !handler.on_idle().await {
                    return Ok(());
                }
            },
            Err(e) => return Err(e),
        }
    }
}

/// Encodes a batch for bulk publishing, skipping (and logging) entries
/// that cannot be encoded.
pub fn encode_batch(
    batch: &[Envelope],
    limit: usize,
    backend: &'static str,
) -> (Vec<Vec<u8>>, PublishReport) {
    let mut report = PublishReport::default();
    let mut payloads = Vec::with_capacity(batch.len());
    for (index, envelope) in batch.iter().enumerate() {
        match codec::encode(envelope, limit) {
            Ok(bytes) => {
                report.bytes += bytes.len();
                payloads.push(bytes);
            },
            Err(e) => {
                warn!(backend, index, error = %e, "skipping message that failed to encode");
                report.skipped += 1;
            },
        }
    }
    report.sent = payloads.len();
    (payloads, report)
}

/// Logs the outcome of a bulk publish and stamps its duration.
pub(crate) fn finish_report(
    backend: &'static str,
    channel: &str,
    mut report: PublishReport,
    started: Instant,
) -> PublishReport {
    report.elapsed = started.elapsed();
    debug!(
        backend,
        channel,
        sent = report.sent,
        skipped = report.skipped,
        bytes = report.bytes,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "bulk publish finished"
    );
    report
}

/// Logs a publish failure before handing it back.
pub(crate) fn log_publish_error(backend: &'static str, channel: &str, err: ChannelError) -> ChannelError {
    error!(backend, channel, error = %err, "publish failed");
    err
}

/// Builds the configured channel backend.
///
/// # Errors
///
/// - [`ChannelError::UnsupportedBackend`] if the backend was not compiled in.
/// - [`ChannelError::Connection`] if the broker cannot be reached.
pub async fn connect(config: &MqConfig) -> Result<Arc<dyn Channel>, ChannelError> {
    match config.backend {
        MqBackend::Local => Ok(Arc::new(local::LocalChannel::new(config))),
        #[cfg(feature = "redis")]
        MqBackend::Redis => Ok(Arc::new(redis::RedisChannel::connect(config).await?)),
        #[cfg(feature = "kafka")]
        MqBackend::Kafka => Ok(Arc::new(kafka::KafkaChannel::connect(config)?)),
        #[allow(unreachable_patterns)]
        other => Err(ChannelError::UnsupportedBackend(format!(
            "{other} (rebuild with the `{other}` feature)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ControlMessage, TaskMessage};
    use std::collections::VecDeque;

    /// Scripted payload source.
    struct Script {
        steps: VecDeque<Result<Poll, ChannelError>>,
        reconnects: usize,
    }

    #[async_trait]
    impl PayloadSource for Script {
        fn backend(&self) -> &'static str {
            "script"
        }

        async fn next(&mut self) -> Result<Poll, ChannelError> {
            self.steps.pop_front().unwrap_or(Ok(Poll::Closed))
        }

        async fn reconnect(&mut self) -> Result<(), ChannelError> {
            self.reconnects += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collect {
        seen: Vec<Inbound>,
        idles: usize,
    }

    #[async_trait]
    impl MessageHandler for Collect {
        async fn on_message(&mut self, message: Inbound) -> bool {
            let stop = matches!(message, Envelope::Control(ControlMessage::Stop));
            self.seen.push(message);
            !stop
        }

        async fn on_idle(&mut self) -> bool {
            self.idles += 1;
            true
        }
    }

    fn payload(env: Envelope) -> Result<Poll, ChannelError> {
        Ok(Poll::Payload(codec::encode(&env, codec::DEFAULT_MAX_MESSAGE_BYTES).unwrap()))
    }

    fn down() -> Result<Poll, ChannelError> {
        Err(ChannelError::Connection {
            backend: "script",
            message: "down".to_string(),
            source: None,
        })
    }

    fn fast() -> ReconnectPolicy {
        ReconnectPolicy::new(2, Duration::from_millis(5))
    }

    #[tokio::test(start_paused = true)]
    async fn control_message_stops_the_loop() {
        let mut source = Script {
            steps: VecDeque::from([
                payload(TaskMessage::new("a").into()),
                Ok(Poll::Idle),
                payload(ControlMessage::Stop.into()),
                payload(TaskMessage::new("never").into()),
            ]),
            reconnects: 0,
        };
        let mut handler = Collect::default();
        let outcome = drive(&mut source, &mut handler, fast()).await.unwrap();
        assert_eq!(outcome, ListenOutcome::Stopped);
        assert_eq!(handler.seen.len(), 2);
        assert_eq!(handler.idles, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_is_skipped() {
        let mut source = Script {
            steps: VecDeque::from([
                Ok(Poll::Payload(vec![0xc1])),
                payload(TaskMessage::new("a").into()),
            ]),
            reconnects: 0,
        };
        let mut handler = Collect::default();
        let outcome = drive(&mut source, &mut handler, fast()).await.unwrap();
        assert_eq!(outcome, ListenOutcome::Closed);
        assert_eq!(handler.seen, vec![Envelope::Task(TaskMessage::new("a"))]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_reconnect_and_reset() {
        let mut source = Script {
            steps: VecDeque::from([
                down(),
                down(),
                payload(TaskMessage::new("a").into()),
                down(),
                down(),
                payload(TaskMessage::new("b").into()),
            ]),
            reconnects: 0,
        };
        let mut handler = Collect::default();
        let outcome = drive(&mut source, &mut handler, fast()).await.unwrap();
        assert_eq!(outcome, ListenOutcome::Closed);
        assert_eq!(handler.seen.len(), 2);
        assert_eq!(source.reconnects, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_ends_the_loop() {
        let mut source = Script {
            steps: VecDeque::from([down(), down(), down()]),
            reconnects: 0,
        };
        let mut handler = Collect::default();
        let err = drive(&mut source, &mut handler, fast()).await.unwrap_err();
        assert!(matches!(err, ChannelError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_error_ends_immediately() {
        let mut source = Script {
            steps: VecDeque::from([Err(ChannelError::Protocol {
                backend: "script",
                message: "unknown topic".to_string(),
            })]),
            reconnects: 0,
        };
        let mut handler = Collect::default();
        let err = drive(&mut source, &mut handler, fast()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Protocol { .. }));
        assert_eq!(source.reconnects, 0);
    }

    #[test]
    fn encode_batch_skips_oversized_entries() {
        let mut big = TaskMessage::new("big");
        big.stdout = Some("x".repeat(4096));
        let batch: Vec<Envelope> = (0..10)
            .map(|i| {
                if i == 4 {
                    big.clone().into()
                } else {
                    TaskMessage::new(format!("t{i}")).into()
                }
            })
            .collect();
        let (payloads, report) = encode_batch(&batch, 1024, "test");
        assert_eq!(payloads.len(), 9);
        assert_eq!(report.sent, 9);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.bytes, payloads.iter().map(Vec::len).sum::<usize>());
    }
}
