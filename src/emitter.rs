//! Producer-side publishing.
//!
//! [`Emitter::emit`] is fire-and-forget: failures are logged by the channel
//! and never reach the producer. With `buffer_size > 1` messages are held
//! locally and sent with one [`publish_bulk`](Channel::publish_bulk) when
//! the buffer fills, when a non-empty buffer has waited `flush_interval_ms`
//! by the time of the next emit, or on an explicit [`flush`](Emitter::flush).
//!
//! Every send is recorded as a [`FlushEvent`] in a bounded in-memory
//! history, which is how producers inspect publish latency and volume.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use flowtrace::channel::local::LocalChannel;
//! use flowtrace::config::{EmitterConfig, MqConfig};
//! use flowtrace::emitter::{Emitter, FlushKind};
//! use flowtrace::TaskMessage;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let channel = Arc::new(LocalChannel::new(&MqConfig::default()));
//! let emitter = Emitter::new(channel, "interception", EmitterConfig::default());
//! emitter.emit(TaskMessage::new("t1")).await;
//! assert_eq!(emitter.buffered().await, 1);
//!
//! emitter.stop().await;
//! let kinds: Vec<_> = emitter.history().iter().map(|e| e.kind).collect();
//! assert_eq!(kinds, vec![FlushKind::Bulk, FlushKind::Final]);
//! # }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::{Channel, PublishReport};
use crate::config::EmitterConfig;
use crate::message::{ControlMessage, Envelope, TaskMessage};

/// What a [`FlushEvent`] recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushKind {
    /// One unbuffered publish.
    Single,
    /// One bulk publish of the buffer.
    Bulk,
    /// The stop message.
    Final,
}

impl fmt::Display for FlushKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Bulk => write!(f, "bulk"),
            Self::Final => write!(f, "final"),
        }
    }
}

/// One recorded send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushEvent {
    /// Kind of send.
    pub kind: FlushKind,
    /// When the send started.
    pub started: DateTime<Utc>,
    /// How long it took.
    pub duration: Duration,
    /// Encoded bytes sent.
    pub size: usize,
}

struct Pending {
    messages: Vec<Envelope>,
    since: Instant,
}

/// Fire-and-forget publisher with optional client-side buffering.
pub struct Emitter {
    channel: Arc<dyn Channel>,
    channel_name: String,
    config: EmitterConfig,
    pending: tokio::sync::Mutex<Pending>,
    history: Mutex<VecDeque<FlushEvent>>,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("backend", &self.channel.backend())
            .field("channel", &self.channel_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Emitter {
    /// Creates an emitter publishing to `channel_name`.
    pub fn new(
        channel: Arc<dyn Channel>,
        channel_name: impl Into<String>,
        config: EmitterConfig,
    ) -> Self {
        Self {
            channel,
            channel_name: channel_name.into(),
            pending: tokio::sync::Mutex::new(Pending {
                messages: Vec::with_capacity(config.buffer_size),
                since: Instant::now(),
            }),
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
            config,
        }
    }

    /// Publishes (or buffers) one task message.
    ///
    /// Returns `false` only if an immediate send failed; the failure has
    /// already been logged.
    pub async fn emit(&self, message: TaskMessage) -> bool {
        if self.config.buffer_size <= 1 {
            return self.send_single(message.into()).await;
        }
        let mut pending = self.pending.lock().await;
        if pending.messages.is_empty() {
            pending.since = Instant::now();
        }
        pending.messages.push(message.into());
        let interval = Duration::from_millis(self.config.flush_interval_ms);
        if pending.messages.len() >= self.config.buffer_size || pending.since.elapsed() >= interval {
            return self.send_bulk(&mut pending).await.is_some();
        }
        true
    }

    /// Sends whatever is buffered.
    ///
    /// Returns `None` if nothing was buffered or the bulk publish failed.
    pub async fn flush(&self) -> Option<PublishReport> {
        let mut pending = self.pending.lock().await;
        self.send_bulk(&mut pending).await
    }

    /// Flushes the buffer, then publishes the stop message so listeners
    /// drain and exit.
    ///
    /// Returns `true` if the stop message was sent.
    pub async fn stop(&self) -> bool {
        self.flush().await;
        let started = Utc::now();
        let clock = Instant::now();
        match self
            .channel
            .publish(&Envelope::Control(ControlMessage::Stop), &self.channel_name)
            .await
        {
            Ok(size) => {
                self.record(FlushKind::Final, started, clock.elapsed(), size);
                debug!(channel = %self.channel_name, "published stop message");
                true
            },
            Err(_) => false,
        }
    }

    /// Returns the number of buffered messages.
    pub async fn buffered(&self) -> usize {
        self.pending.lock().await.messages.len()
    }

    /// Returns the recorded sends, oldest first.
    pub fn history(&self) -> Vec<FlushEvent> {
        self.history.lock().iter().cloned().collect()
    }

    async fn send_single(&self, envelope: Envelope) -> bool {
        let started = Utc::now();
        let clock = Instant::now();
        match self.channel.publish(&envelope, &self.channel_name).await {
            Ok(size) => {
                self.record(FlushKind::Single, started, clock.elapsed(), size);
                true
            },
            Err(_) => false,
        }
    }

    async fn send_bulk(&self, pending: &mut Pending) -> Option<PublishReport> {
        if pending.messages.is_empty() {
            return None;
        }
        let started = Utc::now();
        let result = self
            .channel
            .publish_bulk(&pending.messages, &self.channel_name)
            .await;
        let count = pending.messages.len();
        pending.messages.clear();
        pending.since = Instant::now();
        match result {
            Ok(report) => {
                self.record(FlushKind::Bulk, started, report.elapsed, report.bytes);
                Some(report)
            },
            Err(e) => {
                warn!(error = %e, lost = count, "bulk publish failed, buffered messages dropped");
                None
            },
        }
    }

    fn record(&self, kind: FlushKind, started: DateTime<Utc>, duration: Duration, size: usize) {
        if self.config.history_capacity == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() == self.config.history_capacity {
            history.pop_front();
        }
        history.push_back(FlushEvent {
            kind,
            started,
            duration,
            size,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::local::LocalChannel;
    use crate::channel::MessageHandler;
    use crate::config::MqConfig;
    use crate::message::Inbound;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    const CHANNEL: &str = "interception";

    fn local() -> Arc<LocalChannel> {
        Arc::new(LocalChannel::new(&MqConfig {
            poll_timeout_ms: 50,
            ..MqConfig::default()
        }))
    }

    fn config(buffer_size: usize) -> EmitterConfig {
        EmitterConfig {
            buffer_size,
            flush_interval_ms: 60_000,
            history_capacity: 8,
        }
    }

    #[derive(Default)]
    struct Collect(Vec<Inbound>);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn on_message(&mut self, message: Inbound) -> bool {
            let go_on = !matches!(message, Envelope::Control(_));
            self.0.push(message);
            go_on
        }
    }

    #[tokio::test]
    async fn test_buffered_emit_then_stop_delivers_everything() {
        let channel = local();
        channel.subscribe(CHANNEL).await.unwrap();
        let emitter = Emitter::new(channel.clone(), CHANNEL, config(2));

        for id in ["a", "b", "c"] {
            assert!(emitter.emit(TaskMessage::new(id)).await);
        }
        assert_eq!(emitter.buffered().await, 1);
        assert!(emitter.stop().await);

        let mut received = Collect::default();
        channel.listen(&mut received).await.unwrap();
        assert_eq!(received.0.len(), 4);
        assert_eq!(received.0[3], Envelope::Control(ControlMessage::Stop));

        let kinds: Vec<_> = emitter.history().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![FlushKind::Bulk, FlushKind::Bulk, FlushKind::Final]);
        assert!(emitter.history().iter().all(|e| e.size > 0));
    }

    #[tokio::test]
    async fn test_unbuffered_emit_publishes_immediately() {
        let channel = local();
        let emitter = Emitter::new(channel, CHANNEL, config(1));
        assert!(emitter.emit(TaskMessage::new("a")).await);
        assert_eq!(emitter.buffered().await, 0);
        assert_eq!(emitter.history()[0].kind, FlushKind::Single);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_buffer_flushes_on_next_emit() {
        let emitter = Emitter::new(
            local(),
            CHANNEL,
            EmitterConfig {
                flush_interval_ms: 1000,
                ..config(10)
            },
        );
        emitter.emit(TaskMessage::new("a")).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        emitter.emit(TaskMessage::new("b")).await;
        assert_eq!(emitter.buffered().await, 0);
        assert_eq!(emitter.history().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_on_empty_buffer_is_a_no_op() {
        let emitter = Emitter::new(local(), CHANNEL, config(10));
        assert!(emitter.flush().await.is_none());
        assert!(emitter.history().is_empty());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let emitter = Emitter::new(
            local(),
            CHANNEL,
            EmitterConfig {
                history_capacity: 3,
                ..config(1)
            },
        );
        for i in 0..5 {
            emitter.emit(TaskMessage::new(format!("t{i}"))).await;
        }
        assert_eq!(emitter.history().len(), 3);
    }

    #[test]
    fn test_flush_kind_names() {
        assert_eq!(FlushKind::Single.to_string(), "single");
        assert_eq!(FlushKind::Final.to_string(), "final");
    }
}
