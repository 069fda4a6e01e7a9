//! Buffered inserter: channel subscription to document store.
//!
//! # Lifecycle
//!
//! ```text
//! STOPPED --start()--> LISTENING <--> FLUSHING
//!                          |
//!        stop() / control message
//!                          v
//!                      STOPPING --final flush--> STOPPED
//! ```
//!
//! The listen loop, the buffer and every flush run on one spawned task, so
//! a flush never races with buffer mutation and blocks intake while it
//! runs. Each decoded task message is appended to the buffer; after the
//! append the buffer is flushed if it holds `max_buffer_size` messages or
//! `max_flush_interval` has passed since the previous flush. The time
//! threshold is also checked on every idle poll, so a single quiet message
//! is still written within roughly one poll timeout of the interval.
//!
//! A graceful stop (either [`InserterHandle::stop`] or a control message
//! arriving on the channel) always ends with a flush of whatever is
//! buffered. Killing the process loses the unflushed buffer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ListenOutcome, MessageHandler};
use crate::config::InserterConfig;
use crate::curator;
use crate::error::{ChannelError, FlowError};
use crate::message::{ControlMessage, Envelope, Inbound, TaskMessage};
use crate::store::{DocumentStore, UpsertOp};

/// Inserter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InserterState {
    /// Not listening.
    Stopped,
    /// Accepting messages.
    Listening,
    /// Writing the buffer; intake is paused.
    Flushing,
    /// Draining after a stop request.
    Stopping,
}

/// Diagnostics of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Buffered messages handed to the curator.
    pub received: usize,
    /// Distinct correlation-key values after curation.
    pub curated: usize,
    /// Messages dropped for lacking a correlation key.
    pub dropped: usize,
    /// Records created.
    pub upserted: usize,
    /// Existing records updated.
    pub matched: usize,
    /// Upserts that failed.
    pub failed: usize,
    /// Wall time of the flush.
    pub elapsed: Duration,
}

/// Running totals, published after every message and flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InserterStats {
    /// Task messages received.
    pub received: usize,
    /// Messages currently buffered.
    pub buffered: usize,
    /// Non-empty flushes performed.
    pub flushes: usize,
    /// Messages dropped for lacking a correlation key.
    pub dropped: usize,
    /// Records created.
    pub upserted: usize,
    /// Existing records updated.
    pub matched: usize,
    /// Upserts that failed.
    pub failed: usize,
    /// The most recent flush.
    pub last_flush: Option<FlushReport>,
}

impl InserterStats {
    fn record(&mut self, report: FlushReport) {
        self.flushes += 1;
        self.buffered = 0;
        self.dropped += report.dropped;
        self.upserted += report.upserted;
        self.matched += report.matched;
        self.failed += report.failed;
        self.last_flush = Some(report);
    }
}

/// Consumes task messages from a channel and writes them to a document store.
#[derive(Clone)]
pub struct DocumentInserter {
    channel: Arc<dyn Channel>,
    store: DocumentStore,
    channel_name: String,
    config: InserterConfig,
}

impl std::fmt::Debug for DocumentInserter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentInserter")
            .field("backend", &self.channel.backend())
            .field("channel", &self.channel_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DocumentInserter {
    /// Creates an inserter for `channel_name`.
    pub fn new(
        channel: Arc<dyn Channel>,
        store: DocumentStore,
        channel_name: impl Into<String>,
        config: InserterConfig,
    ) -> Self {
        Self {
            channel,
            store,
            channel_name: channel_name.into(),
            config,
        }
    }

    /// Subscribes and spawns the listen loop.
    ///
    /// The subscription is established before this returns, so messages
    /// published afterwards are not missed.
    ///
    /// # Errors
    ///
    /// Returns the channel error if the subscription fails.
    pub async fn start(&self) -> Result<InserterHandle, ChannelError> {
        self.channel.subscribe(&self.channel_name).await?;

        let (state_tx, state_rx) = watch::channel(InserterState::Listening);
        let (stats_tx, stats_rx) = watch::channel(InserterStats::default());
        let cancel = CancellationToken::new();

        let mut writer = BufferedWriter {
            store: self.store.clone(),
            config: self.config.clone(),
            buffer: Vec::with_capacity(self.config.max_buffer_size),
            last_flush: Instant::now(),
            state: state_tx,
            stats: stats_tx,
            cancel: cancel.clone(),
        };
        let channel = Arc::clone(&self.channel);
        let channel_name = self.channel_name.clone();
        info!(
            backend = channel.backend(),
            channel = %channel_name,
            max_buffer_size = self.config.max_buffer_size,
            max_flush_interval_ms = self.config.max_flush_interval_ms,
            "inserter listening"
        );

        let task = tokio::spawn(async move {
            let outcome = channel.listen(&mut writer).await;
            writer.state.send_replace(InserterState::Stopping);
            writer.flush().await;
            writer.state.send_replace(InserterState::Stopped);
            match &outcome {
                Ok(reason) => info!(channel = %channel_name, ?reason, "inserter stopped"),
                Err(e) => error!(channel = %channel_name, error = %e, "inserter listen loop failed"),
            }
            outcome
        });

        Ok(InserterHandle {
            channel: Arc::clone(&self.channel),
            channel_name: self.channel_name.clone(),
            cancel,
            state: state_rx,
            stats: stats_rx,
            task,
        })
    }
}

/// Handle to a running inserter.
#[derive(Debug)]
pub struct InserterHandle {
    channel: Arc<dyn Channel>,
    channel_name: String,
    cancel: CancellationToken,
    state: watch::Receiver<InserterState>,
    stats: watch::Receiver<InserterStats>,
    task: JoinHandle<Result<ListenOutcome, ChannelError>>,
}

impl InserterHandle {
    /// Returns the current lifecycle state.
    pub fn state(&self) -> InserterState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<InserterState> {
        self.state.clone()
    }

    /// Returns the current totals.
    pub fn stats(&self) -> InserterStats {
        *self.stats.borrow()
    }

    /// Returns a receiver that observes the totals.
    pub fn subscribe_stats(&self) -> watch::Receiver<InserterStats> {
        self.stats.clone()
    }

    /// Returns `true` once the listen loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the inserter: no new messages are accepted, the buffer is
    /// flushed and the loop exits.
    ///
    /// A control message is published on the channel to wake a listener
    /// blocked on receive. If that publish fails the loop still notices the
    /// stop request on its next idle poll.
    ///
    /// # Errors
    ///
    /// Returns the listen loop's error, if it failed, or
    /// [`FlowError::Join`] if the task panicked.
    pub async fn stop(self) -> Result<InserterStats, FlowError> {
        self.cancel.cancel();
        if let Err(e) = self
            .channel
            .publish(&Envelope::Control(ControlMessage::Stop), &self.channel_name)
            .await
        {
            warn!(error = %e, "could not publish stop message, waiting for idle poll");
        }
        self.join().await
    }

    /// Waits for the loop to end on its own (control message, closed
    /// subscription or fatal error).
    ///
    /// # Errors
    ///
    /// See [`stop`](Self::stop).
    pub async fn join(self) -> Result<InserterStats, FlowError> {
        self.task.await??;
        Ok(*self.stats.borrow())
    }
}

struct BufferedWriter {
    store: DocumentStore,
    config: InserterConfig,
    buffer: Vec<TaskMessage>,
    last_flush: Instant,
    state: watch::Sender<InserterState>,
    stats: watch::Sender<InserterStats>,
    cancel: CancellationToken,
}

impl BufferedWriter {
    fn interval_elapsed(&self) -> bool {
        self.last_flush.elapsed() >= self.config.max_flush_interval()
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
            return;
        }
        let started = Instant::now();
        let previous = self.state.send_replace(InserterState::Flushing);

        let curated = curator::merge(&self.buffer, self.store.correlation_key());
        let mut report = FlushReport {
            received: self.buffer.len(),
            curated: curated.len(),
            dropped: curated.dropped,
            ..FlushReport::default()
        };
        self.buffer.clear();

        if !curated.is_empty() {
            let summary = self.store.upsert_many(UpsertOp::from_curated(curated)).await;
            report.upserted = summary.upserted;
            report.matched = summary.matched;
            report.failed = summary.failed;
            if !summary.is_success() {
                error!(failed = summary.failed, "flush partially failed");
            }
        }
        report.elapsed = started.elapsed();
        debug!(
            received = report.received,
            curated = report.curated,
            dropped = report.dropped,
            upserted = report.upserted,
            matched = report.matched,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "flushed buffer"
        );

        self.stats.send_modify(|stats| stats.record(report));
        self.last_flush = Instant::now();
        self.state.send_replace(previous);
    }
}

#[async_trait]
impl MessageHandler for BufferedWriter {
    async fn on_message(&mut self, message: Inbound) -> bool {
        match message {
            Envelope::Task(task) => {
                self.buffer.push(task);
                let buffered = self.buffer.len();
                self.stats.send_modify(|stats| {
                    stats.received += 1;
                    stats.buffered = buffered;
                });
                if buffered >= self.config.max_buffer_size || self.interval_elapsed() {
                    self.flush().await;
                }
                !self.cancel.is_cancelled()
            },
            Envelope::Control(ControlMessage::Stop) => {
                debug!("received stop message");
                self.state.send_replace(InserterState::Stopping);
                false
            },
        }
    }

    async fn on_idle(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if !self.buffer.is_empty() && self.interval_elapsed() {
            self.flush().await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::local::LocalChannel;
    use crate::config::MqConfig;
    use crate::store::memory::InMemoryBackend;
    use crate::TaskStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const CHANNEL: &str = "interception";

    struct Fixture {
        channel: Arc<LocalChannel>,
        store: DocumentStore,
    }

    impl Fixture {
        fn new() -> Self {
            let channel = Arc::new(LocalChannel::new(&MqConfig {
                poll_timeout_ms: 100,
                ..MqConfig::default()
            }));
            let store = DocumentStore::new(Arc::new(InMemoryBackend::new()), "task_id");
            Self { channel, store }
        }

        async fn start(&self, max_buffer_size: usize, interval: Duration) -> InserterHandle {
            let config = InserterConfig {
                max_buffer_size,
                max_flush_interval_ms: interval.as_millis() as u64,
                stop_grace_ms: 0,
            };
            DocumentInserter::new(self.channel.clone(), self.store.clone(), CHANNEL, config)
                .start()
                .await
                .unwrap()
        }

        async fn publish(&self, message: impl Into<Envelope>) {
            self.channel.publish(&message.into(), CHANNEL).await.unwrap();
        }
    }

    // ---- flush thresholds ----

    #[tokio::test(start_paused = true)]
    async fn test_size_threshold_flushes_once() {
        let fx = Fixture::new();
        let handle = fx.start(5, Duration::from_secs(3600)).await;
        for i in 0..5 {
            fx.publish(TaskMessage::new(format!("t{i}"))).await;
        }

        let mut stats = handle.subscribe_stats();
        let snapshot = *stats.wait_for(|s| s.flushes == 1).await.unwrap();
        assert_eq!(snapshot.buffered, 0);
        assert_eq!(snapshot.last_flush.map(|f| f.received), Some(5));
        assert_eq!(fx.store.count().await.unwrap(), 5);

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_threshold_flushes_single_message() {
        let fx = Fixture::new();
        let started = Instant::now();
        let handle = fx.start(50, Duration::from_secs(2)).await;
        fx.publish(TaskMessage::new("lonely")).await;

        let mut stats = handle.subscribe_stats();
        stats.wait_for(|s| s.flushes == 1).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(fx.store.get("lonely").await.unwrap().is_some());

        handle.stop().await.unwrap();
    }

    // ---- graceful stop ----

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_remainder() {
        let fx = Fixture::new();
        let handle = fx.start(50, Duration::from_secs(3600)).await;
        for i in 0..3 {
            fx.publish(TaskMessage::new(format!("t{i}"))).await;
        }
        handle
            .subscribe_stats()
            .wait_for(|s| s.received == 3)
            .await
            .unwrap();
        assert_eq!(fx.store.count().await.unwrap(), 0);

        let mut state = handle.subscribe_state();
        let stats = handle.stop().await.unwrap();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.upserted, 3);
        assert_eq!(*state.borrow_and_update(), InserterState::Stopped);
        assert_eq!(fx.store.count().await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_message_stops_and_flushes() {
        let fx = Fixture::new();
        let handle = fx.start(50, Duration::from_secs(3600)).await;
        fx.publish(TaskMessage::new("a")).await;
        fx.publish(TaskMessage::new("b")).await;
        fx.publish(ControlMessage::Stop).await;
        fx.publish(TaskMessage::new("after-stop")).await;

        let stats = handle.join().await.unwrap();
        assert_eq!(stats.received, 2);
        assert_eq!(fx.store.count().await.unwrap(), 2);
        assert!(fx.store.get("after-stop").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_messages() {
        let fx = Fixture::new();
        let handle = fx.start(50, Duration::from_secs(1)).await;
        assert_eq!(handle.state(), InserterState::Listening);
        let stats = handle.stop().await.unwrap();
        assert_eq!(stats, InserterStats::default());
    }

    // ---- curation ----

    #[tokio::test(start_paused = true)]
    async fn test_partial_updates_accumulate_across_flushes() {
        let fx = Fixture::new();
        let handle = fx.start(1, Duration::from_secs(3600)).await;
        fx.publish(
            TaskMessage::new("t1")
                .with_status(TaskStatus::Running)
                .with_used("x", json!(1)),
        )
        .await;
        fx.publish(
            TaskMessage::new("t1")
                .with_status(TaskStatus::Finished)
                .with_generated("y", json!(2)),
        )
        .await;
        handle
            .subscribe_stats()
            .wait_for(|s| s.flushes == 2)
            .await
            .unwrap();
        let stats = handle.stop().await.unwrap();
        assert_eq!((stats.upserted, stats.matched), (1, 1));

        let record = fx.store.get("t1").await.unwrap().unwrap();
        assert_eq!(record["status"], "finished");
        assert_eq!(record["used"]["x"], 1);
        assert_eq!(record["generated"]["y"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_without_key_are_dropped() {
        let fx = Fixture::new();
        let handle = fx.start(2, Duration::from_secs(3600)).await;
        fx.publish(TaskMessage::default().with_workflow_id("wf")).await;
        fx.publish(TaskMessage::new("keyed")).await;

        let mut stats = handle.subscribe_stats();
        let snapshot = *stats.wait_for(|s| s.flushes == 1).await.unwrap();
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.upserted, 1);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_correlation_key_is_persisted() {
        let channel = Arc::new(LocalChannel::new(&MqConfig {
            poll_timeout_ms: 100,
            ..MqConfig::default()
        }));
        let store = DocumentStore::new(Arc::new(InMemoryBackend::new()), "run_id");
        let handle = DocumentInserter::new(
            channel.clone(),
            store.clone(),
            CHANNEL,
            InserterConfig {
                max_buffer_size: 50,
                max_flush_interval_ms: 3_600_000,
                stop_grace_ms: 0,
            },
        )
        .start()
        .await
        .unwrap();

        let raw = json!({"task_id": "t1", "run_id": "r1", "used": {"epochs": 5}});
        let bytes = rmp_serde::to_vec_named(&raw).unwrap();
        let Envelope::Task(first) = crate::codec::decode(&bytes).unwrap() else {
            panic!("expected a task message");
        };
        channel.publish(&first.into(), CHANNEL).await.unwrap();
        let second = TaskMessage::new("t2")
            .with_extra("run_id", json!("r1"))
            .with_status(TaskStatus::Finished);
        channel.publish(&second.into(), CHANNEL).await.unwrap();
        channel
            .publish(&ControlMessage::Stop.into(), CHANNEL)
            .await
            .unwrap();

        let stats = handle.join().await.unwrap();
        assert_eq!((stats.received, stats.dropped, stats.upserted), (2, 0, 1));
        assert_eq!(store.count().await.unwrap(), 1);
        let record = store.get("r1").await.unwrap().unwrap();
        assert_eq!(record["task_id"], "t2");
        assert_eq!(record["status"], "finished");
        assert_eq!(record["used"]["epochs"], 5);
    }
}
