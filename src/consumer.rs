//! Start/stop facade over the buffered inserter.
//!
//! [`Consumer`] owns at most one running [`InserterHandle`]. Starting an
//! already running consumer, or stopping a stopped one, logs a warning and
//! does nothing, so shutdown hooks can call [`Consumer::stop`] without
//! tracking state themselves.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::channel::{self, Channel};
use crate::config::FlowConfig;
use crate::error::{ChannelError, FlowError};
use crate::inserter::{DocumentInserter, InserterHandle, InserterState, InserterStats};
use crate::store::DocumentStore;

/// Idempotent lifecycle wrapper around a [`DocumentInserter`].
#[derive(Debug)]
pub struct Consumer {
    inserter: DocumentInserter,
    stop_grace: Duration,
    running: Mutex<Option<InserterHandle>>,
}

impl Consumer {
    /// Wraps an inserter; `stop_grace` is waited before signalling stop so
    /// in-flight producer messages can still arrive.
    pub fn new(inserter: DocumentInserter, stop_grace: Duration) -> Self {
        Self {
            inserter,
            stop_grace,
            running: Mutex::new(None),
        }
    }

    /// Builds the channel, the store and the inserter from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError`] if the broker or the store cannot be reached.
    pub async fn from_config(config: &FlowConfig) -> Result<Self, FlowError> {
        let channel: Arc<dyn Channel> = channel::connect(&config.mq).await?;
        let store = DocumentStore::open(&config.db).await?;
        let inserter = DocumentInserter::new(
            channel,
            store,
            config.mq.channel.clone(),
            config.inserter.clone(),
        );
        Ok(Self::new(inserter, config.inserter.stop_grace()))
    }

    /// Starts listening. Returns `false` if already running.
    ///
    /// A previous run that ended on its own (control message or fatal
    /// error) does not count as running.
    ///
    /// # Errors
    ///
    /// Returns the channel error if the subscription fails.
    pub async fn start(&self) -> Result<bool, ChannelError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!("consumer already started");
            return Ok(false);
        }
        *running = Some(self.inserter.start().await?);
        info!("consumer started");
        Ok(true)
    }

    /// Stops the inserter after the grace period and waits for its final
    /// flush. Returns `None` if it was not running.
    ///
    /// A run that already ended on its own is only joined: no grace period
    /// and no stop message, which would also stop other listeners sharing
    /// the channel.
    ///
    /// # Errors
    ///
    /// Returns the listen loop's error if it had failed.
    pub async fn stop(&self) -> Result<Option<InserterStats>, FlowError> {
        let Some(handle) = self.running.lock().await.take() else {
            warn!("consumer already stopped");
            return Ok(None);
        };
        let stats = if handle.state() == InserterState::Stopped {
            handle.join().await?
        } else {
            tokio::time::sleep(self.stop_grace).await;
            handle.stop().await?
        };
        info!(
            flushes = stats.flushes,
            upserted = stats.upserted,
            matched = stats.matched,
            failed = stats.failed,
            "consumer stopped"
        );
        Ok(Some(stats))
    }

    /// Resolves once the current run has ended, whether through
    /// [`stop`](Self::stop), a control message or a fatal listen error.
    /// Resolves immediately if nothing is running.
    pub async fn finished(&self) {
        let state = self
            .running
            .lock()
            .await
            .as_ref()
            .map(InserterHandle::subscribe_state);
        if let Some(mut state) = state {
            // A dropped sender means the task is gone as well.
            let _ = state.wait_for(|s| *s == InserterState::Stopped).await;
        }
    }

    /// Returns the inserter state, [`InserterState::Stopped`] if not started.
    pub async fn state(&self) -> InserterState {
        self.running
            .lock()
            .await
            .as_ref()
            .map_or(InserterState::Stopped, InserterHandle::state)
    }

    /// Returns the running totals of the current run, if any.
    pub async fn stats(&self) -> Option<InserterStats> {
        self.running.lock().await.as_ref().map(InserterHandle::stats)
    }
}
