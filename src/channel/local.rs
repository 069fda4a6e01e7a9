//! In-process channel backend.
//!
//! [`LocalChannel`] is a pub/sub bus over `tokio::sync::broadcast`: one
//! sender per channel name, created on first use. Like a networked pub/sub
//! broker it delivers only to subscribers present at publish time, and a
//! subscriber that falls more than `local_capacity` messages behind loses
//! the oldest ones (logged as lag).
//!
//! Share one `Arc<LocalChannel>` between producers and the inserter; the
//! subscription belongs to the instance, so there is one listener per
//! instance.
//!
//! # Examples
//!
//! ```
//! use flowtrace::channel::local::LocalChannel;
//! use flowtrace::channel::Channel;
//! use flowtrace::config::MqConfig;
//! use flowtrace::TaskMessage;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let channel = LocalChannel::new(&MqConfig::default());
//! channel.subscribe("interception").await.unwrap();
//! let sent = channel
//!     .publish(&TaskMessage::new("t1").into(), "interception")
//!     .await
//!     .unwrap();
//! assert!(sent > 0);
//! assert!(channel.liveness_probe().await);
//! # }
//! ```

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::channel::{
    drive, encode_batch, finish_report, ListenOutcome, MessageHandler, PayloadSource, Poll,
    PublishReport, ReconnectPolicy,
};
use crate::codec;
use crate::config::MqConfig;
use crate::error::ChannelError;
use crate::message::Envelope;

const BACKEND: &str = "local";

struct Subscription {
    channel: String,
    receiver: broadcast::Receiver<Vec<u8>>,
}

/// In-process broadcast channel.
pub struct LocalChannel {
    topics: DashMap<String, broadcast::Sender<Vec<u8>>>,
    capacity: usize,
    max_message_bytes: usize,
    poll_timeout: Duration,
    policy: ReconnectPolicy,
    subscription: Mutex<Option<Subscription>>,
}

impl std::fmt::Debug for LocalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChannel")
            .field("channels", &self.topics.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl LocalChannel {
    /// Creates a bus using the capacity, size limit and poll timeout from
    /// `config`.
    pub fn new(config: &MqConfig) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: config.local_capacity.max(1),
            max_message_bytes: config.max_message_bytes,
            poll_timeout: config.poll_timeout(),
            policy: config.reconnect_policy(),
            subscription: Mutex::new(None),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    fn send(&self, channel: &str, payload: Vec<u8>) {
        // No receivers is not an error for pub/sub: the message is dropped.
        if self.sender(channel).send(payload).is_err() {
            debug!(channel, "no subscribers, message dropped");
        }
    }
}

#[async_trait]
impl crate::channel::Channel for LocalChannel {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn publish(&self, message: &Envelope, channel: &str) -> Result<usize, ChannelError> {
        let bytes = codec::encode(message, self.max_message_bytes)
            .map_err(|e| crate::channel::log_publish_error(BACKEND, channel, e.into()))?;
        let size = bytes.len();
        self.send(channel, bytes);
        Ok(size)
    }

    async fn publish_bulk(
        &self,
        batch: &[Envelope],
        channel: &str,
    ) -> Result<PublishReport, ChannelError> {
        let started = Instant::now();
        let (payloads, report) = encode_batch(batch, self.max_message_bytes, BACKEND);
        for payload in payloads {
            self.send(channel, payload);
        }
        Ok(finish_report(BACKEND, channel, report, started))
    }

    async fn subscribe(&self, channel: &str) -> Result<(), ChannelError> {
        let receiver = self.sender(channel).subscribe();
        *self.subscription.lock().await = Some(Subscription {
            channel: channel.to_string(),
            receiver,
        });
        debug!(channel, "subscribed");
        Ok(())
    }

    async fn listen(
        &self,
        handler: &mut dyn MessageHandler,
    ) -> Result<ListenOutcome, ChannelError> {
        let mut guard = self.subscription.lock().await;
        let subscription = guard.as_mut().ok_or(ChannelError::NotSubscribed)?;
        let mut source = LocalSource {
            subscription,
            poll_timeout: self.poll_timeout,
        };
        drive(&mut source, handler, self.policy).await
    }

    async fn liveness_probe(&self) -> bool {
        true
    }
}

struct LocalSource<'a> {
    subscription: &'a mut Subscription,
    poll_timeout: Duration,
}

#[async_trait]
impl PayloadSource for LocalSource<'_> {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn next(&mut self) -> Result<Poll, ChannelError> {
        match tokio::time::timeout(self.poll_timeout, self.subscription.receiver.recv()).await {
            Err(_elapsed) => Ok(Poll::Idle),
            Ok(Ok(payload)) => Ok(Poll::Payload(payload)),
            Ok(Err(RecvError::Lagged(missed))) => {
                warn!(
                    channel = %self.subscription.channel,
                    missed,
                    "subscriber lagged, oldest messages lost"
                );
                Ok(Poll::Idle)
            },
            Ok(Err(RecvError::Closed)) => Ok(Poll::Closed),
        }
    }

    async fn reconnect(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }
}
