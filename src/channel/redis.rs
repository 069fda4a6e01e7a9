//! Redis pub/sub channel backend.
//!
//! Publishing goes through a [`MultiplexedConnection`]; bulk publishes are
//! sent as one pipeline so a batch costs a single round trip. Subscribing
//! opens a dedicated [`PubSub`] connection and pattern-subscribes to the
//! channel name, so `tasks.*` style names also work. Redis only delivers
//! to subscribers connected at publish time; there is no replay after a
//! reconnect.
//!
//! Only `message`/`pmessage` frames reach the listen loop. Subscription
//! confirmations never surface as payloads, so no handler sees them.

use std::time::{Duration, Instant};

use ::redis::aio::{MultiplexedConnection, PubSub};
use ::redis::{Client, RedisError};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::channel::{
    drive, encode_batch, finish_report, log_publish_error, Channel, ListenOutcome,
    MessageHandler, PayloadSource, Poll, PublishReport, ReconnectPolicy,
};
use crate::codec;
use crate::config::MqConfig;
use crate::error::ChannelError;
use crate::message::Envelope;

const BACKEND: &str = "redis";

/// Maps a Redis error onto the channel taxonomy.
///
/// Dropped connections, refusals, IO failures and timeouts are transient;
/// everything else is a protocol error.
fn classify(context: &str, err: RedisError) -> ChannelError {
    if err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_io_error()
        || err.is_timeout()
    {
        ChannelError::connection(BACKEND, format!("{context}: {err}"), err)
    } else {
        ChannelError::Protocol {
            backend: BACKEND,
            message: format!("{context}: {err}"),
        }
    }
}

/// Connection URL for the configured broker.
fn url(config: &MqConfig) -> String {
    format!("redis://{}", config.address())
}

struct Subscription {
    pattern: String,
    pubsub: PubSub,
}

/// Redis pub/sub channel.
pub struct RedisChannel {
    client: Client,
    conn: MultiplexedConnection,
    max_message_bytes: usize,
    poll_timeout: Duration,
    policy: ReconnectPolicy,
    subscription: Mutex<Option<Subscription>>,
}

impl std::fmt::Debug for RedisChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisChannel")
            .field("max_message_bytes", &self.max_message_bytes)
            .field("poll_timeout", &self.poll_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisChannel {
    /// Connects the publishing side. Subscribing opens its own connection.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Connection`] if Redis cannot be reached.
    pub async fn connect(config: &MqConfig) -> Result<Self, ChannelError> {
        let url = url(config);
        let client = Client::open(url.as_str()).map_err(|e| ChannelError::Protocol {
            backend: BACKEND,
            message: format!("invalid Redis URL {url}: {e}"),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| classify("connect", e))?;
        info!(url = %url, "connected to Redis broker");
        Ok(Self {
            client,
            conn,
            max_message_bytes: config.max_message_bytes,
            poll_timeout: config.poll_timeout(),
            policy: config.reconnect_policy(),
            subscription: Mutex::new(None),
        })
    }

    async fn open_subscription(client: &Client, pattern: &str) -> Result<PubSub, ChannelError> {
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| classify("open pubsub", e))?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| classify("psubscribe", e))?;
        Ok(pubsub)
    }
}

#[async_trait]
impl Channel for RedisChannel {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn publish(&self, message: &Envelope, channel: &str) -> Result<usize, ChannelError> {
        let bytes = codec::encode(message, self.max_message_bytes)
            .map_err(|e| log_publish_error(BACKEND, channel, e.into()))?;
        let size = bytes.len();
        let mut conn = self.conn.clone();
        ::redis::cmd("PUBLISH")
            .arg(channel)
            .arg(bytes)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| log_publish_error(BACKEND, channel, classify("publish", e)))?;
        Ok(size)
    }

    async fn publish_bulk(
        &self,
        batch: &[Envelope],
        channel: &str,
    ) -> Result<PublishReport, ChannelError> {
        let started = Instant::now();
        let (payloads, report) = encode_batch(batch, self.max_message_bytes, BACKEND);
        if payloads.is_empty() {
            return Ok(finish_report(BACKEND, channel, report, started));
        }
        let mut pipe = ::redis::pipe();
        for payload in payloads {
            pipe.cmd("PUBLISH").arg(channel).arg(payload).ignore();
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| log_publish_error(BACKEND, channel, classify("bulk publish", e)))?;
        Ok(finish_report(BACKEND, channel, report, started))
    }

    async fn subscribe(&self, channel: &str) -> Result<(), ChannelError> {
        let pubsub = Self::open_subscription(&self.client, channel).await?;
        *self.subscription.lock().await = Some(Subscription {
            pattern: channel.to_string(),
            pubsub,
        });
        debug!(pattern = channel, "subscribed");
        Ok(())
    }

    async fn listen(
        &self,
        handler: &mut dyn MessageHandler,
    ) -> Result<ListenOutcome, ChannelError> {
        let mut guard = self.subscription.lock().await;
        let subscription = guard.as_mut().ok_or(ChannelError::NotSubscribed)?;
        let mut source = RedisSource {
            client: &self.client,
            subscription,
            poll_timeout: self.poll_timeout,
        };
        drive(&mut source, handler, self.policy).await
    }

    async fn liveness_probe(&self) -> bool {
        let mut conn = self.conn.clone();
        match ::redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(reply) => reply == "PONG",
            Err(e) => {
                debug!(error = %e, "Redis liveness probe failed");
                false
            },
        }
    }
}

struct RedisSource<'a> {
    client: &'a Client,
    subscription: &'a mut Subscription,
    poll_timeout: Duration,
}

#[async_trait]
impl PayloadSource for RedisSource<'_> {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn next(&mut self) -> Result<Poll, ChannelError> {
        let mut stream = std::pin::pin!(self.subscription.pubsub.on_message());
        match tokio::time::timeout(self.poll_timeout, stream.next()).await {
            Err(_elapsed) => Ok(Poll::Idle),
            Ok(Some(msg)) => Ok(Poll::Payload(msg.get_payload_bytes().to_vec())),
            // The push stream only ends when the connection goes away.
            Ok(None) => Err(ChannelError::Connection {
                backend: BACKEND,
                message: "pub/sub stream ended".to_string(),
                source: None,
            }),
        }
    }

    async fn reconnect(&mut self) -> Result<(), ChannelError> {
        let pubsub = RedisChannel::open_subscription(self.client, &self.subscription.pattern).await?;
        self.subscription.pubsub = pubsub;
        info!(pattern = %self.subscription.pattern, "re-subscribed to Redis");
        Ok(())
    }
}


#[cfg(all(test, feature = "redis-tests"))]
mod integration_tests {
    use super::*;
    use crate::message::{ControlMessage, Inbound, TaskMessage};

    fn config() -> MqConfig {
        MqConfig {
            poll_timeout_ms: 100,
            ..MqConfig::default()
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
    async fn test_publish_and_listen() {
        let channel = RedisChannel::connect(&config()).await.unwrap();
        let name = format!("flowtrace-test-{}", uuid::Uuid::new_v4());
        channel.subscribe(&name).await.unwrap();
        assert!(channel.liveness_probe().await);

        let batch: Vec<Envelope> = (0..3)
            .map(|i| TaskMessage::new(format!("t{i}")).into())
            .collect();
        let report = channel.publish_bulk(&batch, &name).await.unwrap();
        assert_eq!(report.sent, 3);
        channel.publish(&ControlMessage::Stop.into(), &name).await.unwrap();

        let mut handler = Collect::default();
        let outcome = channel.listen(&mut handler).await.unwrap();
        assert_eq!(outcome, ListenOutcome::Stopped);
        assert_eq!(handler.0.len(), 4);
    }
}
