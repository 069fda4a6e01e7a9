//! Kafka channel backend.
//!
//! The channel name is the topic. Producers use a [`FutureProducer`];
//! the listener is a [`StreamConsumer`] in the configured consumer group,
//! starting from the earliest offset the group has not yet committed.
//! Offsets are auto-committed, so delivery is at-least-once and a restarted
//! consumer may see a short tail of already-processed messages again. The
//! document store's upsert makes those repeats harmless.
//!
//! librdkafka reconnects to brokers on its own; the reconnect step here
//! only re-issues the topic subscription.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::metadata::Metadata;
use rdkafka::producer::{FutureProducer, FutureRecord};
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

const BACKEND: &str = "kafka";

/// How long a single produce may wait in the local queue.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata request timeout of the liveness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn producer_config(config: &MqConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.address())
        .set("message.timeout.ms", "5000");
    client
}

fn consumer_config(config: &MqConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.address())
        .set("group.id", &config.consumer_group)
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "true")
        .set("enable.partition.eof", "false");
    client
}

fn is_transient_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::BrokerNotAvailable
            | RDKafkaErrorCode::LeaderNotAvailable
    )
}

/// Maps a Kafka error onto the channel taxonomy.
fn classify(context: &str, err: KafkaError) -> ChannelError {
    let transient = err.rdkafka_error_code().is_some_and(is_transient_code);
    if transient {
        ChannelError::connection(BACKEND, format!("{context}: {err}"), err)
    } else {
        ChannelError::Protocol {
            backend: BACKEND,
            message: format!("{context}: {err}"),
        }
    }
}

/// Kafka channel.
pub struct KafkaChannel {
    producer: FutureProducer,
    consumer: StreamConsumer,
    max_message_bytes: usize,
    poll_timeout: Duration,
    policy: ReconnectPolicy,
    probe_topic: String,
    topic: Mutex<Option<String>>,
}

impl std::fmt::Debug for KafkaChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaChannel")
            .field("max_message_bytes", &self.max_message_bytes)
            .field("poll_timeout", &self.poll_timeout)
            .finish_non_exhaustive()
    }
}

impl KafkaChannel {
    /// Creates the producer and the group consumer.
    ///
    /// No network traffic happens here; an unreachable broker surfaces on
    /// the first publish or poll.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Protocol`] if librdkafka rejects the client
    /// configuration.
    pub fn connect(config: &MqConfig) -> Result<Self, ChannelError> {
        let producer: FutureProducer = producer_config(config)
            .create()
            .map_err(|e| classify("create producer", e))?;
        let consumer: StreamConsumer = consumer_config(config)
            .create()
            .map_err(|e| classify("create consumer", e))?;
        info!(
            brokers = %config.address(),
            group_id = %config.consumer_group,
            "Kafka clients created"
        );
        Ok(Self {
            producer,
            consumer,
            max_message_bytes: config.max_message_bytes,
            poll_timeout: config.poll_timeout(),
            policy: config.reconnect_policy(),
            probe_topic: config.channel.clone(),
            topic: Mutex::new(None),
        })
    }

    /// Topic the liveness probe looks up: the subscribed one, else the
    /// configured channel.
    async fn probe_target(&self) -> String {
        match self.topic.lock().await.as_deref() {
            Some(subscribed) => subscribed.to_string(),
            None => self.probe_topic.clone(),
        }
    }

    async fn send(&self, topic: &str, payload: &[u8]) -> Result<(), ChannelError> {
        let record = FutureRecord::<(), _>::to(topic).payload(payload);
        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| classify("produce", e))
    }
}

#[async_trait]
impl Channel for KafkaChannel {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn publish(&self, message: &Envelope, channel: &str) -> Result<usize, ChannelError> {
        let bytes = codec::encode(message, self.max_message_bytes)
            .map_err(|e| log_publish_error(BACKEND, channel, e.into()))?;
        self.send(channel, &bytes)
            .await
            .map_err(|e| log_publish_error(BACKEND, channel, e))?;
        Ok(bytes.len())
    }

    async fn publish_bulk(
        &self,
        batch: &[Envelope],
        channel: &str,
    ) -> Result<PublishReport, ChannelError> {
        let started = Instant::now();
        let (payloads, report) = encode_batch(batch, self.max_message_bytes, BACKEND);
        let results =
            futures::future::join_all(payloads.iter().map(|p| self.send(channel, p))).await;
        // Every record is already queued; report the first delivery failure.
        if let Some(err) = results.into_iter().find_map(Result::err) {
            return Err(log_publish_error(BACKEND, channel, err));
        }
        Ok(finish_report(BACKEND, channel, report, started))
    }

    async fn subscribe(&self, channel: &str) -> Result<(), ChannelError> {
        self.consumer
            .subscribe(&[channel])
            .map_err(|e| classify("subscribe", e))?;
        *self.topic.lock().await = Some(channel.to_string());
        debug!(topic = channel, "subscribed");
        Ok(())
    }

    async fn listen(
        &self,
        handler: &mut dyn MessageHandler,
    ) -> Result<ListenOutcome, ChannelError> {
        let guard = self.topic.lock().await;
        let topic = guard.as_deref().ok_or(ChannelError::NotSubscribed)?;
        let mut source = KafkaSource {
            consumer: &self.consumer,
            topic,
            poll_timeout: self.poll_timeout,
        };
        drive(&mut source, handler, self.policy).await
    }

    async fn liveness_probe(&self) -> bool {
        let topic = self.probe_target().await;
        let producer = self.producer.clone();
        let lookup = topic.clone();
        let probe = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(&lookup), PROBE_TIMEOUT)
                .map(|metadata| topic_listed(&metadata, &lookup))
        })
        .await;
        match probe {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                debug!(topic = %topic, "Kafka liveness probe: topic not found");
                false
            },
            Ok(Err(e)) => {
                debug!(error = %e, "Kafka liveness probe failed");
                false
            },
            Err(e) => {
                debug!(error = %e, "Kafka liveness probe task failed");
                false
            },
        }
    }
}

/// Returns `true` if `topic` is present in the metadata without an error.
fn topic_listed(metadata: &Metadata, topic: &str) -> bool {
    metadata
        .topics()
        .iter()
        .any(|t| t.name() == topic && t.error().is_none())
}

struct KafkaSource<'a> {
    consumer: &'a StreamConsumer,
    topic: &'a str,
    poll_timeout: Duration,
}

#[async_trait]
impl PayloadSource for KafkaSource<'_> {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn next(&mut self) -> Result<Poll, ChannelError> {
        match tokio::time::timeout(self.poll_timeout, self.consumer.recv()).await {
            Err(_elapsed) => Ok(Poll::Idle),
            Ok(Ok(message)) => match message.payload() {
                Some(payload) => Ok(Poll::Payload(payload.to_vec())),
                None => Ok(Poll::Idle),
            },
            Ok(Err(KafkaError::PartitionEOF(_))) => Ok(Poll::Idle),
            Ok(Err(e)) => Err(classify("consume", e)),
        }
    }

    async fn reconnect(&mut self) -> Result<(), ChannelError> {
        self.consumer
            .subscribe(&[self.topic])
            .map_err(|e| classify("resubscribe", e))?;
        info!(topic = self.topic, "re-subscribed to Kafka topic");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MqConfig {
        MqConfig {
            host: "broker".to_string(),
            port: 9092,
            consumer_group: "ingest".to_string(),
            ..MqConfig::default()
        }
    }

    #[test]
    fn producer_config_points_at_broker() {
        let client = producer_config(&config());
        assert_eq!(client.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(client.get("message.timeout.ms"), Some("5000"));
    }

    #[test]
    fn consumer_config_joins_group_from_earliest() {
        let client = consumer_config(&config());
        assert_eq!(client.get("group.id"), Some("ingest"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client.get("enable.auto.commit"), Some("true"));
    }

    #[test]
    fn broker_outages_are_transient() {
        let err = classify(
            "consume",
            KafkaError::MessageConsumption(RDKafkaErrorCode::AllBrokersDown),
        );
        assert!(err.is_transient());
    }

    #[test]
    fn unknown_topic_is_not_transient() {
        let err = classify(
            "consume",
            KafkaError::MessageConsumption(RDKafkaErrorCode::UnknownTopicOrPartition),
        );
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn probe_looks_up_the_channel_topic() {
        let channel = KafkaChannel::connect(&MqConfig {
            channel: "telemetry".to_string(),
            ..config()
        })
        .unwrap();
        assert_eq!(channel.probe_target().await, "telemetry");

        channel.subscribe("telemetry-replay").await.unwrap();
        assert_eq!(channel.probe_target().await, "telemetry-replay");
    }
}
