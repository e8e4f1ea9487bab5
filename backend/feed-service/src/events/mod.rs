//! `feed.updated` emission
//!
//! Notifies downstream consumers (realtime push, notifications) that a post
//! entered or left a user's feed. Delivery is best-effort: the feed engine
//! logs a [`PublishError`] and carries on.

use async_trait::async_trait;
use event_schema::{FeedAction, FeedUpdatedEvent};
use rdkafka::message::OwnedHeaders;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::PublishError;
use crate::metrics;

#[async_trait]
pub trait FeedEventPublisher: Send + Sync {
    async fn publish_feed_updated(
        &self,
        owner_id: i64,
        post_id: &str,
        action: FeedAction,
    ) -> Result<(), PublishError>;
}

/// Kafka producer for feed events, keyed by owner id
#[derive(Clone)]
pub struct KafkaFeedEventProducer {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl KafkaFeedEventProducer {
    pub fn new(brokers: &str, topic: &str) -> Result<Self, PublishError> {
        let producer = rdkafka::config::ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("client.id", "feed-service")
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set("retries", "3")
            .set("linger.ms", "5")
            .create::<FutureProducer>()
            .map_err(|e| PublishError::Kafka(e.to_string()))?;

        info!(brokers = %brokers, topic = %topic, "Feed event producer initialized");

        Ok(Self {
            producer,
            topic: topic.to_string(),
            send_timeout: Duration::from_secs(5),
        })
    }
}

/// Payload and partition key for a `feed.updated` record
pub fn encode_feed_updated(
    owner_id: i64,
    post_id: &str,
    action: FeedAction,
) -> Result<(String, String), PublishError> {
    let event = FeedUpdatedEvent::new(owner_id, post_id, action);
    Ok((owner_id.to_string(), serde_json::to_string(&event)?))
}

#[async_trait]
impl FeedEventPublisher for KafkaFeedEventProducer {
    async fn publish_feed_updated(
        &self,
        owner_id: i64,
        post_id: &str,
        action: FeedAction,
    ) -> Result<(), PublishError> {
        let (key, payload) = encode_feed_updated(owner_id, post_id, action)?;

        let headers = OwnedHeaders::new().insert(rdkafka::message::Header {
            key: "event_type",
            value: Some(FeedUpdatedEvent::EVENT_TYPE),
        });

        let record = FutureRecord::to(&self.topic)
            .key(&key)
            .payload(&payload)
            .headers(headers);

        match self.producer.send(record, self.send_timeout).await {
            Ok(_) => {
                metrics::record_event_published(action.as_str(), "success");
                debug!(
                    owner_id,
                    post_id = %post_id,
                    action = action.as_str(),
                    "Published feed_updated event"
                );
                Ok(())
            }
            Err((err, _)) => {
                metrics::record_event_published(action.as_str(), "error");
                warn!(
                    error = ?err,
                    owner_id,
                    post_id = %post_id,
                    "Failed to publish feed_updated event"
                );
                Err(PublishError::Kafka(err.to_string()))
            }
        }
    }
}

/// Used when Kafka is disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventPublisher;

#[async_trait]
impl FeedEventPublisher for NoopEventPublisher {
    async fn publish_feed_updated(
        &self,
        owner_id: i64,
        post_id: &str,
        action: FeedAction,
    ) -> Result<(), PublishError> {
        debug!(
            owner_id,
            post_id = %post_id,
            action = action.as_str(),
            "Kafka disabled, dropping feed_updated event"
        );
        Ok(())
    }
}
