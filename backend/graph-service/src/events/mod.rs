//! Kafka producer for follow-graph events
//!
//! Publishes `follow.accepted` and `follow.removed`, keyed by follower id so
//! every event about one follower lands on the same partition.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use event_schema::{EventEnvelope, FollowAcceptedEvent, UnfollowEvent};
use rdkafka::message::OwnedHeaders;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::KafkaProducerConfig;

pub const FOLLOW_ACCEPTED_EVENT: &str = "follow_accepted";
pub const UNFOLLOW_EVENT: &str = "unfollow";

const SOURCE: &str = "graph-service";

/// Publisher of follow relationship changes.
///
/// Callers treat publishing as best-effort: the follow itself has already
/// been committed when these are called.
#[async_trait]
pub trait FollowEventPublisher: Send + Sync {
    async fn publish_follow_accepted(&self, follower_id: i64, following_id: i64) -> Result<()>;

    async fn publish_unfollow(&self, follower_id: i64, following_id: i64) -> Result<()>;
}

/// A record ready to hand to the producer
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRecord {
    pub topic: String,
    pub key: String,
    pub event_type: &'static str,
    pub payload: String,
}

fn encode<T: Serialize>(
    topic: &str,
    event_type: &'static str,
    follower_id: i64,
    data: T,
) -> Result<OutgoingRecord> {
    let envelope =
        EventEnvelope::new_with_type(SOURCE, event_type, data).with_correlation_id(Uuid::new_v4());

    Ok(OutgoingRecord {
        topic: topic.to_string(),
        key: follower_id.to_string(),
        event_type,
        payload: serde_json::to_string(&envelope)?,
    })
}

pub fn follow_accepted_record(
    config: &KafkaProducerConfig,
    follower_id: i64,
    following_id: i64,
) -> Result<OutgoingRecord> {
    encode(
        &config.follow_accepted_topic,
        FOLLOW_ACCEPTED_EVENT,
        follower_id,
        FollowAcceptedEvent {
            follower_id,
            following_id,
            timestamp: Some(Utc::now()),
        },
    )
}

pub fn unfollow_record(
    config: &KafkaProducerConfig,
    follower_id: i64,
    following_id: i64,
) -> Result<OutgoingRecord> {
    encode(
        &config.follow_removed_topic,
        UNFOLLOW_EVENT,
        follower_id,
        UnfollowEvent {
            follower_id,
            following_id,
            timestamp: Some(Utc::now()),
        },
    )
}

#[derive(Clone)]
pub struct KafkaFollowEventProducer {
    producer: FutureProducer,
    config: KafkaProducerConfig,
}

impl KafkaFollowEventProducer {
    pub fn new(config: KafkaProducerConfig) -> Result<Self> {
        let producer = rdkafka::config::ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set("retries", "3")
            .set("linger.ms", "5")
            .create::<FutureProducer>()?;

        info!(
            brokers = %config.brokers,
            accepted_topic = %config.follow_accepted_topic,
            removed_topic = %config.follow_removed_topic,
            "Follow event producer initialized"
        );

        Ok(Self { producer, config })
    }

    async fn send(&self, record: OutgoingRecord) -> Result<()> {
        let headers = OwnedHeaders::new().insert(rdkafka::message::Header {
            key: "event_type",
            value: Some(record.event_type),
        });

        let kafka_record = FutureRecord::to(&record.topic)
            .key(&record.key)
            .payload(&record.payload)
            .headers(headers);

        let timeout = Duration::from_secs(self.config.send_timeout_secs);
        match self.producer.send(kafka_record, timeout).await {
            Ok(_) => {
                info!(
                    event_type = record.event_type,
                    topic = %record.topic,
                    partition_key = %record.key,
                    "Published follow event"
                );
                Ok(())
            }
            Err((err, _)) => {
                warn!(
                    error = ?err,
                    event_type = record.event_type,
                    topic = %record.topic,
                    "Failed to publish follow event"
                );
                Err(anyhow::anyhow!("Failed to publish follow event: {}", err))
            }
        }
    }
}

#[async_trait]
impl FollowEventPublisher for KafkaFollowEventProducer {
    async fn publish_follow_accepted(&self, follower_id: i64, following_id: i64) -> Result<()> {
        let record = follow_accepted_record(&self.config, follower_id, following_id)?;
        self.send(record).await
    }

    async fn publish_unfollow(&self, follower_id: i64, following_id: i64) -> Result<()> {
        let record = unfollow_record(&self.config, follower_id, following_id)?;
        self.send(record).await
    }
}
