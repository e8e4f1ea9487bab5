//! Kafka ingestion of social-graph and content lifecycle events
//!
//! | topic             | effect                                                  |
//! |-------------------|---------------------------------------------------------|
//! | `post.created`    | fan-out on write when a service credential is configured |
//! | `post.deleted`    | post removed from every feed                            |
//! | `follow.accepted` | follower's feed marked stale, cache cleared             |
//! | `follow.removed`  | followee's entries purged from follower's feed          |
//!
//! Offsets are auto-committed, so delivery is at-least-once and every
//! handler is idempotent. Malformed payloads are logged and skipped.

use anyhow::Result;
use chrono::Utc;
use event_schema::{
    parse_enveloped_or_direct, FollowAcceptedEvent, PostCreatedEvent, PostDeletedEvent,
    UnfollowEvent,
};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::metrics;
use crate::services::FeedService;

#[derive(Debug, Clone)]
pub enum FeedEvent {
    PostCreated(PostCreatedEvent),
    PostDeleted(PostDeletedEvent),
    FollowAccepted(FollowAcceptedEvent),
    Unfollowed(UnfollowEvent),
}

impl FeedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FeedEvent::PostCreated(_) => "post_created",
            FeedEvent::PostDeleted(_) => "post_deleted",
            FeedEvent::FollowAccepted(_) => "follow_accepted",
            FeedEvent::Unfollowed(_) => "unfollow",
        }
    }
}

/// Decode a message by the topic it arrived on. `Ok(None)` for topics this
/// service does not handle.
pub fn decode_event(
    topics: &KafkaConfig,
    topic: &str,
    payload: &[u8],
) -> std::result::Result<Option<FeedEvent>, serde_json::Error> {
    let event = if topic == topics.post_created_topic {
        FeedEvent::PostCreated(parse_enveloped_or_direct(payload)?)
    } else if topic == topics.post_deleted_topic {
        FeedEvent::PostDeleted(parse_enveloped_or_direct(payload)?)
    } else if topic == topics.follow_accepted_topic {
        FeedEvent::FollowAccepted(parse_enveloped_or_direct(payload)?)
    } else if topic == topics.follow_removed_topic {
        FeedEvent::Unfollowed(parse_enveloped_or_direct(payload)?)
    } else {
        return Ok(None);
    };
    Ok(Some(event))
}

/// Applies decoded events to the feed engine
#[derive(Clone)]
pub struct FeedEventHandler {
    service: Arc<FeedService>,
    /// Credential for upstream calls made on behalf of nobody in particular
    service_token: Option<String>,
}

impl FeedEventHandler {
    pub fn new(service: Arc<FeedService>, service_token: Option<String>) -> Self {
        Self {
            service,
            service_token,
        }
    }

    pub async fn handle(&self, event: FeedEvent) -> crate::error::Result<()> {
        match event {
            FeedEvent::PostCreated(event) => self.handle_post_created(event).await,
            FeedEvent::PostDeleted(event) => {
                let removed = self.service.remove_post_from_all_feeds(&event.post_id).await?;
                info!(post_id = %event.post_id, removed, "Handled post_deleted");
                Ok(())
            }
            FeedEvent::FollowAccepted(event) => {
                self.service.invalidate_feed(event.follower_id).await?;
                info!(
                    follower_id = event.follower_id,
                    following_id = event.following_id,
                    "Handled follow_accepted, feed marked stale"
                );
                Ok(())
            }
            FeedEvent::Unfollowed(event) => {
                let removed = self
                    .service
                    .purge_author(event.follower_id, event.following_id)
                    .await?;
                info!(
                    follower_id = event.follower_id,
                    following_id = event.following_id,
                    removed,
                    "Handled unfollow"
                );
                Ok(())
            }
        }
    }

    async fn handle_post_created(&self, event: PostCreatedEvent) -> crate::error::Result<()> {
        let Some(token) = self.service_token.as_deref() else {
            info!(
                post_id = %event.post_id,
                user_id = event.user_id,
                "No service credential configured, post reaches followers on their next rebuild"
            );
            return Ok(());
        };

        let created_at = event.created_at().unwrap_or_else(|| {
            debug!(post_id = %event.post_id, "post_created without timestamp, using receipt time");
            Utc::now()
        });

        let written = self
            .service
            .add_post_to_followers_feeds(&event.post_id, event.user_id, created_at, Some(token))
            .await?;
        info!(
            post_id = %event.post_id,
            user_id = event.user_id,
            written,
            "Handled post_created"
        );
        Ok(())
    }
}

/// Long-running Kafka consumer for the feed topics
pub struct FeedEventsConsumer {
    consumer: StreamConsumer,
    handler: FeedEventHandler,
    topics: KafkaConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl FeedEventsConsumer {
    pub fn new(
        config: &KafkaConfig,
        handler: FeedEventHandler,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "5000")
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "30000")
            .set("enable.partition.eof", "false")
            .create()?;

        let topics = config.consumed_topics();
        consumer.subscribe(&topics)?;
        info!(
            group = %config.group_id,
            topics = ?topics,
            "Feed events consumer subscribed"
        );

        Ok(Self {
            consumer,
            handler,
            topics: config.clone(),
            shutdown_rx,
        })
    }

    /// Consume until the shutdown signal flips to true. The message being
    /// handled when the signal arrives is finished first.
    pub async fn run(mut self) -> Result<()> {
        info!("Starting feed events consumer loop");

        {
            let mut message_stream = self.consumer.stream();

            loop {
                tokio::select! {
                    changed = self.shutdown_rx.changed() => {
                        if changed.is_err() || *self.shutdown_rx.borrow() {
                            info!("Shutdown signal received, stopping feed events consumer");
                            break;
                        }
                    }

                    message = message_stream.next() => {
                        match message {
                            Some(Ok(msg)) => {
                                let Some(payload) = msg.payload() else {
                                    debug!(topic = msg.topic(), "Empty message payload, skipping");
                                    continue;
                                };
                                process_payload(&self.handler, &self.topics, msg.topic(), payload)
                                    .await;
                            }
                            Some(Err(e)) => {
                                error!(error = %e, "Kafka consumer error");
                            }
                            None => {
                                warn!("Message stream ended unexpectedly");
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.consumer.unsubscribe();
        info!("Feed events consumer stopped");
        Ok(())
    }
}

/// Decode and apply one message. Never fails: bad payloads and handler
/// errors are logged and counted.
pub async fn process_payload(
    handler: &FeedEventHandler,
    topics: &KafkaConfig,
    topic: &str,
    payload: &[u8],
) {
    let event = match decode_event(topics, topic, payload) {
        Ok(Some(event)) => event,
        Ok(None) => {
            debug!(topic = %topic, "Ignoring message from unhandled topic");
            return;
        }
        Err(e) => {
            metrics::record_event_consumed(topic, "malformed");
            warn!(topic = %topic, error = %e, "Failed to parse message payload, skipping");
            return;
        }
    };

    let kind = event.kind();
    match handler.handle(event).await {
        Ok(()) => metrics::record_event_consumed(kind, "success"),
        Err(e) => {
            metrics::record_event_consumed(kind, "error");
            error!(event_type = kind, error = %e, "Failed to handle feed event");
        }
    }
}
