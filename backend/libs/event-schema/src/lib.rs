use chrono::{DateTime, Utc};
/// Event schemas shared by the newsfeed pipeline
///
/// Social-graph and content lifecycle events are consumed by feed-service,
/// which in turn emits `feed.updated`. Producers may send payloads bare or
/// wrapped in an [`EventEnvelope`]; consumers accept both.
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

pub mod serde_helpers;

use serde_helpers::{flexible_id, optional_flexible_datetime};

/// Current schema version for all events
pub const SCHEMA_VERSION: u32 = 1;

/// Kafka topic names
pub mod topics {
    pub const POST_CREATED: &str = "post.created";
    pub const POST_DELETED: &str = "post.deleted";
    pub const FOLLOW_ACCEPTED: &str = "follow.accepted";
    pub const FOLLOW_REMOVED: &str = "follow.removed";
    pub const FEED_UPDATED: &str = "feed.updated";
}

/// Base event envelope for Kafka messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Unique event ID for idempotency and tracing
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub schema_version: u32,
    /// Source service that generated the event
    pub source: String,
    /// Event type, mirrored into the `event_type` Kafka header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub data: T,
}

impl<T> EventEnvelope<T> {
    pub fn new(source: impl Into<String>, data: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
            source: source.into(),
            event_type: None,
            correlation_id: None,
            data,
        }
    }

    pub fn new_with_type(
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: T,
    ) -> Self {
        let mut envelope = Self::new(source, data);
        envelope.event_type = Some(event_type.into());
        envelope
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Decode a payload that is either wrapped in an [`EventEnvelope`] or sent bare.
pub fn parse_enveloped_or_direct<T: DeserializeOwned>(
    payload: &[u8],
) -> Result<T, serde_json::Error> {
    match serde_json::from_slice::<EventEnvelope<T>>(payload) {
        Ok(envelope) => Ok(envelope.data),
        Err(_) => serde_json::from_slice::<T>(payload),
    }
}

// ============================================================================
// CONTENT EVENTS
// ============================================================================

/// Snapshot of the post embedded by some producers of `post.created`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostSnapshot {
    #[serde(default, with = "optional_flexible_datetime")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostCreatedEvent {
    pub post_id: String,
    #[serde(with = "flexible_id")]
    pub user_id: i64,
    #[serde(default, with = "optional_flexible_datetime")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub post_data: Option<PostSnapshot>,
}

impl PostCreatedEvent {
    /// Creation time of the post: the event timestamp, else the embedded snapshot's.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .or_else(|| self.post_data.as_ref().and_then(|p| p.created_at))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostDeletedEvent {
    pub post_id: String,
    #[serde(default, with = "serde_helpers::optional_flexible_id")]
    pub user_id: Option<i64>,
}

// ============================================================================
// GRAPH EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowAcceptedEvent {
    #[serde(with = "flexible_id")]
    pub follower_id: i64,
    #[serde(with = "flexible_id")]
    pub following_id: i64,
    #[serde(default, with = "optional_flexible_datetime")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnfollowEvent {
    #[serde(with = "flexible_id")]
    pub follower_id: i64,
    #[serde(with = "flexible_id")]
    pub following_id: i64,
    #[serde(default, with = "optional_flexible_datetime")]
    pub timestamp: Option<DateTime<Utc>>,
}

// ============================================================================
// FEED EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedAction {
    Added,
    Removed,
}

impl FeedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedAction::Added => "added",
            FeedAction::Removed => "removed",
        }
    }
}

/// Notification that a post entered or left a user's feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedUpdatedEvent {
    pub event_type: String,
    pub user_id: i64,
    pub post_id: String,
    pub action: FeedAction,
}

impl FeedUpdatedEvent {
    pub const EVENT_TYPE: &'static str = "feed_updated";

    pub fn new(user_id: i64, post_id: impl Into<String>, action: FeedAction) -> Self {
        Self {
            event_type: Self::EVENT_TYPE.to_string(),
            user_id,
            post_id: post_id.into(),
            action,
        }
    }
}
