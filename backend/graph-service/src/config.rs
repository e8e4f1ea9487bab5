use event_schema::topics;
use std::env;

/// Kafka producer settings for follow events
#[derive(Debug, Clone)]
pub struct KafkaProducerConfig {
    pub brokers: String,
    pub client_id: String,
    pub follow_accepted_topic: String,
    pub follow_removed_topic: String,
    /// Delivery timeout for a single record
    pub send_timeout_secs: u64,
}

impl KafkaProducerConfig {
    /// Load configuration from environment variables.
    ///
    /// Returns `None` when Kafka is disabled or no brokers are configured, in
    /// which case follow events are not published.
    pub fn from_env() -> Option<Self> {
        let enabled = env::var("KAFKA_ENABLED")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(true);
        if !enabled {
            return None;
        }

        let brokers = env::var("KAFKA_BOOTSTRAP_SERVERS").ok()?;
        if brokers.trim().is_empty() {
            return None;
        }

        Some(Self {
            brokers,
            client_id: env::var("KAFKA_CLIENT_ID").unwrap_or_else(|_| "graph-service".to_string()),
            follow_accepted_topic: env::var("KAFKA_TOPIC_FOLLOW_ACCEPTED")
                .unwrap_or_else(|_| topics::FOLLOW_ACCEPTED.to_string()),
            follow_removed_topic: env::var("KAFKA_TOPIC_FOLLOW_REMOVED")
                .unwrap_or_else(|_| topics::FOLLOW_REMOVED.to_string()),
            send_timeout_secs: env::var("KAFKA_SEND_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        })
    }

    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            client_id: "graph-service".to_string(),
            follow_accepted_topic: topics::FOLLOW_ACCEPTED.to_string(),
            follow_removed_topic: topics::FOLLOW_REMOVED.to_string(),
            send_timeout_secs: 5,
        }
    }
}
