//! Follow-graph event emission.
//!
//! graph-service owns the follow relationships; the feed pipeline only needs
//! to hear about accepted follows and unfollows, which this crate publishes.

pub mod config;
pub mod events;

pub use config::KafkaProducerConfig;
pub use events::{FollowEventPublisher, KafkaFollowEventProducer};
