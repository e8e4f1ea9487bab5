pub mod cache;
pub mod clients;
pub mod config;
pub mod consumers;
pub mod db;
pub mod error;
pub mod events;
pub mod handlers;
pub mod jobs;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod services;

pub use cache::{DisabledCache, RedisFeedCache, TimelineCache};
pub use clients::{HttpServiceClient, UpstreamClient};
pub use config::Config;
pub use db::{FeedStore, PgFeedStore};
pub use error::{AppError, Result};
pub use events::{FeedEventPublisher, KafkaFeedEventProducer, NoopEventPublisher};
pub use services::FeedService;
