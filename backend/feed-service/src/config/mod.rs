use event_schema::topics;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tracing filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,actix_web=info";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub upstream: UpstreamConfig,
    pub auth: AuthConfig,
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub env: String,
    pub host: String,
    pub port: u16,
    /// Mounts the internal debug routes when true
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub enabled: bool,
    pub url: String,
    /// TTL of a cached feed, in seconds
    pub feed_ttl_secs: u64,
    /// Upper bound on entries kept in one cached feed
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub enabled: bool,
    pub bootstrap_servers: String,
    pub group_id: String,
    pub post_created_topic: String,
    pub post_deleted_topic: String,
    pub follow_accepted_topic: String,
    pub follow_removed_topic: String,
    pub feed_updated_topic: String,
}

impl KafkaConfig {
    pub fn consumed_topics(&self) -> Vec<&str> {
        vec![
            self.post_created_topic.as_str(),
            self.post_deleted_topic.as_str(),
            self.follow_accepted_topic.as_str(),
            self.follow_removed_topic.as_str(),
        ]
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bootstrap_servers: default_kafka_bootstrap_servers(),
            group_id: default_kafka_group_id(),
            post_created_topic: topics::POST_CREATED.to_string(),
            post_deleted_topic: topics::POST_DELETED.to_string(),
            follow_accepted_topic: topics::FOLLOW_ACCEPTED.to_string(),
            follow_removed_topic: topics::FOLLOW_REMOVED.to_string(),
            feed_updated_topic: topics::FEED_UPDATED.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub auth_service_url: String,
    pub post_service_url: String,
    pub graph_service_url: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Parallel post lookups per batch
    pub max_concurrent_requests: usize,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            auth_service_url: "http://localhost:8001".to_string(),
            post_service_url: "http://localhost:8002".to_string(),
            graph_service_url: "http://localhost:8003".to_string(),
            timeout_secs: 10,
            connect_timeout_secs: 5,
            max_concurrent_requests: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_algorithm: String,
    /// Delegate bearer verification to the auth service instead of checking locally
    pub verify_remote: bool,
    /// Credential used by background paths (event ingestion) to call upstreams
    #[serde(skip_serializing)]
    pub service_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
    /// Authors with more followers than this are not fanned out on write
    pub celebrity_follower_threshold: u64,
    pub max_items_per_user: usize,
    /// Followees considered when rebuilding a feed
    pub rebuild_max_following: usize,
    /// Recent posts pulled per followee during a rebuild
    pub rebuild_posts_per_user: u32,
    pub rebuild_concurrency: usize,
    /// Follower caches updated in parallel during fan-out
    pub fanout_cache_concurrency: usize,
    pub trim_interval_secs: u64,
    pub trim_batch_size: i64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
            celebrity_follower_threshold: 100_000,
            max_items_per_user: 500,
            rebuild_max_following: 100,
            rebuild_posts_per_user: 10,
            rebuild_concurrency: 10,
            fanout_cache_concurrency: 32,
            trim_interval_secs: 600,
            trim_batch_size: 100,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let upstream_defaults = UpstreamConfig::default();
        let feed_defaults = FeedConfig::default();
        let kafka_defaults = KafkaConfig::default();

        Ok(Config {
            app: AppConfig {
                env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
                host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("PORT")
                    .unwrap_or_else(|_| "8004".to_string())
                    .parse()?,
                debug: env_flag("DEBUG", false),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")?,
                max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "20".to_string())
                    .parse()?,
            },
            redis: RedisConfig {
                enabled: env_flag("REDIS_ENABLED", true),
                url: std::env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379/1".to_string()),
                feed_ttl_secs: env_parse("FEED_CACHE_TTL", 300)?,
                max_entries: env_parse("CACHE_MAX_ENTRIES", feed_defaults.max_items_per_user)?,
            },
            kafka: KafkaConfig {
                enabled: env_flag("KAFKA_ENABLED", true),
                bootstrap_servers: std::env::var("KAFKA_BOOTSTRAP_SERVERS")
                    .unwrap_or_else(|_| kafka_defaults.bootstrap_servers.clone()),
                group_id: std::env::var("KAFKA_CONSUMER_GROUP")
                    .unwrap_or_else(|_| kafka_defaults.group_id.clone()),
                post_created_topic: std::env::var("KAFKA_TOPIC_POST_CREATED")
                    .unwrap_or(kafka_defaults.post_created_topic),
                post_deleted_topic: std::env::var("KAFKA_TOPIC_POST_DELETED")
                    .unwrap_or(kafka_defaults.post_deleted_topic),
                follow_accepted_topic: std::env::var("KAFKA_TOPIC_FOLLOW_ACCEPTED")
                    .unwrap_or(kafka_defaults.follow_accepted_topic),
                follow_removed_topic: std::env::var("KAFKA_TOPIC_FOLLOW_REMOVED")
                    .unwrap_or(kafka_defaults.follow_removed_topic),
                feed_updated_topic: std::env::var("KAFKA_TOPIC_FEED_UPDATED")
                    .unwrap_or(kafka_defaults.feed_updated_topic),
            },
            upstream: UpstreamConfig {
                auth_service_url: std::env::var("AUTH_SERVICE_URL")
                    .unwrap_or(upstream_defaults.auth_service_url),
                post_service_url: std::env::var("POST_SERVICE_URL")
                    .unwrap_or(upstream_defaults.post_service_url),
                graph_service_url: std::env::var("GRAPH_SERVICE_URL")
                    .unwrap_or(upstream_defaults.graph_service_url),
                timeout_secs: env_parse("UPSTREAM_TIMEOUT_SECS", upstream_defaults.timeout_secs)?,
                connect_timeout_secs: env_parse(
                    "UPSTREAM_CONNECT_TIMEOUT_SECS",
                    upstream_defaults.connect_timeout_secs,
                )?,
                max_concurrent_requests: env_parse(
                    "UPSTREAM_MAX_CONCURRENT_REQUESTS",
                    upstream_defaults.max_concurrent_requests,
                )?,
            },
            auth: AuthConfig {
                jwt_secret: std::env::var("JWT_SECRET_KEY")
                    .unwrap_or_else(|_| "your-secret-key-change-in-production".to_string()),
                jwt_algorithm: std::env::var("JWT_ALGORITHM")
                    .unwrap_or_else(|_| "HS256".to_string()),
                verify_remote: env_flag("AUTH_VERIFY_REMOTE", false),
                service_token: std::env::var("SERVICE_AUTH_TOKEN")
                    .ok()
                    .filter(|t| !t.trim().is_empty()),
            },
            feed: FeedConfig {
                default_page_size: env_parse("DEFAULT_PAGE_SIZE", feed_defaults.default_page_size)?,
                max_page_size: env_parse("MAX_PAGE_SIZE", feed_defaults.max_page_size)?,
                celebrity_follower_threshold: env_parse(
                    "CELEBRITY_FOLLOWER_THRESHOLD",
                    feed_defaults.celebrity_follower_threshold,
                )?,
                max_items_per_user: env_parse(
                    "MAX_FEED_ITEMS_PER_USER",
                    feed_defaults.max_items_per_user,
                )?,
                rebuild_max_following: env_parse(
                    "REBUILD_MAX_FOLLOWING",
                    feed_defaults.rebuild_max_following,
                )?,
                rebuild_posts_per_user: env_parse(
                    "REBUILD_POSTS_PER_USER",
                    feed_defaults.rebuild_posts_per_user,
                )?,
                rebuild_concurrency: env_parse(
                    "REBUILD_CONCURRENCY",
                    feed_defaults.rebuild_concurrency,
                )?,
                fanout_cache_concurrency: env_parse(
                    "FANOUT_CACHE_CONCURRENCY",
                    feed_defaults.fanout_cache_concurrency,
                )?,
                trim_interval_secs: env_parse(
                    "FEED_TRIM_INTERVAL_SECS",
                    feed_defaults.trim_interval_secs,
                )?,
                trim_batch_size: env_parse("FEED_TRIM_BATCH_SIZE", feed_defaults.trim_batch_size)?,
            },
        })
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().to_ascii_lowercase().parse::<bool>().ok())
        .unwrap_or(default)
}

fn env_parse<T>(key: &str, default: T) -> Result<T, Box<dyn std::error::Error>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + 'static,
{
    match std::env::var(key) {
        Ok(raw) => Ok(raw.trim().parse::<T>()?),
        Err(_) => Ok(default),
    }
}

fn default_kafka_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_kafka_group_id() -> String {
    "newsfeed-service".to_string()
}
