//! Redis projection of per-user feeds
//!
//! Each cached feed is a sorted set of post ids scored by post creation time
//! (epoch seconds):
//! - key: `feed:{owner_id}`
//! - TTL: `FEED_CACHE_TTL` (5 minutes by default)
//! - size: capped at `CACHE_MAX_ENTRIES`, lowest scores trimmed first
//!
//! Every operation returns a [`CacheError`]; the feed engine treats any error
//! as a miss.

use crate::config::RedisConfig;
use crate::error::CacheError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::{debug, warn};

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Adds a member only when the feed is already cached, so a lone fan-out
/// write never masquerades as a complete cached feed. TTL is left alone.
const MIRROR_ENTRY_SCRIPT: &str = r#"
    if redis.call('EXISTS', KEYS[1]) == 0 then
        return 0
    end
    redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
    redis.call('ZREMRANGEBYRANK', KEYS[1], 0, -(tonumber(ARGV[3]) + 1))
    return 1
"#;

pub fn feed_key(owner_id: i64) -> String {
    format!("feed:{}", owner_id)
}

#[async_trait]
pub trait TimelineCache: Send + Sync {
    /// False when reads will always miss; lets callers skip seeding work.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Mirror one entry into an already-cached feed. No-op when the feed is
    /// not cached.
    async fn add_entry(&self, owner_id: i64, post_id: &str, score: f64) -> CacheResult<()>;

    /// Add many entries, trim to the cap and reset the TTL.
    async fn add_entries_bulk(&self, owner_id: i64, entries: &[(String, f64)]) -> CacheResult<()>;

    async fn remove_entry(&self, owner_id: i64, post_id: &str) -> CacheResult<()>;

    /// Post ids ranked by descending score, `start..=end`.
    async fn range_by_rank(&self, owner_id: i64, start: isize, end: isize)
        -> CacheResult<Vec<String>>;

    async fn count(&self, owner_id: i64) -> CacheResult<i64>;

    async fn exists(&self, owner_id: i64) -> CacheResult<bool>;

    async fn clear(&self, owner_id: i64) -> CacheResult<()>;

    async fn ping(&self) -> CacheResult<()>;
}

/// Feed cache layer using Redis
#[derive(Clone)]
pub struct RedisFeedCache {
    client: Arc<ConnectionManager>,
    ttl_secs: u64,
    max_entries: usize,
}

impl RedisFeedCache {
    pub async fn new(config: &RedisConfig) -> CacheResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let manager = ConnectionManager::new(client).await?;

        Ok(Self::from_manager(
            manager,
            config.feed_ttl_secs,
            config.max_entries,
        ))
    }

    pub fn from_manager(manager: ConnectionManager, ttl_secs: u64, max_entries: usize) -> Self {
        Self {
            client: Arc::new(manager),
            ttl_secs,
            max_entries: max_entries.max(1),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.client.as_ref().clone()
    }

    fn trim_stop(&self) -> isize {
        -(self.max_entries as isize) - 1
    }
}

fn logged<'a>(
    op: &'static str,
    key: &'a str,
) -> impl FnOnce(redis::RedisError) -> CacheError + 'a {
    move |e| {
        warn!(key = %key, error = %e, "Redis {} failed", op);
        CacheError::Redis(e)
    }
}

#[async_trait]
impl TimelineCache for RedisFeedCache {
    async fn add_entry(&self, owner_id: i64, post_id: &str, score: f64) -> CacheResult<()> {
        let key = feed_key(owner_id);

        let applied: i64 = redis::Script::new(MIRROR_ENTRY_SCRIPT)
            .key(&key)
            .arg(score)
            .arg(post_id)
            .arg(self.max_entries)
            .invoke_async(&mut self.conn())
            .await
            .map_err(logged("ZADD", &key))?;

        if applied == 1 {
            debug!(key = %key, post_id = %post_id, "Mirrored entry into cached feed");
        }
        Ok(())
    }

    async fn add_entries_bulk(&self, owner_id: i64, entries: &[(String, f64)]) -> CacheResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let key = feed_key(owner_id);
        let mut pipe = redis::pipe();
        pipe.atomic();

        let mut zadd = redis::cmd("ZADD");
        zadd.arg(&key);
        for (post_id, score) in entries {
            zadd.arg(*score).arg(post_id);
        }
        pipe.add_command(zadd).ignore();
        pipe.cmd("ZREMRANGEBYRANK")
            .arg(&key)
            .arg(0)
            .arg(self.trim_stop())
            .ignore();
        pipe.cmd("EXPIRE").arg(&key).arg(self.ttl_secs).ignore();

        pipe.query_async::<_, ()>(&mut self.conn())
            .await
            .map_err(logged("ZADD", &key))?;

        debug!(
            key = %key,
            entries = entries.len(),
            ttl = self.ttl_secs,
            "Seeded cached feed"
        );
        Ok(())
    }

    async fn remove_entry(&self, owner_id: i64, post_id: &str) -> CacheResult<()> {
        let key = feed_key(owner_id);
        redis::cmd("ZREM")
            .arg(&key)
            .arg(post_id)
            .query_async::<_, i64>(&mut self.conn())
            .await
            .map_err(logged("ZREM", &key))?;
        Ok(())
    }

    async fn range_by_rank(
        &self,
        owner_id: i64,
        start: isize,
        end: isize,
    ) -> CacheResult<Vec<String>> {
        let key = feed_key(owner_id);
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(&key)
            .arg(start)
            .arg(end)
            .query_async(&mut self.conn())
            .await
            .map_err(logged("ZREVRANGE", &key))?;
        Ok(ids)
    }

    async fn count(&self, owner_id: i64) -> CacheResult<i64> {
        let key = feed_key(owner_id);
        let count: i64 = redis::cmd("ZCARD")
            .arg(&key)
            .query_async(&mut self.conn())
            .await
            .map_err(logged("ZCARD", &key))?;
        Ok(count)
    }

    async fn exists(&self, owner_id: i64) -> CacheResult<bool> {
        let key = feed_key(owner_id);
        let exists: bool = redis::cmd("EXISTS")
            .arg(&key)
            .query_async(&mut self.conn())
            .await
            .map_err(logged("EXISTS", &key))?;
        Ok(exists)
    }

    async fn clear(&self, owner_id: i64) -> CacheResult<()> {
        let key = feed_key(owner_id);
        redis::cmd("DEL")
            .arg(&key)
            .query_async::<_, i64>(&mut self.conn())
            .await
            .map_err(logged("DEL", &key))?;
        debug!(key = %key, "Cleared cached feed");
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn())
            .await
            .map_err(|e| {
                warn!("Redis PING failed: {}", e);
                CacheError::Redis(e)
            })?;
        Ok(())
    }
}

/// Stand-in used when Redis is disabled or unreachable; every call misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCache;

#[async_trait]
impl TimelineCache for DisabledCache {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn add_entry(&self, _owner_id: i64, _post_id: &str, _score: f64) -> CacheResult<()> {
        Err(CacheError::Disabled)
    }

    async fn add_entries_bulk(
        &self,
        _owner_id: i64,
        _entries: &[(String, f64)],
    ) -> CacheResult<()> {
        Err(CacheError::Disabled)
    }

    async fn remove_entry(&self, _owner_id: i64, _post_id: &str) -> CacheResult<()> {
        Err(CacheError::Disabled)
    }

    async fn range_by_rank(
        &self,
        _owner_id: i64,
        _start: isize,
        _end: isize,
    ) -> CacheResult<Vec<String>> {
        Err(CacheError::Disabled)
    }

    async fn count(&self, _owner_id: i64) -> CacheResult<i64> {
        Err(CacheError::Disabled)
    }

    async fn exists(&self, _owner_id: i64) -> CacheResult<bool> {
        Err(CacheError::Disabled)
    }

    async fn clear(&self, _owner_id: i64) -> CacheResult<()> {
        Err(CacheError::Disabled)
    }

    async fn ping(&self) -> CacheResult<()> {
        Err(CacheError::Disabled)
    }
}
