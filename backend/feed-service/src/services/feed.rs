//! Feed assembly engine
//!
//! Reads go cache → durable store → rebuild. Writes come from two
//! directions: write-time fan-out for ordinary authors, and read-time
//! rebuilds that pull recent posts from everyone the reader follows. Authors
//! above the celebrity threshold are never fanned out; their posts reach
//! followers through rebuilds only.

use chrono::{DateTime, Utc};
use event_schema::FeedAction;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::TimelineCache;
use crate::clients::UpstreamClient;
use crate::config::FeedConfig;
use crate::db::FeedStore;
use crate::error::{AppError, CacheError, Result, StoreError, UpstreamError};
use crate::events::FeedEventPublisher;
use crate::metrics;
use crate::models::{
    recency_score, CacheStatus, FeedEntry, FeedItem, FeedResponse, FeedStats, PageRequest, Post,
};

#[derive(Debug, Error)]
pub enum RebuildError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RebuildError> for AppError {
    fn from(err: RebuildError) -> Self {
        match err {
            RebuildError::Upstream(e) => e.into(),
            RebuildError::Store(e) => e.into(),
        }
    }
}

/// Outcome of one trim pass over oversized feeds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimReport {
    pub owners: usize,
    pub entries_removed: u64,
}

pub struct FeedService {
    store: Arc<dyn FeedStore>,
    cache: Arc<dyn TimelineCache>,
    upstream: Arc<dyn UpstreamClient>,
    publisher: Arc<dyn FeedEventPublisher>,
    config: FeedConfig,
    /// Entries projected into the cache when seeding it from the store
    cache_window: usize,
}

impl FeedService {
    pub fn new(
        store: Arc<dyn FeedStore>,
        cache: Arc<dyn TimelineCache>,
        upstream: Arc<dyn UpstreamClient>,
        publisher: Arc<dyn FeedEventPublisher>,
        config: FeedConfig,
        cache_window: usize,
    ) -> Self {
        Self {
            store,
            cache,
            upstream,
            publisher,
            config,
            cache_window: cache_window.max(1),
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// One page of `owner_id`'s feed.
    ///
    /// Upstream failures during a rebuild are absorbed: the feed stays stale
    /// and whatever the store holds is served. Store failures propagate.
    pub async fn get_user_feed(
        &self,
        owner_id: i64,
        request: PageRequest,
        token: Option<&str>,
    ) -> Result<FeedResponse> {
        if let Some(page) = self.read_from_cache(owner_id, request, token).await {
            metrics::record_feed_read("cache");
            return Ok(page);
        }

        let metadata = self.store.get_metadata(owner_id).await?;
        let is_fresh = metadata.as_ref().map(|m| !m.is_stale).unwrap_or(false);

        let (source, seed_cache) = if is_fresh {
            ("store", true)
        } else {
            match self.rebuild_feed(owner_id, token).await {
                Ok(count) => {
                    debug!(owner_id, entries = count, "Rebuilt feed on read");
                    ("rebuild", false)
                }
                Err(RebuildError::Upstream(e)) => {
                    warn!(
                        owner_id,
                        error = %e,
                        "Feed rebuild failed, serving durable feed as-is"
                    );
                    if metadata.is_none() {
                        self.store.mark_stale(owner_id).await?;
                    }
                    ("store", false)
                }
                Err(RebuildError::Store(e)) => return Err(e.into()),
            }
        };

        let page = self
            .read_from_store(owner_id, request, token, seed_cache)
            .await?;
        metrics::record_feed_read(source);
        Ok(page)
    }

    /// Discard the cached and durable view of a feed and rebuild it now.
    pub async fn refresh_user_feed(&self, owner_id: i64, token: Option<&str>) -> Result<usize> {
        self.store.mark_stale(owner_id).await?;
        self.clear_cache(owner_id).await;

        let count = self.rebuild_feed(owner_id, token).await?;
        info!(owner_id, entries = count, "Feed refreshed");
        Ok(count)
    }

    /// Write-time fan-out of a new post to its author's followers.
    ///
    /// Returns the number of feed entries written; 0 for celebrity authors.
    pub async fn add_post_to_followers_feeds(
        &self,
        post_id: &str,
        author_id: i64,
        post_created_at: DateTime<Utc>,
        token: Option<&str>,
    ) -> Result<usize> {
        let threshold = self.config.celebrity_follower_threshold;

        let follower_count = self
            .upstream
            .get_follower_count(author_id, token)
            .await
            .map_err(|e| {
                metrics::record_fanout("error");
                warn!(author_id, post_id = %post_id, error = %e, "Follower count lookup failed");
                e
            })?;

        if follower_count > threshold {
            metrics::record_fanout("celebrity_skipped");
            info!(
                author_id,
                post_id = %post_id,
                follower_count,
                threshold,
                "Skipping fan-out for celebrity author"
            );
            return Ok(0);
        }

        let followers = self
            .upstream
            .get_follower_ids(author_id, token, Some(threshold as usize))
            .await
            .map_err(|e| {
                metrics::record_fanout("error");
                warn!(author_id, post_id = %post_id, error = %e, "Follower list lookup failed");
                e
            })?;

        if followers.is_empty() {
            metrics::record_fanout("no_followers");
            return Ok(0);
        }

        let entries: Vec<FeedEntry> = followers
            .iter()
            .map(|follower| FeedEntry::new(*follower, post_id, author_id, post_created_at))
            .collect();
        let inserted_owners = self.store.insert_entries(&entries).await?;
        let inserted = inserted_owners.len() as u64;

        let score = recency_score(post_created_at);
        stream::iter(followers.iter().copied())
            .for_each_concurrent(self.config.fanout_cache_concurrency.max(1), |follower| {
                self.mirror_entry(follower, post_id, score)
            })
            .await;

        self.spawn_feed_updated(inserted_owners, post_id, FeedAction::Added);

        metrics::record_fanout("written");
        metrics::record_entries_written("fanout", inserted);
        info!(
            author_id,
            post_id = %post_id,
            followers = followers.len(),
            inserted,
            "Fanned out post to followers"
        );
        Ok(inserted as usize)
    }

    /// Publish `feed.updated` for each owner on a detached task. Delivery
    /// failures are logged only.
    fn spawn_feed_updated(&self, owners: Vec<i64>, post_id: &str, action: FeedAction) {
        if owners.is_empty() {
            return;
        }
        let publisher = Arc::clone(&self.publisher);
        let post_id = post_id.to_string();
        let concurrency = self.config.fanout_cache_concurrency.max(1);
        tokio::spawn(async move {
            stream::iter(owners)
                .for_each_concurrent(concurrency, |owner_id| {
                    publish_feed_updated(Arc::clone(&publisher), owner_id, post_id.clone(), action)
                })
                .await;
        });
    }

    /// Remove a deleted post from every feed. Cached copies age out via TTL.
    pub async fn remove_post_from_all_feeds(&self, post_id: &str) -> Result<u64> {
        let removed = self.store.remove_entries_by_post(post_id).await?;
        info!(post_id = %post_id, removed, "Removed post from feeds");
        Ok(removed)
    }

    /// A new followee means the feed is missing their history.
    pub async fn invalidate_feed(&self, owner_id: i64) -> Result<()> {
        self.store.mark_stale(owner_id).await?;
        self.clear_cache(owner_id).await;
        Ok(())
    }

    /// Drop everything `author_id` contributed to `owner_id`'s feed.
    pub async fn purge_author(&self, owner_id: i64, author_id: i64) -> Result<u64> {
        let removed = self
            .store
            .remove_entries_by_author(owner_id, author_id)
            .await?;
        self.clear_cache(owner_id).await;
        Ok(removed)
    }

    pub async fn get_feed_stats(&self, owner_id: i64) -> Result<FeedStats> {
        let metadata = self.store.get_metadata(owner_id).await?;
        let total_items = match &metadata {
            Some(m) => m.entry_count,
            None => self.store.count_entries(owner_id).await?,
        };

        let cache_status = match self.cache.exists(owner_id).await {
            Ok(true) => CacheStatus::Hit,
            Ok(false) => CacheStatus::Miss,
            Err(e) => {
                self.cache_degraded("exists", owner_id, e);
                CacheStatus::Miss
            }
        };

        Ok(FeedStats {
            user_id: owner_id,
            total_items,
            last_updated: metadata.as_ref().map(|m| m.updated_at),
            last_rebuilt_at: metadata.as_ref().and_then(|m| m.last_rebuilt_at),
            is_stale: metadata.as_ref().map(|m| m.is_stale).unwrap_or(true),
            cache_status,
        })
    }

    /// Prune feeds that grew past the per-owner ceiling.
    pub async fn trim_oversized_feeds(&self) -> Result<TrimReport> {
        let max_entries = self.config.max_items_per_user as i64;
        let owners = self
            .store
            .owners_over_limit(max_entries, self.config.trim_batch_size)
            .await?;

        let mut report = TrimReport {
            owners: owners.len(),
            entries_removed: 0,
        };
        for owner_id in owners {
            report.entries_removed += self.store.prune_excess(owner_id, max_entries).await?;
        }
        Ok(report)
    }

    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await?;
        Ok(())
    }

    async fn read_from_cache(
        &self,
        owner_id: i64,
        request: PageRequest,
        token: Option<&str>,
    ) -> Option<FeedResponse> {
        match self.cache.exists(owner_id).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                self.cache_degraded("exists", owner_id, e);
                return None;
            }
        }

        let (start, end) = request.cache_range();
        let post_ids = match self.cache.range_by_rank(owner_id, start, end).await {
            Ok(ids) if !ids.is_empty() => ids,
            Ok(_) => return None,
            Err(e) => {
                self.cache_degraded("range_by_rank", owner_id, e);
                return None;
            }
        };

        let total = match self.cache.count(owner_id).await {
            Ok(total) => total,
            Err(e) => {
                self.cache_degraded("count", owner_id, e);
                return None;
            }
        };

        let returned = post_ids.len();
        let posts = self.upstream.get_posts_batch(&post_ids, token).await;

        debug!(
            owner_id,
            page = request.page,
            cached = returned,
            resolved = posts.len(),
            "Feed page served from cache"
        );

        Some(FeedResponse {
            items: posts.into_iter().map(FeedItem::from_post).collect(),
            total,
            page: request.page,
            page_size: request.page_size,
            has_more: request.has_more(returned, total),
        })
    }

    async fn read_from_store(
        &self,
        owner_id: i64,
        request: PageRequest,
        token: Option<&str>,
        seed_cache: bool,
    ) -> Result<FeedResponse> {
        let total = self.store.count_entries(owner_id).await?;
        if total == 0 {
            return Ok(FeedResponse::empty(request));
        }

        let window = self.cache_window as i64;
        let seed = seed_cache && self.cache.is_enabled();

        let entries = if seed && request.offset() + request.limit() <= window {
            let projection = self.store.list_entries(owner_id, window, 0).await?;
            self.seed_cache(owner_id, &projection).await;
            projection
                .into_iter()
                .skip(request.offset() as usize)
                .take(request.page_size as usize)
                .collect::<Vec<_>>()
        } else {
            self.store
                .list_entries(owner_id, request.limit(), request.offset())
                .await?
        };

        let returned = entries.len();
        let post_ids: Vec<String> = entries.iter().map(|e| e.post_id.clone()).collect();
        let mut posts: HashMap<String, Post> = self
            .upstream
            .get_posts_batch(&post_ids, token)
            .await
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let items = entries
            .into_iter()
            .map(|entry| {
                let post = posts.remove(&entry.post_id);
                FeedItem::from_entry(entry, post)
            })
            .collect();

        Ok(FeedResponse {
            items,
            total,
            page: request.page,
            page_size: request.page_size,
            has_more: request.has_more(returned, total),
        })
    }

    async fn rebuild_feed(
        &self,
        owner_id: i64,
        token: Option<&str>,
    ) -> std::result::Result<usize, RebuildError> {
        let started = Instant::now();
        let result = self.rebuild_from_followees(owner_id, token).await;

        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_rebuild(status, started.elapsed());
        result
    }

    async fn rebuild_from_followees(
        &self,
        owner_id: i64,
        token: Option<&str>,
    ) -> std::result::Result<usize, RebuildError> {
        let following = self.upstream.get_following_ids(owner_id, token).await?;
        let followees: Vec<i64> = following
            .into_iter()
            .take(self.config.rebuild_max_following)
            .collect();

        let posts_per_user = self.config.rebuild_posts_per_user;
        let batches: Vec<Vec<Post>> = stream::iter(followees.iter().copied())
            .map(|followee| self.followee_posts(owner_id, followee, posts_per_user, token))
            .buffer_unordered(self.config.rebuild_concurrency.max(1))
            .collect()
            .await;

        let posts = merge_recent(batches, self.config.max_items_per_user);
        let entries: Vec<FeedEntry> = posts.iter().map(|p| p.to_entry(owner_id)).collect();

        let inserted = self.store.append_entries(&entries).await?;
        self.store
            .prune_excess(owner_id, self.config.max_items_per_user as i64)
            .await?;
        let count = self.store.count_entries(owner_id).await?;
        self.store.mark_rebuilt(owner_id, count).await?;
        metrics::record_entries_written("rebuild", inserted);

        self.clear_cache(owner_id).await;
        if self.cache.is_enabled() && count > 0 {
            let projection = self
                .store
                .list_entries(owner_id, self.cache_window as i64, 0)
                .await?;
            self.seed_cache(owner_id, &projection).await;
        }

        info!(
            owner_id,
            followees = followees.len(),
            candidates = posts.len(),
            inserted,
            entries = count,
            "Feed rebuilt"
        );
        Ok(count as usize)
    }

    async fn seed_cache(&self, owner_id: i64, entries: &[FeedEntry]) {
        if entries.is_empty() {
            return;
        }
        let members: Vec<(String, f64)> = entries
            .iter()
            .map(|e| (e.post_id.clone(), e.cache_score()))
            .collect();
        if let Err(e) = self.cache.add_entries_bulk(owner_id, &members).await {
            self.cache_degraded("add_entries_bulk", owner_id, e);
        }
    }

    async fn clear_cache(&self, owner_id: i64) {
        if let Err(e) = self.cache.clear(owner_id).await {
            self.cache_degraded("clear", owner_id, e);
        }
    }

    async fn mirror_entry(&self, owner_id: i64, post_id: &str, score: f64) {
        if let Err(e) = self.cache.add_entry(owner_id, post_id, score).await {
            self.cache_degraded("add_entry", owner_id, e);
        }
    }

    /// Recent posts by `followee`; empty when the post service fails.
    async fn followee_posts(
        &self,
        owner_id: i64,
        followee: i64,
        posts_per_user: u32,
        token: Option<&str>,
    ) -> Vec<Post> {
        match self
            .upstream
            .get_user_posts(followee, posts_per_user, token)
            .await
        {
            Ok(posts) => posts
                .into_iter()
                .filter(|p| p.user_id == followee)
                .collect(),
            Err(e) => {
                warn!(
                    owner_id,
                    followee,
                    error = %e,
                    "Skipping followee during rebuild"
                );
                Vec::new()
            }
        }
    }

    fn cache_degraded(&self, operation: &'static str, owner_id: i64, err: CacheError) {
        if matches!(err, CacheError::Disabled) {
            return;
        }
        metrics::record_cache_error(operation);
        warn!(owner_id, operation, error = %err, "Cache unavailable, treating as miss");
    }
}

async fn publish_feed_updated(
    publisher: Arc<dyn FeedEventPublisher>,
    owner_id: i64,
    post_id: String,
    action: FeedAction,
) {
    if let Err(e) = publisher
        .publish_feed_updated(owner_id, &post_id, action)
        .await
    {
        warn!(
            owner_id,
            post_id = %post_id,
            error = %e,
            "feed_updated publish failed"
        );
    }
}

/// Newest first, one copy per post id, at most `limit` posts.
pub fn merge_recent(batches: Vec<Vec<Post>>, limit: usize) -> Vec<Post> {
    let mut posts: Vec<Post> = batches.into_iter().flatten().collect();
    posts.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    posts.dedup_by(|a, b| a.id == b.id);
    posts.truncate(limit);
    posts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn post(id: &str, author: i64, minute: u32) -> Post {
        Post {
            id: id.to_string(),
            user_id: author,
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap(),
            extra: Default::default(),
        }
    }

    #[test]
    fn merge_orders_newest_first_and_truncates() {
        let merged = merge_recent(
            vec![
                vec![post("p1", 2, 0), post("p3", 2, 10)],
                vec![post("p2", 3, 5)],
            ],
            2,
        );
        let ids: Vec<_> = merged.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p3", "p2"]);
    }

    #[test]
    fn merge_drops_duplicate_posts() {
        let merged = merge_recent(vec![vec![post("p1", 2, 0)], vec![post("p1", 2, 0)]], 10);
        assert_eq!(merged.len(), 1);
    }
}
