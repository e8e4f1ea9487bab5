//! In-memory collaborators for exercising the feed engine without
//! PostgreSQL, Redis, Kafka or the upstream services.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use event_schema::FeedAction;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use feed_service::cache::{CacheResult, TimelineCache};
use feed_service::clients::{UpstreamClient, UpstreamResult, VerifiedUser};
use feed_service::config::FeedConfig;
use feed_service::db::{FeedStore, StoreResult};
use feed_service::error::{CacheError, PublishError, UpstreamError};
use feed_service::events::FeedEventPublisher;
use feed_service::models::{FeedEntry, FeedMetadata, Post};
use feed_service::services::FeedService;

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap()
}

pub fn post(id: &str, author: i64, created_at: DateTime<Utc>) -> Post {
    Post {
        id: id.to_string(),
        user_id: author,
        created_at,
        extra: Default::default(),
    }
}

fn sort_newest_first(entries: &mut [FeedEntry]) {
    entries.sort_by(|a, b| {
        b.post_created_at
            .cmp(&a.post_created_at)
            .then_with(|| b.rank_score.total_cmp(&a.rank_score))
            .then_with(|| b.post_id.cmp(&a.post_id))
    });
}

#[derive(Default)]
struct StoreState {
    entries: Vec<FeedEntry>,
    keys: HashSet<(i64, String)>,
    metadata: HashMap<i64, FeedMetadata>,
}

impl StoreState {
    fn count(&self, owner_id: i64) -> i64 {
        self.entries.iter().filter(|e| e.owner_id == owner_id).count() as i64
    }

    fn refresh(&mut self, owner_id: i64) {
        let count = self.count(owner_id);
        if let Some(meta) = self.metadata.get_mut(&owner_id) {
            meta.entry_count = count;
            meta.updated_at = Utc::now();
        }
    }

    fn remove_where(&mut self, predicate: impl Fn(&FeedEntry) -> bool) -> Vec<i64> {
        let mut owners = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if predicate(&entry) {
                self.keys.remove(&(entry.owner_id, entry.post_id.clone()));
                owners.push(entry.owner_id);
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        owners
    }
}

/// `FeedStore` with the same uniqueness, ordering and bookkeeping rules as
/// the PostgreSQL implementation.
#[derive(Default)]
pub struct MemoryFeedStore {
    state: Mutex<StoreState>,
}

impl MemoryFeedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries_for(&self, owner_id: i64) -> Vec<FeedEntry> {
        let state = self.state.lock().unwrap();
        let mut entries: Vec<FeedEntry> = state
            .entries
            .iter()
            .filter(|e| e.owner_id == owner_id)
            .cloned()
            .collect();
        sort_newest_first(&mut entries);
        entries
    }

    pub fn post_ids_for(&self, owner_id: i64) -> Vec<String> {
        self.entries_for(owner_id)
            .into_iter()
            .map(|e| e.post_id)
            .collect()
    }

    pub fn total_entries(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn metadata(&self, owner_id: i64) -> Option<FeedMetadata> {
        self.state.lock().unwrap().metadata.get(&owner_id).cloned()
    }
}

#[async_trait]
impl FeedStore for MemoryFeedStore {
    async fn insert_entries(&self, entries: &[FeedEntry]) -> StoreResult<Vec<i64>> {
        let mut state = self.state.lock().unwrap();
        let mut inserted = Vec::new();
        for entry in entries {
            if state.keys.insert((entry.owner_id, entry.post_id.clone())) {
                state.entries.push(entry.clone());
                inserted.push(entry.owner_id);
            }
        }
        let owners: HashSet<i64> = inserted.iter().copied().collect();
        for owner in owners {
            state.refresh(owner);
        }
        Ok(inserted)
    }

    async fn remove_entries_by_post(&self, post_id: &str) -> StoreResult<u64> {
        let mut state = self.state.lock().unwrap();
        let owners = state.remove_where(|e| e.post_id == post_id);
        for owner in &owners {
            state.refresh(*owner);
        }
        Ok(owners.len() as u64)
    }

    async fn remove_entries_by_author(&self, owner_id: i64, author_id: i64) -> StoreResult<u64> {
        let mut state = self.state.lock().unwrap();
        let removed = state
            .remove_where(|e| e.owner_id == owner_id && e.author_id == author_id)
            .len();
        state.refresh(owner_id);
        Ok(removed as u64)
    }

    async fn list_entries(
        &self,
        owner_id: i64,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<FeedEntry>> {
        Ok(self
            .entries_for(owner_id)
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count_entries(&self, owner_id: i64) -> StoreResult<i64> {
        Ok(self.state.lock().unwrap().count(owner_id))
    }

    async fn prune_excess(&self, owner_id: i64, max_entries: i64) -> StoreResult<u64> {
        let doomed: HashSet<String> = self
            .entries_for(owner_id)
            .into_iter()
            .skip(max_entries.max(0) as usize)
            .map(|e| e.post_id)
            .collect();

        let mut state = self.state.lock().unwrap();
        let removed = state
            .remove_where(|e| e.owner_id == owner_id && doomed.contains(&e.post_id))
            .len();
        state.refresh(owner_id);
        Ok(removed as u64)
    }

    async fn get_metadata(&self, owner_id: i64) -> StoreResult<Option<FeedMetadata>> {
        Ok(self.metadata(owner_id))
    }

    async fn upsert_metadata(
        &self,
        owner_id: i64,
        entry_count: Option<i64>,
        is_stale: Option<bool>,
    ) -> StoreResult<FeedMetadata> {
        let mut state = self.state.lock().unwrap();
        let count = entry_count.unwrap_or_else(|| state.count(owner_id));
        let meta = state
            .metadata
            .entry(owner_id)
            .or_insert_with(|| FeedMetadata {
                owner_id,
                last_rebuilt_at: None,
                entry_count: 0,
                is_stale: false,
                updated_at: Utc::now(),
            });
        meta.entry_count = count;
        if let Some(stale) = is_stale {
            meta.is_stale = stale;
        }
        meta.updated_at = Utc::now();
        Ok(meta.clone())
    }

    async fn mark_stale(&self, owner_id: i64) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let count = state.count(owner_id);
        let meta = state
            .metadata
            .entry(owner_id)
            .or_insert_with(|| FeedMetadata {
                owner_id,
                last_rebuilt_at: None,
                entry_count: count,
                is_stale: true,
                updated_at: Utc::now(),
            });
        meta.is_stale = true;
        meta.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_rebuilt(&self, owner_id: i64, entry_count: i64) -> StoreResult<FeedMetadata> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let meta = FeedMetadata {
            owner_id,
            last_rebuilt_at: Some(now),
            entry_count,
            is_stale: false,
            updated_at: now,
        };
        state.metadata.insert(owner_id, meta.clone());
        Ok(meta)
    }

    async fn owners_over_limit(&self, max_entries: i64, limit: i64) -> StoreResult<Vec<i64>> {
        let state = self.state.lock().unwrap();
        let mut counts: HashMap<i64, i64> = HashMap::new();
        for entry in &state.entries {
            *counts.entry(entry.owner_id).or_default() += 1;
        }
        let mut owners: Vec<(i64, i64)> = counts
            .into_iter()
            .filter(|(_, count)| *count > max_entries)
            .collect();
        owners.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(owners
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(owner, _)| owner)
            .collect())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Sorted-set cache with Redis semantics: empty sets do not exist, ranks
/// are by descending score.
pub struct MemoryCache {
    feeds: Mutex<HashMap<i64, Vec<(String, f64)>>>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Arc<Self> {
        Arc::new(Self {
            feeds: Mutex::new(HashMap::new()),
            max_entries,
        })
    }

    pub fn members(&self, owner_id: i64) -> Vec<String> {
        let feeds = self.feeds.lock().unwrap();
        feeds
            .get(&owner_id)
            .map(|set| sorted(set).into_iter().map(|(m, _)| m).collect())
            .unwrap_or_default()
    }

    fn upsert(&self, set: &mut Vec<(String, f64)>, member: &str, score: f64) {
        match set.iter_mut().find(|(m, _)| m == member) {
            Some(existing) => existing.1 = score,
            None => set.push((member.to_string(), score)),
        }
        if set.len() > self.max_entries {
            let mut ordered = sorted(set);
            ordered.truncate(self.max_entries);
            *set = ordered;
        }
    }
}

fn sorted(set: &[(String, f64)]) -> Vec<(String, f64)> {
    let mut ordered = set.to_vec();
    ordered.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    ordered
}

#[async_trait]
impl TimelineCache for MemoryCache {
    async fn add_entry(&self, owner_id: i64, post_id: &str, score: f64) -> CacheResult<()> {
        let mut feeds = self.feeds.lock().unwrap();
        if let Some(set) = feeds.get_mut(&owner_id) {
            let mut updated = std::mem::take(set);
            self.upsert(&mut updated, post_id, score);
            *set = updated;
        }
        Ok(())
    }

    async fn add_entries_bulk(&self, owner_id: i64, entries: &[(String, f64)]) -> CacheResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut feeds = self.feeds.lock().unwrap();
        let mut set = feeds.remove(&owner_id).unwrap_or_default();
        for (member, score) in entries {
            self.upsert(&mut set, member, *score);
        }
        feeds.insert(owner_id, set);
        Ok(())
    }

    async fn remove_entry(&self, owner_id: i64, post_id: &str) -> CacheResult<()> {
        let mut feeds = self.feeds.lock().unwrap();
        if let Some(set) = feeds.get_mut(&owner_id) {
            set.retain(|(m, _)| m != post_id);
            if set.is_empty() {
                feeds.remove(&owner_id);
            }
        }
        Ok(())
    }

    async fn range_by_rank(
        &self,
        owner_id: i64,
        start: isize,
        end: isize,
    ) -> CacheResult<Vec<String>> {
        let members = self.members(owner_id);
        let start = start.max(0) as usize;
        let end = end.max(-1);
        if end < 0 {
            return Ok(Vec::new());
        }
        Ok(members
            .into_iter()
            .skip(start)
            .take((end as usize + 1).saturating_sub(start))
            .collect())
    }

    async fn count(&self, owner_id: i64) -> CacheResult<i64> {
        Ok(self.members(owner_id).len() as i64)
    }

    async fn exists(&self, owner_id: i64) -> CacheResult<bool> {
        Ok(self.feeds.lock().unwrap().contains_key(&owner_id))
    }

    async fn clear(&self, owner_id: i64) -> CacheResult<()> {
        self.feeds.lock().unwrap().remove(&owner_id);
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }
}

/// A reachable-but-broken Redis: every call fails with a connection error.
pub struct BrokenCache;

fn redis_down() -> CacheError {
    CacheError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

#[async_trait]
impl TimelineCache for BrokenCache {
    async fn add_entry(&self, _owner_id: i64, _post_id: &str, _score: f64) -> CacheResult<()> {
        Err(redis_down())
    }

    async fn add_entries_bulk(&self, _owner_id: i64, _entries: &[(String, f64)]) -> CacheResult<()> {
        Err(redis_down())
    }

    async fn remove_entry(&self, _owner_id: i64, _post_id: &str) -> CacheResult<()> {
        Err(redis_down())
    }

    async fn range_by_rank(
        &self,
        _owner_id: i64,
        _start: isize,
        _end: isize,
    ) -> CacheResult<Vec<String>> {
        Err(redis_down())
    }

    async fn count(&self, _owner_id: i64) -> CacheResult<i64> {
        Err(redis_down())
    }

    async fn exists(&self, _owner_id: i64) -> CacheResult<bool> {
        Err(redis_down())
    }

    async fn clear(&self, _owner_id: i64) -> CacheResult<()> {
        Err(redis_down())
    }

    async fn ping(&self) -> CacheResult<()> {
        Err(redis_down())
    }
}

#[derive(Default)]
struct Graph {
    following: HashMap<i64, Vec<i64>>,
    follower_counts: HashMap<i64, u64>,
    posts: HashMap<String, Post>,
    tokens: HashMap<String, i64>,
}

/// Graph, post and auth services backed by maps. `fail_graph` simulates a
/// graph-service outage.
#[derive(Default)]
pub struct FakeUpstream {
    graph: Mutex<Graph>,
    pub fail_graph: AtomicBool,
    pub following_calls: AtomicUsize,
    pub follower_list_calls: AtomicUsize,
}

impl FakeUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn follow(&self, follower: i64, followee: i64) {
        let mut graph = self.graph.lock().unwrap();
        let list = graph.following.entry(follower).or_default();
        if !list.contains(&followee) {
            list.push(followee);
        }
    }

    pub fn unfollow(&self, follower: i64, followee: i64) {
        let mut graph = self.graph.lock().unwrap();
        if let Some(list) = graph.following.get_mut(&follower) {
            list.retain(|id| *id != followee);
        }
    }

    /// Report `count` followers for `user_id` regardless of the edges.
    pub fn set_follower_count(&self, user_id: i64, count: u64) {
        self.graph
            .lock()
            .unwrap()
            .follower_counts
            .insert(user_id, count);
    }

    pub fn add_post(&self, post: Post) {
        self.graph
            .lock()
            .unwrap()
            .posts
            .insert(post.id.clone(), post);
    }

    pub fn issue_token(&self, token: &str, user_id: i64) {
        self.graph
            .lock()
            .unwrap()
            .tokens
            .insert(token.to_string(), user_id);
    }

    fn followers_of(&self, user_id: i64) -> Vec<i64> {
        let graph = self.graph.lock().unwrap();
        let mut followers: Vec<i64> = graph
            .following
            .iter()
            .filter(|(_, followees)| followees.contains(&user_id))
            .map(|(follower, _)| *follower)
            .collect();
        followers.sort_unstable();
        followers
    }

    fn check_graph(&self) -> UpstreamResult<()> {
        if self.fail_graph.load(Ordering::SeqCst) {
            return Err(UpstreamError::unavailable("graph-service", "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl UpstreamClient for FakeUpstream {
    async fn get_following_ids(
        &self,
        user_id: i64,
        _token: Option<&str>,
    ) -> UpstreamResult<Vec<i64>> {
        self.following_calls.fetch_add(1, Ordering::SeqCst);
        self.check_graph()?;
        Ok(self
            .graph
            .lock()
            .unwrap()
            .following
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_follower_ids(
        &self,
        user_id: i64,
        _token: Option<&str>,
        limit: Option<usize>,
    ) -> UpstreamResult<Vec<i64>> {
        self.follower_list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_graph()?;
        let mut followers = self.followers_of(user_id);
        if let Some(limit) = limit {
            followers.truncate(limit);
        }
        Ok(followers)
    }

    async fn get_follower_count(&self, user_id: i64, _token: Option<&str>) -> UpstreamResult<u64> {
        self.check_graph()?;
        let overridden = self
            .graph
            .lock()
            .unwrap()
            .follower_counts
            .get(&user_id)
            .copied();
        Ok(overridden.unwrap_or_else(|| self.followers_of(user_id).len() as u64))
    }

    async fn get_post(&self, post_id: &str, _token: Option<&str>) -> UpstreamResult<Option<Post>> {
        Ok(self.graph.lock().unwrap().posts.get(post_id).cloned())
    }

    async fn get_posts_batch(&self, post_ids: &[String], _token: Option<&str>) -> Vec<Post> {
        let graph = self.graph.lock().unwrap();
        post_ids
            .iter()
            .filter_map(|id| graph.posts.get(id).cloned())
            .collect()
    }

    async fn get_user_posts(
        &self,
        user_id: i64,
        limit: u32,
        _token: Option<&str>,
    ) -> UpstreamResult<Vec<Post>> {
        let graph = self.graph.lock().unwrap();
        let mut posts: Vec<Post> = graph
            .posts
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        posts.truncate(limit as usize);
        Ok(posts)
    }

    async fn verify_token(&self, token: &str) -> UpstreamResult<VerifiedUser> {
        match self.graph.lock().unwrap().tokens.get(token) {
            Some(user_id) => Ok(VerifiedUser {
                sub: *user_id,
                username: None,
                email: None,
            }),
            None => Err(UpstreamError::InvalidCredential {
                service: "auth-service",
            }),
        }
    }
}

/// Captures every `feed.updated` event
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(i64, String, FeedAction)>>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(i64, String, FeedAction)> {
        self.events.lock().unwrap().clone()
    }

    /// Publishing runs on a detached task; poll until `count` events land.
    pub async fn wait_for(&self, count: usize) -> Vec<(i64, String, FeedAction)> {
        for _ in 0..200 {
            let events = self.events();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        self.events()
    }
}

/// Publisher that takes `delay` per message and then fails.
pub struct SlowPublisher {
    pub delay: std::time::Duration,
    pub attempts: AtomicUsize,
}

impl SlowPublisher {
    pub fn new(delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            attempts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl FeedEventPublisher for SlowPublisher {
    async fn publish_feed_updated(
        &self,
        _owner_id: i64,
        _post_id: &str,
        _action: FeedAction,
    ) -> Result<(), PublishError> {
        tokio::time::sleep(self.delay).await;
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PublishError::Kafka("message timed out".to_string()))
    }
}

#[async_trait]
impl FeedEventPublisher for RecordingPublisher {
    async fn publish_feed_updated(
        &self,
        owner_id: i64,
        post_id: &str,
        action: FeedAction,
    ) -> Result<(), PublishError> {
        self.events
            .lock()
            .unwrap()
            .push((owner_id, post_id.to_string(), action));
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<MemoryFeedStore>,
    pub cache: Arc<MemoryCache>,
    pub upstream: Arc<FakeUpstream>,
    pub publisher: Arc<RecordingPublisher>,
    pub service: Arc<FeedService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(FeedConfig::default())
    }

    pub fn with_config(config: FeedConfig) -> Self {
        let store = MemoryFeedStore::new();
        let cache = MemoryCache::new(config.max_items_per_user);
        let upstream = FakeUpstream::new();
        let publisher = RecordingPublisher::new();
        let service = Arc::new(FeedService::new(
            store.clone(),
            cache.clone(),
            upstream.clone(),
            publisher.clone(),
            config.clone(),
            config.max_items_per_user,
        ));

        Self {
            store,
            cache,
            upstream,
            publisher,
            service,
        }
    }

    /// Same collaborators, different publisher.
    pub fn service_with_publisher(&self, publisher: Arc<dyn FeedEventPublisher>) -> FeedService {
        FeedService::new(
            self.store.clone(),
            self.cache.clone(),
            self.upstream.clone(),
            publisher,
            self.service.config().clone(),
            self.service.config().max_items_per_user,
        )
    }

    /// Same collaborators, different cache.
    pub fn service_with_cache(&self, cache: Arc<dyn TimelineCache>) -> FeedService {
        FeedService::new(
            self.store.clone(),
            cache,
            self.upstream.clone(),
            self.publisher.clone(),
            self.service.config().clone(),
            self.service.config().max_items_per_user,
        )
    }
}
