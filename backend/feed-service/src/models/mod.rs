use chrono::{DateTime, Utc};
use event_schema::serde_helpers::{flexible_datetime, flexible_id};
use serde::{Deserialize, Serialize};

/// One post materialized into one owner's feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FeedEntry {
    pub owner_id: i64,
    pub post_id: String,
    pub author_id: i64,
    pub post_created_at: DateTime<Utc>,
    pub rank_score: f64,
    pub ingested_at: DateTime<Utc>,
}

impl FeedEntry {
    pub fn new(
        owner_id: i64,
        post_id: impl Into<String>,
        author_id: i64,
        post_created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            owner_id,
            post_id: post_id.into(),
            author_id,
            post_created_at,
            rank_score: 0.0,
            ingested_at: Utc::now(),
        }
    }

    /// Score used to order the entry in the cache
    pub fn cache_score(&self) -> f64 {
        recency_score(self.post_created_at)
    }
}

/// Epoch seconds, with sub-second precision, used as the sorted-set score.
pub fn recency_score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// Per-owner bookkeeping for a feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FeedMetadata {
    pub owner_id: i64,
    pub last_rebuilt_at: Option<DateTime<Utc>>,
    pub entry_count: i64,
    pub is_stale: bool,
    pub updated_at: DateTime<Utc>,
}

/// Post as served by the post service. Fields beyond the ones the feed
/// needs are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(with = "flexible_id")]
    pub user_id: i64,
    #[serde(with = "flexible_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Post {
    pub fn to_entry(&self, owner_id: i64) -> FeedEntry {
        FeedEntry::new(owner_id, self.id.clone(), self.user_id, self.created_at)
    }
}

/// Feed item returned to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedItem {
    pub post_id: String,
    pub author_id: i64,
    pub post_created_at: DateTime<Utc>,
    pub rank_score: f64,
    /// When the entry entered the feed; absent for cache-served pages
    pub ingested_at: Option<DateTime<Utc>>,
    /// Post payload, absent when the post service could not resolve it
    pub post: Option<Post>,
}

impl FeedItem {
    pub fn from_entry(entry: FeedEntry, post: Option<Post>) -> Self {
        Self {
            post_id: entry.post_id,
            author_id: entry.author_id,
            post_created_at: entry.post_created_at,
            rank_score: entry.rank_score,
            ingested_at: Some(entry.ingested_at),
            post,
        }
    }

    pub fn from_post(post: Post) -> Self {
        Self {
            post_id: post.id.clone(),
            author_id: post.user_id,
            post_created_at: post.created_at,
            rank_score: 0.0,
            ingested_at: None,
            post: Some(post),
        }
    }
}

/// A page request, validated: `page >= 1`, `page_size >= 1`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.page_size as i64
    }

    pub fn limit(&self) -> i64 {
        self.page_size as i64
    }

    /// Inclusive rank range for a sorted-set read
    pub fn cache_range(&self) -> (isize, isize) {
        let start = self.offset() as isize;
        (start, start + self.page_size as isize - 1)
    }

    pub fn has_more(&self, returned: usize, total: i64) -> bool {
        self.offset() + (returned as i64) < total
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedResponse {
    pub items: Vec<FeedItem>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub has_more: bool,
}

impl FeedResponse {
    pub fn empty(request: PageRequest) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            page: request.page,
            page_size: request.page_size,
            has_more: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedStats {
    pub user_id: i64,
    pub total_items: i64,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_rebuilt_at: Option<DateTime<Utc>>,
    pub is_stale: bool,
    pub cache_status: CacheStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn page_math() {
        let first = PageRequest::new(1, 20);
        assert_eq!(first.offset(), 0);
        assert_eq!(first.cache_range(), (0, 19));

        let third = PageRequest::new(3, 10);
        assert_eq!(third.offset(), 20);
        assert_eq!(third.cache_range(), (20, 29));
        assert!(third.has_more(10, 31));
        assert!(!third.has_more(10, 30));
        assert!(!third.has_more(0, 5));
    }

    #[test]
    fn post_keeps_unknown_fields() {
        let post: Post = serde_json::from_str(
            r#"{"id":"65f0","user_id":4,"created_at":"2024-03-01T10:00:00","content":"hi"}"#,
        )
        .unwrap();

        assert_eq!(post.user_id, 4);
        assert_eq!(
            post.created_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(post.extra["content"], "hi");

        let entry = post.to_entry(9);
        assert_eq!(entry.owner_id, 9);
        assert_eq!(entry.author_id, 4);
        assert_eq!(entry.rank_score, 0.0);
    }

    #[test]
    fn post_accepts_mongo_style_id() {
        let post: Post = serde_json::from_str(
            r#"{"_id":"65f0c0ffee","user_id":"4","created_at":"2024-03-01T10:00:00","likes":0}"#,
        )
        .unwrap();

        assert_eq!(post.id, "65f0c0ffee");
        assert_eq!(post.user_id, 4);
        assert!(!post.extra.contains_key("_id"));
    }

    #[test]
    fn cache_status_wire_names() {
        assert_eq!(serde_json::to_string(&CacheStatus::Hit).unwrap(), "\"hit\"");
        assert_eq!(serde_json::to_string(&CacheStatus::Miss).unwrap(), "\"miss\"");
    }
}
