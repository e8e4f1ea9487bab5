//! Clients for the services the feed depends on: follow graph, posts and
//! token verification.

pub mod http;

use async_trait::async_trait;
use event_schema::serde_helpers::flexible_id;
use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;
use crate::models::Post;

pub use http::HttpServiceClient;

pub type UpstreamResult<T> = std::result::Result<T, UpstreamError>;

/// Identity returned by the auth service for a valid bearer token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedUser {
    #[serde(alias = "user_id", with = "flexible_id")]
    pub sub: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Upstream collaborators of the feed engine.
///
/// `token` is forwarded as a bearer credential when present. Policy on
/// failures (degrade or abort) belongs to the caller.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Everyone `user_id` follows, across all pages.
    async fn get_following_ids(&self, user_id: i64, token: Option<&str>)
        -> UpstreamResult<Vec<i64>>;

    /// Followers of `user_id`, across all pages, stopping once `limit` is reached.
    async fn get_follower_ids(
        &self,
        user_id: i64,
        token: Option<&str>,
        limit: Option<usize>,
    ) -> UpstreamResult<Vec<i64>>;

    async fn get_follower_count(&self, user_id: i64, token: Option<&str>) -> UpstreamResult<u64>;

    /// `Ok(None)` when the post does not exist.
    async fn get_post(&self, post_id: &str, token: Option<&str>) -> UpstreamResult<Option<Post>>;

    /// Posts in input order; ids that are missing or fail to load are dropped.
    async fn get_posts_batch(&self, post_ids: &[String], token: Option<&str>) -> Vec<Post>;

    /// Most recent posts authored by `user_id`.
    async fn get_user_posts(
        &self,
        user_id: i64,
        limit: u32,
        token: Option<&str>,
    ) -> UpstreamResult<Vec<Post>>;

    async fn verify_token(&self, token: &str) -> UpstreamResult<VerifiedUser>;
}
