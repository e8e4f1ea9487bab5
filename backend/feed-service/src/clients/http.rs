//! reqwest-backed upstream client
//!
//! Every call carries the configured connect and overall timeouts. Graph
//! listings are paged with `page_size=100` until the service reports no
//! more results.

use async_trait::async_trait;
use event_schema::serde_helpers::flexible_id;
use futures::stream::{self, StreamExt};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{UpstreamClient, UpstreamResult, VerifiedUser};
use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::models::Post;

const GRAPH_SERVICE: &str = "graph-service";
const POST_SERVICE: &str = "post-service";
const AUTH_SERVICE: &str = "auth-service";

const GRAPH_PAGE_SIZE: u32 = 100;
/// Guard against a graph service that never stops reporting `has_more`
const MAX_GRAPH_PAGES: u32 = 2_000;

#[derive(Debug, Deserialize)]
struct FollowRef {
    #[serde(with = "flexible_id")]
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct FollowingPage {
    #[serde(default)]
    following: Vec<FollowRef>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct FollowersPage {
    #[serde(default)]
    followers: Vec<FollowRef>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct GraphStats {
    #[serde(default)]
    follower_count: u64,
}

#[derive(Debug, Deserialize)]
struct PostList {
    #[serde(default)]
    posts: Vec<serde_json::Value>,
}

/// HTTP client for the graph, post and auth services
#[derive(Clone)]
pub struct HttpServiceClient {
    client: Client,
    auth_service_url: String,
    post_service_url: String,
    graph_service_url: String,
    max_concurrent_requests: usize,
}

impl HttpServiceClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            client,
            auth_service_url: trim_base(&config.auth_service_url),
            post_service_url: trim_base(&config.post_service_url),
            graph_service_url: trim_base(&config.graph_service_url),
            max_concurrent_requests: config.max_concurrent_requests.max(1),
        })
    }

    /// GET a JSON document. `Ok(None)` on 404.
    async fn get_json<T: DeserializeOwned>(
        &self,
        service: &'static str,
        url: &str,
        token: Option<&str>,
        query: &[(&str, String)],
    ) -> UpstreamResult<Option<T>> {
        let mut request = self.client.get(url).query(query);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            warn!(service, url = %url, error = %e, "Upstream request failed");
            UpstreamError::unavailable(service, e)
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(UpstreamError::InvalidCredential { service })
            }
            status if !status.is_success() => {
                warn!(service, url = %url, status = status.as_u16(), "Upstream returned error status");
                return Err(UpstreamError::unavailable(
                    service,
                    format!("HTTP {}", status.as_u16()),
                ));
            }
            _ => {}
        }

        response.json::<T>().await.map(Some).map_err(|e| {
            warn!(service, url = %url, error = %e, "Failed to decode upstream response");
            UpstreamError::decode(service, e)
        })
    }
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

#[async_trait]
impl UpstreamClient for HttpServiceClient {
    async fn get_following_ids(
        &self,
        user_id: i64,
        token: Option<&str>,
    ) -> UpstreamResult<Vec<i64>> {
        let url = format!("{}/api/v1/graph/following/{}", self.graph_service_url, user_id);
        let mut ids = Vec::new();

        for page in 1..=MAX_GRAPH_PAGES {
            let query = [
                ("page", page.to_string()),
                ("page_size", GRAPH_PAGE_SIZE.to_string()),
            ];
            let Some(body) = self
                .get_json::<FollowingPage>(GRAPH_SERVICE, &url, token, &query)
                .await?
            else {
                break;
            };

            let fetched = body.following.len();
            ids.extend(body.following.into_iter().map(|f| f.user_id));
            if !body.has_more || fetched == 0 {
                break;
            }
        }

        debug!(user_id, count = ids.len(), "Fetched following list");
        Ok(ids)
    }

    async fn get_follower_ids(
        &self,
        user_id: i64,
        token: Option<&str>,
        limit: Option<usize>,
    ) -> UpstreamResult<Vec<i64>> {
        let url = format!("{}/api/v1/graph/followers/{}", self.graph_service_url, user_id);
        let mut ids = Vec::new();

        for page in 1..=MAX_GRAPH_PAGES {
            let query = [
                ("page", page.to_string()),
                ("page_size", GRAPH_PAGE_SIZE.to_string()),
            ];
            let Some(body) = self
                .get_json::<FollowersPage>(GRAPH_SERVICE, &url, token, &query)
                .await?
            else {
                break;
            };

            let fetched = body.followers.len();
            ids.extend(body.followers.into_iter().map(|f| f.user_id));

            if let Some(limit) = limit {
                if ids.len() >= limit {
                    ids.truncate(limit);
                    break;
                }
            }
            if !body.has_more || fetched == 0 {
                break;
            }
        }

        debug!(user_id, count = ids.len(), "Fetched follower list");
        Ok(ids)
    }

    async fn get_follower_count(&self, user_id: i64, token: Option<&str>) -> UpstreamResult<u64> {
        let url = format!("{}/api/v1/graph/stats/{}", self.graph_service_url, user_id);
        let stats = self
            .get_json::<GraphStats>(GRAPH_SERVICE, &url, token, &[])
            .await?;
        Ok(stats.map(|s| s.follower_count).unwrap_or(0))
    }

    async fn get_post(&self, post_id: &str, token: Option<&str>) -> UpstreamResult<Option<Post>> {
        let url = format!("{}/api/v1/posts/{}", self.post_service_url, post_id);
        self.get_json::<Post>(POST_SERVICE, &url, token, &[]).await
    }

    async fn get_posts_batch(&self, post_ids: &[String], token: Option<&str>) -> Vec<Post> {
        let token = token.map(str::to_string);
        let owned_ids = post_ids.to_vec();
        let results: Vec<(String, UpstreamResult<Option<Post>>)> = stream::iter(owned_ids)
            .map(|post_id| {
                let client = self.clone();
                let token = token.clone();
                async move {
                    let result = client.get_post(&post_id, token.as_deref()).await;
                    (post_id, result)
                }
            })
            .buffered(self.max_concurrent_requests)
            .collect()
            .await;

        results
            .into_iter()
            .filter_map(|(post_id, result)| match result {
                Ok(post) => post,
                Err(e) => {
                    warn!(post_id = %post_id, error = %e, "Dropping post that failed to load");
                    None
                }
            })
            .collect()
    }

    async fn get_user_posts(
        &self,
        user_id: i64,
        limit: u32,
        token: Option<&str>,
    ) -> UpstreamResult<Vec<Post>> {
        let url = format!("{}/api/v1/posts", self.post_service_url);
        let query = [
            ("user_id", user_id.to_string()),
            ("page_size", limit.to_string()),
        ];

        let Some(list) = self
            .get_json::<PostList>(POST_SERVICE, &url, token, &query)
            .await?
        else {
            return Ok(Vec::new());
        };

        let posts = list
            .posts
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<Post>(raw) {
                Ok(post) => Some(post),
                Err(e) => {
                    debug!(user_id, error = %e, "Skipping malformed post");
                    None
                }
            })
            .collect();

        Ok(posts)
    }

    async fn verify_token(&self, token: &str) -> UpstreamResult<VerifiedUser> {
        let url = format!("{}/api/v1/auth/verify", self.auth_service_url);
        self.get_json::<VerifiedUser>(AUTH_SERVICE, &url, Some(token), &[])
            .await?
            .ok_or_else(|| UpstreamError::unavailable(AUTH_SERVICE, "verify endpoint not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_urls_lose_trailing_slash() {
        let config = UpstreamConfig {
            graph_service_url: "http://graph:8003/".to_string(),
            ..UpstreamConfig::default()
        };
        let client = HttpServiceClient::new(&config).unwrap();
        assert_eq!(client.graph_service_url, "http://graph:8003");
        assert_eq!(client.post_service_url, "http://localhost:8002");
    }
}
