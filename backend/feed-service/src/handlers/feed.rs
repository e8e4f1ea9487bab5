use actix_web::{get, post, web, HttpResponse};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::FeedConfig;
use crate::error::{AppError, Result};
use crate::middleware::{BearerToken, UserId};
use crate::models::{MessageResponse, PageRequest};
use crate::services::FeedService;

#[derive(Debug, Default, Deserialize)]
pub struct FeedQueryParams {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

impl FeedQueryParams {
    /// Validate paging bounds before any I/O happens.
    pub fn to_page_request(&self, config: &FeedConfig) -> Result<PageRequest> {
        let page = self.page.unwrap_or(1);
        if page < 1 || page > u32::MAX as i64 {
            return Err(AppError::Validation("page must be >= 1".to_string()));
        }

        let page_size = self.page_size.unwrap_or(config.default_page_size as i64);
        if page_size < 1 || page_size > config.max_page_size as i64 {
            return Err(AppError::Validation(format!(
                "page_size must be between 1 and {}",
                config.max_page_size
            )));
        }

        Ok(PageRequest::new(page as u32, page_size as u32))
    }
}

#[get("")]
pub async fn get_feed(
    query: web::Query<FeedQueryParams>,
    user_id: UserId,
    token: BearerToken,
    service: web::Data<FeedService>,
) -> Result<HttpResponse> {
    let request = query.to_page_request(service.config())?;
    debug!(
        user_id = user_id.0,
        page = request.page,
        page_size = request.page_size,
        "Getting feed"
    );

    let feed = service
        .get_user_feed(user_id.0, request, Some(token.0.as_str()))
        .await?;
    Ok(HttpResponse::Ok().json(feed))
}

#[post("/refresh")]
pub async fn refresh_feed(
    user_id: UserId,
    token: BearerToken,
    service: web::Data<FeedService>,
) -> Result<HttpResponse> {
    let entries = service
        .refresh_user_feed(user_id.0, Some(token.0.as_str()))
        .await?;
    Ok(HttpResponse::Ok().json(MessageResponse::new(format!(
        "Feed refreshed with {} items",
        entries
    ))))
}

#[get("/stats")]
pub async fn get_feed_stats(
    user_id: UserId,
    service: web::Data<FeedService>,
) -> Result<HttpResponse> {
    let stats = service.get_feed_stats(user_id.0).await?;
    Ok(HttpResponse::Ok().json(stats))
}

#[derive(Debug, Deserialize)]
pub struct FanoutQuery {
    pub post_user_id: i64,
}

/// Manual fan-out trigger, mounted only in debug mode
#[post("/fanout/{post_id}")]
pub async fn trigger_fanout(
    path: web::Path<String>,
    query: web::Query<FanoutQuery>,
    token: BearerToken,
    service: web::Data<FeedService>,
) -> Result<HttpResponse> {
    let post_id = path.into_inner();
    if post_id.trim().is_empty() {
        return Err(AppError::Validation("post_id must not be empty".to_string()));
    }

    let written = service
        .add_post_to_followers_feeds(
            &post_id,
            query.post_user_id,
            Utc::now(),
            Some(token.0.as_str()),
        )
        .await?;
    info!(post_id = %post_id, author_id = query.post_user_id, written, "Manual fan-out");

    Ok(HttpResponse::Ok().json(MessageResponse::new(format!(
        "Post {} added to {} feeds",
        post_id, written
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(page: Option<i64>, page_size: Option<i64>) -> FeedQueryParams {
        FeedQueryParams { page, page_size }
    }

    #[test]
    fn defaults_apply_when_absent() {
        let request = params(None, None)
            .to_page_request(&FeedConfig::default())
            .unwrap();
        assert_eq!(request, PageRequest::new(1, 20));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let config = FeedConfig::default();
        for (page, size) in [(Some(0), None), (Some(-3), None), (None, Some(0)), (None, Some(101))] {
            assert!(matches!(
                params(page, size).to_page_request(&config),
                Err(AppError::Validation(_))
            ));
        }
        assert!(params(Some(2), Some(100)).to_page_request(&config).is_ok());
    }
}
