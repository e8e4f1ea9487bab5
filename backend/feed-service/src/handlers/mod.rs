pub mod feed;
pub mod health;

use actix_web::web;
use std::sync::Arc;

use crate::metrics;
use crate::middleware::{JwtAuthMiddleware, TokenVerifier};

pub use feed::{get_feed, get_feed_stats, refresh_feed, trigger_fanout, FeedQueryParams};

/// Mount every route. The `FeedService` itself is registered as app data by
/// the caller.
pub fn configure(cfg: &mut web::ServiceConfig, verifier: Arc<TokenVerifier>, debug: bool) {
    cfg.route("/health", web::get().to(health::health))
        .route("/api/v1/health/live", web::get().to(health::liveness))
        .route("/api/v1/health/ready", web::get().to(health::readiness))
        .route("/metrics", web::get().to(metrics::serve_metrics))
        .service(
            web::scope("/api/v1/feed")
                .wrap(JwtAuthMiddleware::new(verifier.clone()))
                .service(get_feed)
                .service(refresh_feed)
                .service(get_feed_stats),
        );

    if debug {
        cfg.service(
            web::scope("/internal/feed")
                .wrap(JwtAuthMiddleware::new(verifier))
                .service(trigger_fanout),
        );
    }
}
