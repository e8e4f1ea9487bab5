use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::warn;

use crate::services::FeedService;

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

pub async fn liveness() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "alive" }))
}

/// Ready once the durable store answers
pub async fn readiness(service: web::Data<FeedService>) -> HttpResponse {
    match service.health_check().await {
        Ok(()) => HttpResponse::Ok().json(json!({ "status": "ready", "database": "ok" })),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            HttpResponse::ServiceUnavailable()
                .json(json!({ "status": "not_ready", "database": "unavailable" }))
        }
    }
}
