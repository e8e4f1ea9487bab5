//! Prometheus metrics for feed-service
//!
//! Collectors register against the default registry on first use.

pub mod feed_trimmer;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};
use std::time::Duration;

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_http_requests_total",
        "HTTP requests by method, route and status",
        &["method", "path", "status"]
    )
    .expect("Failed to register feed http requests metric")
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "feed_http_request_duration_seconds",
        "HTTP request latency",
        &["method", "path"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register feed http duration metric")
});

static FEED_READS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_reads_total",
        "Feed pages served, by the tier that answered",
        &["source"]
    )
    .expect("Failed to register feed reads metric")
});

static FEED_REBUILDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_rebuilds_total",
        "Feed rebuilds by outcome",
        &["status"]
    )
    .expect("Failed to register feed rebuilds metric")
});

static FEED_REBUILD_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "feed_rebuild_duration_seconds",
        "Duration of feed rebuilds",
        &["status"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register feed rebuild duration metric")
});

static FANOUT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_fanout_total",
        "Write-time fan-out attempts by outcome",
        &["outcome"]
    )
    .expect("Failed to register feed fanout metric")
});

static FANOUT_ENTRIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_fanout_entries_total",
        "Feed entries written by fan-out",
        &["path"]
    )
    .expect("Failed to register feed fanout entries metric")
});

static CACHE_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_cache_errors_total",
        "Cache operations degraded to a miss",
        &["operation"]
    )
    .expect("Failed to register feed cache errors metric")
});

static EVENTS_CONSUMED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_events_consumed_total",
        "Ingested social-graph and content events",
        &["event_type", "status"]
    )
    .expect("Failed to register feed events consumed metric")
});

static EVENTS_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_events_published_total",
        "feed.updated events by action and delivery status",
        &["action", "status"]
    )
    .expect("Failed to register feed events published metric")
});

pub fn observe_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

/// `source` is one of cache/store/rebuild
pub fn record_feed_read(source: &str) {
    FEED_READS_TOTAL.with_label_values(&[source]).inc();
}

pub fn record_rebuild(status: &str, duration: Duration) {
    FEED_REBUILDS_TOTAL.with_label_values(&[status]).inc();
    FEED_REBUILD_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration.as_secs_f64());
}

pub fn record_fanout(outcome: &str) {
    FANOUT_TOTAL.with_label_values(&[outcome]).inc();
}

/// `path` is fanout (write time) or rebuild (read time)
pub fn record_entries_written(path: &str, count: u64) {
    FANOUT_ENTRIES_TOTAL.with_label_values(&[path]).inc_by(count);
}

pub fn record_cache_error(operation: &str) {
    CACHE_ERRORS_TOTAL.with_label_values(&[operation]).inc();
}

pub fn record_event_consumed(event_type: &str, status: &str) {
    EVENTS_CONSUMED_TOTAL
        .with_label_values(&[event_type, status])
        .inc();
}

pub fn record_event_published(action: &str, status: &str) {
    EVENTS_PUBLISHED_TOTAL
        .with_label_values(&[action, status])
        .inc();
}

/// GET /metrics
pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
