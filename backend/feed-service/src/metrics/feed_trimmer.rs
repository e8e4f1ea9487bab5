//! Feed trimmer metrics

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::time::Duration;

static TRIM_RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_trimmer_runs_total",
        "Feed trim cycles (success/error)",
        &["status"]
    )
    .expect("Failed to register feed trimmer runs metric")
});

static TRIM_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "feed_trimmer_duration_seconds",
        "Duration of a feed trim cycle",
        vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to register feed trimmer duration metric")
});

static OWNERS_OVER_LIMIT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "feed_trimmer_owners_over_limit",
        "Feeds above the entry ceiling found in the last cycle"
    )
    .expect("Failed to register feed trimmer owners metric")
});

static ENTRIES_PRUNED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "feed_trimmer_entries_pruned_total",
        "Feed entries removed by the trimmer"
    )
    .expect("Failed to register feed trimmer pruned metric")
});

pub fn record_trim_run(status: &str, duration: Duration) {
    TRIM_RUNS_TOTAL.with_label_values(&[status]).inc();
    TRIM_DURATION_SECONDS.observe(duration.as_secs_f64());
}

pub fn set_owners_over_limit(count: i64) {
    OWNERS_OVER_LIMIT.set(count);
}

pub fn record_entries_pruned(count: u64) {
    ENTRIES_PRUNED_TOTAL.inc_by(count);
}
