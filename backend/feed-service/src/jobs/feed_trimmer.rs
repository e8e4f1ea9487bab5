//! Feed Trimmer Background Job
//!
//! Fan-out appends without pruning, so busy feeds drift past the per-owner
//! ceiling between rebuilds. This job periodically picks a batch of
//! oversized feeds and drops their oldest entries.

use crate::metrics::feed_trimmer as metrics;
use crate::services::{FeedService, TrimReport};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub async fn start_feed_trimmer(
    service: Arc<FeedService>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tracing::info!(
        "Starting feed trimmer background job (interval={}s, max_items_per_user={})",
        interval.as_secs(),
        service.config().max_items_per_user
    );

    let mut ticker = tokio::time::interval(interval);
    // First tick fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Feed trimmer stopping");
                    break;
                }
            }
            _ = ticker.tick() => {
                run_trim_cycle(&service).await;
            }
        }
    }
}

/// One trim pass with metrics. Failures are logged; the next tick retries.
pub async fn run_trim_cycle(service: &FeedService) -> Option<TrimReport> {
    let cycle_start = Instant::now();

    match service.trim_oversized_feeds().await {
        Ok(report) => {
            metrics::record_trim_run("success", cycle_start.elapsed());
            metrics::set_owners_over_limit(report.owners as i64);
            metrics::record_entries_pruned(report.entries_removed);
            if report.owners > 0 {
                tracing::info!(
                    owners = report.owners,
                    entries_removed = report.entries_removed,
                    duration_ms = cycle_start.elapsed().as_millis(),
                    "Feed trim cycle completed"
                );
            } else {
                tracing::debug!("No oversized feeds");
            }
            Some(report)
        }
        Err(e) => {
            metrics::record_trim_run("error", cycle_start.elapsed());
            tracing::error!(
                error = %e,
                duration_ms = cycle_start.elapsed().as_millis(),
                "Feed trim cycle failed"
            );
            None
        }
    }
}
