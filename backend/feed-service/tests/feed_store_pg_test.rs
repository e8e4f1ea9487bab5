//! PostgreSQL feed store
//!
//! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`.

use chrono::{Duration, TimeZone, Utc};
use sqlx::PgPool;

use feed_service::db::{create_pool, FeedStore, PgFeedStore, MIGRATOR};
use feed_service::models::FeedEntry;

async fn store() -> PgFeedStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = create_pool(&url, 5).await.expect("connect");
    MIGRATOR.run(&pool).await.expect("migrations");
    PgFeedStore::new(pool)
}

/// Owner ids unlikely to collide across runs
fn owner(offset: i64) -> i64 {
    Utc::now().timestamp_micros() * 10 + offset
}

async fn cleanup(pool: &PgPool, owners: &[i64]) {
    sqlx::query("DELETE FROM feed_items WHERE owner_id = ANY($1)")
        .bind(owners)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("DELETE FROM feed_metadata WHERE owner_id = ANY($1)")
        .bind(owners)
        .execute(pool)
        .await
        .unwrap();
}

fn entry(owner_id: i64, post_id: &str, author_id: i64, minute: i64) -> FeedEntry {
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    FeedEntry::new(owner_id, post_id, author_id, base + Duration::minutes(minute))
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn append_is_idempotent() {
    let store = store().await;
    let owners: Vec<i64> = (0..3).map(owner).collect();
    let entries: Vec<FeedEntry> = owners.iter().map(|o| entry(*o, "p1", 99, 0)).collect();

    assert_eq!(store.append_entries(&entries).await.unwrap(), 3);
    assert_eq!(store.append_entries(&entries).await.unwrap(), 0);
    for o in &owners {
        assert_eq!(store.count_entries(*o).await.unwrap(), 1);
    }

    cleanup(store.pool(), &owners).await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn duplicate_pairs_within_one_batch_are_stored_once() {
    let store = store().await;
    let o = owner(3);

    let inserted = store
        .append_entries(&[entry(o, "p1", 1, 0), entry(o, "p1", 1, 5), entry(o, "p2", 1, 1)])
        .await
        .unwrap();

    assert_eq!(inserted, 2);
    assert_eq!(store.count_entries(o).await.unwrap(), 2);

    cleanup(store.pool(), &[o]).await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn author_removal_is_exact_and_replayable() {
    let store = store().await;
    let o = owner(4);
    store
        .append_entries(&[
            entry(o, "a1", 1, 0),
            entry(o, "a2", 1, 1),
            entry(o, "b1", 2, 2),
        ])
        .await
        .unwrap();
    store.mark_rebuilt(o, 3).await.unwrap();

    assert_eq!(store.remove_entries_by_author(o, 1).await.unwrap(), 2);
    assert_eq!(store.remove_entries_by_author(o, 1).await.unwrap(), 0);
    assert_eq!(store.count_entries(o).await.unwrap(), 1);
    assert_eq!(store.get_metadata(o).await.unwrap().unwrap().entry_count, 1);

    cleanup(store.pool(), &[o]).await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn listing_is_newest_first_and_prune_drops_oldest() {
    let store = store().await;
    let o = owner(5);
    store
        .append_entries(&[
            entry(o, "p2", 1, 2),
            entry(o, "p0", 1, 0),
            entry(o, "p3", 1, 3),
            entry(o, "p1", 1, 1),
        ])
        .await
        .unwrap();

    let listed = store.list_entries(o, 10, 0).await.unwrap();
    for pair in listed.windows(2) {
        assert!(pair[0].post_created_at >= pair[1].post_created_at);
    }
    let page: Vec<String> = store
        .list_entries(o, 2, 1)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.post_id)
        .collect();
    assert_eq!(page, vec!["p2", "p1"]);

    let over = store.owners_over_limit(2, 100).await.unwrap();
    assert!(over.contains(&o));

    assert_eq!(store.prune_excess(o, 2).await.unwrap(), 2);
    let kept: Vec<String> = store
        .list_entries(o, 10, 0)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.post_id)
        .collect();
    assert_eq!(kept, vec!["p3", "p2"]);

    cleanup(store.pool(), &[o]).await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn metadata_lifecycle() {
    let store = store().await;
    let o = owner(6);
    let post_id = format!("lifecycle-{}", o);

    assert!(store.get_metadata(o).await.unwrap().is_none());

    store.append_entries(&[entry(o, &post_id, 1, 0)]).await.unwrap();
    store.mark_stale(o).await.unwrap();
    let meta = store.get_metadata(o).await.unwrap().unwrap();
    assert!(meta.is_stale);
    assert_eq!(meta.entry_count, 1);
    assert!(meta.last_rebuilt_at.is_none());

    let meta = store.mark_rebuilt(o, 1).await.unwrap();
    assert!(!meta.is_stale);
    assert!(meta.last_rebuilt_at.is_some());

    let meta = store.upsert_metadata(o, None, Some(true)).await.unwrap();
    assert!(meta.is_stale);
    assert_eq!(meta.entry_count, 1);

    assert_eq!(store.remove_entries_by_post(&post_id).await.unwrap(), 1);
    assert_eq!(store.get_metadata(o).await.unwrap().unwrap().entry_count, 0);

    cleanup(store.pool(), &[o]).await;
}
