/// Feed Repository
///
/// Durable per-user feeds (`feed_items`) and their bookkeeping
/// (`feed_metadata`). The table is the source of truth for every feed; the
/// Redis index is only ever a projection of it.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::BTreeSet;
use tracing::{debug, error};

use crate::error::StoreError;
use crate::models::{FeedEntry, FeedMetadata};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Rows per bulk insert statement
const INSERT_CHUNK_SIZE: usize = 5_000;

#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Insert entries, skipping any (owner, post) pair already present.
    /// Returns the owner of every row actually inserted.
    async fn insert_entries(&self, entries: &[FeedEntry]) -> StoreResult<Vec<i64>>;

    /// Number of rows actually inserted.
    async fn append_entries(&self, entries: &[FeedEntry]) -> StoreResult<u64> {
        Ok(self.insert_entries(entries).await?.len() as u64)
    }

    /// Remove a post from every feed that contains it.
    async fn remove_entries_by_post(&self, post_id: &str) -> StoreResult<u64>;

    /// Remove every entry by `author_id` from `owner_id`'s feed.
    async fn remove_entries_by_author(&self, owner_id: i64, author_id: i64) -> StoreResult<u64>;

    /// Newest first: `post_created_at DESC, rank_score DESC`.
    async fn list_entries(&self, owner_id: i64, limit: i64, offset: i64)
        -> StoreResult<Vec<FeedEntry>>;

    async fn count_entries(&self, owner_id: i64) -> StoreResult<i64>;

    /// Keep the newest `max_entries` entries of a feed, delete the rest.
    async fn prune_excess(&self, owner_id: i64, max_entries: i64) -> StoreResult<u64>;

    async fn get_metadata(&self, owner_id: i64) -> StoreResult<Option<FeedMetadata>>;

    /// Create or merge metadata. A `None` entry count is recomputed from the
    /// table; a `None` stale flag keeps its current value (false on create).
    async fn upsert_metadata(
        &self,
        owner_id: i64,
        entry_count: Option<i64>,
        is_stale: Option<bool>,
    ) -> StoreResult<FeedMetadata>;

    /// Flag a feed for rebuild without touching its entry count.
    async fn mark_stale(&self, owner_id: i64) -> StoreResult<()>;

    /// Record a completed rebuild.
    async fn mark_rebuilt(&self, owner_id: i64, entry_count: i64) -> StoreResult<FeedMetadata>;

    /// Owners whose feed holds more than `max_entries`, largest first.
    async fn owners_over_limit(&self, max_entries: i64, limit: i64) -> StoreResult<Vec<i64>>;

    async fn health_check(&self) -> StoreResult<()>;
}

#[derive(Clone)]
pub struct PgFeedStore {
    pool: PgPool,
}

impl PgFeedStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Bring `entry_count` in line with the table for owners that have metadata.
    async fn refresh_entry_counts(&self, owner_ids: &[i64]) -> StoreResult<()> {
        if owner_ids.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE feed_metadata m
            SET entry_count = (
                    SELECT COUNT(*) FROM feed_items f WHERE f.owner_id = m.owner_id
                ),
                updated_at = NOW()
            WHERE m.owner_id = ANY($1)
            "#,
        )
        .bind(owner_ids)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to refresh feed entry counts: {}", e);
            StoreError::from(e)
        })?;

        Ok(())
    }
}

fn distinct(ids: Vec<i64>) -> Vec<i64> {
    ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

#[async_trait]
impl FeedStore for PgFeedStore {
    async fn insert_entries(&self, entries: &[FeedEntry]) -> StoreResult<Vec<i64>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut inserted_owners = Vec::new();

        for chunk in entries.chunks(INSERT_CHUNK_SIZE) {
            let owner_ids: Vec<i64> = chunk.iter().map(|e| e.owner_id).collect();
            let post_ids: Vec<String> = chunk.iter().map(|e| e.post_id.clone()).collect();
            let author_ids: Vec<i64> = chunk.iter().map(|e| e.author_id).collect();
            let created: Vec<DateTime<Utc>> = chunk.iter().map(|e| e.post_created_at).collect();
            let scores: Vec<f64> = chunk.iter().map(|e| e.rank_score).collect();
            let ingested: Vec<DateTime<Utc>> = chunk.iter().map(|e| e.ingested_at).collect();

            let owners = sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO feed_items
                    (owner_id, post_id, author_id, post_created_at, rank_score, ingested_at)
                SELECT * FROM UNNEST(
                    $1::BIGINT[], $2::VARCHAR[], $3::BIGINT[],
                    $4::TIMESTAMPTZ[], $5::DOUBLE PRECISION[], $6::TIMESTAMPTZ[]
                )
                ON CONFLICT (owner_id, post_id) DO NOTHING
                RETURNING owner_id
                "#,
            )
            .bind(&owner_ids)
            .bind(&post_ids)
            .bind(&author_ids)
            .bind(&created)
            .bind(&scores)
            .bind(&ingested)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!(rows = chunk.len(), "Failed to append feed entries: {}", e);
                StoreError::from(e)
            })?;

            inserted_owners.extend(owners);
        }

        debug!(
            requested = entries.len(),
            inserted = inserted_owners.len(),
            "Appended feed entries"
        );

        self.refresh_entry_counts(&distinct(inserted_owners.clone())).await?;
        Ok(inserted_owners)
    }

    async fn remove_entries_by_post(&self, post_id: &str) -> StoreResult<u64> {
        let owners = sqlx::query_scalar::<_, i64>(
            r#"
            DELETE FROM feed_items
            WHERE post_id = $1
            RETURNING owner_id
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await?;

        let removed = owners.len() as u64;
        self.refresh_entry_counts(&distinct(owners)).await?;
        Ok(removed)
    }

    async fn remove_entries_by_author(&self, owner_id: i64, author_id: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM feed_items
            WHERE owner_id = $1 AND author_id = $2
            "#,
        )
        .bind(owner_id)
        .bind(author_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            self.refresh_entry_counts(&[owner_id]).await?;
        }
        Ok(result.rows_affected())
    }

    async fn list_entries(
        &self,
        owner_id: i64,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<FeedEntry>> {
        let entries = sqlx::query_as::<_, FeedEntry>(
            r#"
            SELECT owner_id, post_id, author_id, post_created_at, rank_score, ingested_at
            FROM feed_items
            WHERE owner_id = $1
            ORDER BY post_created_at DESC, rank_score DESC, post_id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(owner_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn count_entries(&self, owner_id: i64) -> StoreResult<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM feed_items WHERE owner_id = $1")
                .bind(owner_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    async fn prune_excess(&self, owner_id: i64, max_entries: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM feed_items
            WHERE id IN (
                SELECT id FROM feed_items
                WHERE owner_id = $1
                ORDER BY post_created_at DESC, rank_score DESC, post_id DESC
                OFFSET $2
            )
            "#,
        )
        .bind(owner_id)
        .bind(max_entries.max(0))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!(
                owner_id,
                removed = result.rows_affected(),
                "Pruned feed above ceiling"
            );
            self.refresh_entry_counts(&[owner_id]).await?;
        }
        Ok(result.rows_affected())
    }

    async fn get_metadata(&self, owner_id: i64) -> StoreResult<Option<FeedMetadata>> {
        let metadata = sqlx::query_as::<_, FeedMetadata>(
            r#"
            SELECT owner_id, last_rebuilt_at, entry_count, is_stale, updated_at
            FROM feed_metadata
            WHERE owner_id = $1
            "#,
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(metadata)
    }

    async fn upsert_metadata(
        &self,
        owner_id: i64,
        entry_count: Option<i64>,
        is_stale: Option<bool>,
    ) -> StoreResult<FeedMetadata> {
        let metadata = sqlx::query_as::<_, FeedMetadata>(
            r#"
            INSERT INTO feed_metadata (owner_id, entry_count, is_stale, updated_at)
            VALUES (
                $1,
                COALESCE($2::BIGINT, (SELECT COUNT(*) FROM feed_items WHERE owner_id = $1)),
                COALESCE($3::BOOLEAN, FALSE),
                NOW()
            )
            ON CONFLICT (owner_id) DO UPDATE SET
                entry_count = EXCLUDED.entry_count,
                is_stale = COALESCE($3::BOOLEAN, feed_metadata.is_stale),
                updated_at = NOW()
            RETURNING owner_id, last_rebuilt_at, entry_count, is_stale, updated_at
            "#,
        )
        .bind(owner_id)
        .bind(entry_count)
        .bind(is_stale)
        .fetch_one(&self.pool)
        .await?;

        Ok(metadata)
    }

    async fn mark_stale(&self, owner_id: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO feed_metadata (owner_id, entry_count, is_stale, updated_at)
            VALUES ($1, (SELECT COUNT(*) FROM feed_items WHERE owner_id = $1), TRUE, NOW())
            ON CONFLICT (owner_id) DO UPDATE SET
                is_stale = TRUE,
                updated_at = NOW()
            "#,
        )
        .bind(owner_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_rebuilt(&self, owner_id: i64, entry_count: i64) -> StoreResult<FeedMetadata> {
        let metadata = sqlx::query_as::<_, FeedMetadata>(
            r#"
            INSERT INTO feed_metadata
                (owner_id, last_rebuilt_at, entry_count, is_stale, updated_at)
            VALUES ($1, NOW(), $2, FALSE, NOW())
            ON CONFLICT (owner_id) DO UPDATE SET
                last_rebuilt_at = NOW(),
                entry_count = EXCLUDED.entry_count,
                is_stale = FALSE,
                updated_at = NOW()
            RETURNING owner_id, last_rebuilt_at, entry_count, is_stale, updated_at
            "#,
        )
        .bind(owner_id)
        .bind(entry_count)
        .fetch_one(&self.pool)
        .await?;

        Ok(metadata)
    }

    async fn owners_over_limit(&self, max_entries: i64, limit: i64) -> StoreResult<Vec<i64>> {
        let owners = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT owner_id
            FROM feed_items
            GROUP BY owner_id
            HAVING COUNT(*) > $1
            ORDER BY COUNT(*) DESC
            LIMIT $2
            "#,
        )
        .bind(max_entries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(owners)
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
