//! SQLite bucket store.
//!
//! Every upload is one short write transaction: the ledger insert comes
//! first, then one upsert per bucket. SQLite serializes writers, and each
//! upsert adds to the stored counters inside the database, so concurrent
//! uploads never lose an increment.

use super::retry::retry_on_lock;
use super::{ApplyOutcome, BucketStore};
use crate::auth::AttemptLedger;
use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::models::{
    AggregateBucket, AggregationResult, BucketCounts, BucketKey, TrendBucket, TrendKey,
};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Stored in place of a missing denial reason; the column is part of the key.
const NO_REASON: &str = "";

type CountsRow = (i64, i64, i64, i64);

fn counts_from_row((total, approved, denied, partial): CountsRow) -> BucketCounts {
    BucketCounts {
        total: total.max(0) as u64,
        approved: approved.max(0) as u64,
        denied: denied.max(0) as u64,
        partial: partial.max(0) as u64,
    }
}

/// Bucket store backed by a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path`.
    ///
    /// Does not create the schema; call [`BucketStore::init`] once before use.
    pub async fn open(path: &Path, config: &StoreConfig) -> StoreResult<Self> {
        let newly_created = !path.exists();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        if newly_created {
            info!("Created new store: {}", path.display());
        } else {
            info!("Opened existing store: {}", path.display());
        }

        Ok(Self::from_pool(pool, config.max_lock_wait_ms))
    }

    pub fn from_pool(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            max_lock_wait_ms,
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn apply_once(&self, result: &AggregationResult) -> StoreResult<ApplyOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Write first, so the transaction takes the write lock up front.
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO uploads (fingerprint, format, lines_processed, lines_skipped, applied_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&result.fingerprint)
        .bind(result.format.to_string())
        .bind(result.lines_processed as i64)
        .bind(result.lines_skipped as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(ApplyOutcome::DuplicateUpload);
        }

        for (key, delta) in &result.bucket_deltas {
            sqlx::query(
                r#"
                INSERT INTO aggregate_buckets
                    (payer, state, cpt_code, denial_reason, total, approved, denied, partial, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (payer, state, cpt_code, denial_reason) DO UPDATE SET
                    total = total + excluded.total,
                    approved = approved + excluded.approved,
                    denied = denied + excluded.denied,
                    partial = partial + excluded.partial,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&key.payer)
            .bind(&key.state)
            .bind(&key.cpt_code)
            .bind(key.denial_reason.as_deref().unwrap_or(NO_REASON))
            .bind(delta.total as i64)
            .bind(delta.approved as i64)
            .bind(delta.denied as i64)
            .bind(delta.partial as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        for (key, delta) in &result.trend_deltas {
            sqlx::query(
                r#"
                INSERT INTO trend_buckets
                    (state, service_month, total, approved, denied, partial, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (state, service_month) DO UPDATE SET
                    total = total + excluded.total,
                    approved = approved + excluded.approved,
                    denied = denied + excluded.denied,
                    partial = partial + excluded.partial,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&key.state)
            .bind(&key.service_month)
            .bind(delta.total as i64)
            .bind(delta.approved as i64)
            .bind(delta.denied as i64)
            .bind(delta.partial as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(ApplyOutcome::Applied {
            buckets: result.bucket_deltas.len(),
            lines: result.lines_processed,
        })
    }

    async fn record_attempt_once(&self, username: &str, window_start: i64) -> StoreResult<u32> {
        let mut tx = self.pool.begin().await?;

        let attempts: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO login_attempts (username, window_start, attempts)
            VALUES (?, ?, 1)
            ON CONFLICT (username, window_start) DO UPDATE SET
                attempts = attempts + 1
            RETURNING attempts
            "#,
        )
        .bind(username)
        .bind(window_start)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM login_attempts WHERE window_start < ?")
            .bind(window_start)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(attempts.clamp(0, i64::from(u32::MAX)) as u32)
    }
}

async fn create_uploads_table(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS uploads (
            fingerprint TEXT PRIMARY KEY,
            format TEXT NOT NULL,
            lines_processed INTEGER NOT NULL DEFAULT 0,
            lines_skipped INTEGER NOT NULL DEFAULT 0,
            applied_at TIMESTAMP NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_aggregate_buckets_table(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS aggregate_buckets (
            payer TEXT NOT NULL,
            state TEXT NOT NULL,
            cpt_code TEXT NOT NULL,
            denial_reason TEXT NOT NULL DEFAULT '',
            total INTEGER NOT NULL DEFAULT 0 CHECK (total >= 0),
            approved INTEGER NOT NULL DEFAULT 0 CHECK (approved >= 0),
            denied INTEGER NOT NULL DEFAULT 0 CHECK (denied >= 0),
            partial INTEGER NOT NULL DEFAULT 0 CHECK (partial >= 0),
            updated_at TIMESTAMP NOT NULL,
            PRIMARY KEY (payer, state, cpt_code, denial_reason)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_aggregate_buckets_cpt ON aggregate_buckets(cpt_code)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_trend_buckets_table(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trend_buckets (
            state TEXT NOT NULL,
            service_month TEXT NOT NULL,
            total INTEGER NOT NULL DEFAULT 0 CHECK (total >= 0),
            approved INTEGER NOT NULL DEFAULT 0 CHECK (approved >= 0),
            denied INTEGER NOT NULL DEFAULT 0 CHECK (denied >= 0),
            partial INTEGER NOT NULL DEFAULT 0 CHECK (partial >= 0),
            updated_at TIMESTAMP NOT NULL,
            PRIMARY KEY (state, service_month)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_login_attempts_table(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS login_attempts (
            username TEXT NOT NULL,
            window_start INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (username, window_start)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

impl BucketStore for SqliteStore {
    async fn init(&self) -> StoreResult<()> {
        create_uploads_table(&self.pool).await?;
        create_aggregate_buckets_table(&self.pool).await?;
        create_trend_buckets_table(&self.pool).await?;
        create_login_attempts_table(&self.pool).await?;
        Ok(())
    }

    async fn apply(&self, result: AggregationResult) -> StoreResult<ApplyOutcome> {
        let result = &result;
        retry_on_lock("apply upload", self.max_lock_wait_ms, || self.apply_once(result)).await
    }

    async fn buckets(&self) -> StoreResult<Vec<AggregateBucket>> {
        let rows: Vec<(String, String, String, String, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT payer, state, cpt_code, denial_reason, total, approved, denied, partial
            FROM aggregate_buckets
            WHERE total > 0
            ORDER BY payer, state, cpt_code, denial_reason
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(payer, state, cpt_code, reason, total, approved, denied, partial)| {
                    AggregateBucket {
                        key: BucketKey {
                            payer,
                            state,
                            cpt_code,
                            denial_reason: Some(reason).filter(|r| r != NO_REASON),
                        },
                        counts: counts_from_row((total, approved, denied, partial)),
                    }
                },
            )
            .collect())
    }

    async fn trends(&self) -> StoreResult<Vec<TrendBucket>> {
        let rows: Vec<(String, String, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT state, service_month, total, approved, denied, partial
            FROM trend_buckets
            WHERE total > 0
            ORDER BY state, service_month
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(state, service_month, total, approved, denied, partial)| TrendBucket {
                    key: TrendKey {
                        state,
                        service_month,
                    },
                    counts: counts_from_row((total, approved, denied, partial)),
                },
            )
            .collect())
    }

    async fn upload_count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM uploads")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

impl AttemptLedger for SqliteStore {
    async fn record_attempt(&self, username: &str, window_start: i64) -> StoreResult<u32> {
        retry_on_lock("record login attempt", self.max_lock_wait_ms, || {
            self.record_attempt_once(username, window_start)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{single_line_upload, split_csv};
    use super::super::{apply_aggregation, MemoryStore};
    use super::*;
    use crate::ingest::parse_and_aggregate;
    use crate::models::ClaimStatus;
    use std::sync::Arc;
    use tempfile::TempDir;

    const FIXTURE_CSV: &str = include_str!("../../fixtures/denials.csv");
    const FIXTURE_835: &str = include_str!("../../fixtures/sample.835");

    async fn open_store(dir: &TempDir) -> SqliteStore {
        let config = StoreConfig {
            max_lock_wait_ms: 10_000,
            ..StoreConfig::default()
        };
        let store = SqliteStore::open(&dir.path().join("stats.db"), &config)
            .await
            .unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.init().await.unwrap();
        store.init().await.unwrap();
        assert_eq!(store.upload_count().await.unwrap(), 0);
        assert!(store.buckets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_matches_memory_store() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let memory = MemoryStore::new();

        for (text, ext) in [(FIXTURE_835, "835"), (FIXTURE_CSV, "csv")] {
            apply_aggregation(parse_and_aggregate(text.as_bytes(), ext).unwrap(), &store)
                .await
                .unwrap();
            apply_aggregation(parse_and_aggregate(text.as_bytes(), ext).unwrap(), &memory)
                .await
                .unwrap();
        }

        assert_eq!(store.buckets().await.unwrap(), memory.buckets().await.unwrap());
        assert_eq!(store.trends().await.unwrap(), memory.trends().await.unwrap());
        assert_eq!(store.upload_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_none_reason_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let key = BucketKey::new("HUMANA", "KY", "90834", None);

        store
            .apply(single_line_upload("approved", &key, ClaimStatus::Approved))
            .await
            .unwrap();

        let buckets = store.buckets().await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].key, key);
    }

    #[tokio::test]
    async fn test_duplicate_upload_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let first = store
            .apply(parse_and_aggregate(FIXTURE_835.as_bytes(), "835").unwrap())
            .await
            .unwrap();
        let before = store.buckets().await.unwrap();
        let second = store
            .apply(parse_and_aggregate(FIXTURE_835.as_bytes(), "835").unwrap())
            .await
            .unwrap();

        assert!(matches!(first, ApplyOutcome::Applied { .. }));
        assert_eq!(second, ApplyOutcome::DuplicateUpload);
        assert_eq!(store.buckets().await.unwrap(), before);
        assert_eq!(store.upload_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_split_uploads_equal_one_combined_upload() {
        let dir = TempDir::new().unwrap();
        let split = open_store(&dir).await;
        let combined_dir = TempDir::new().unwrap();
        let combined = open_store(&combined_dir).await;

        let (first, second) = split_csv(FIXTURE_CSV, 4);
        split
            .apply(parse_and_aggregate(second.as_bytes(), "csv").unwrap())
            .await
            .unwrap();
        split
            .apply(parse_and_aggregate(first.as_bytes(), "csv").unwrap())
            .await
            .unwrap();
        combined
            .apply(parse_and_aggregate(FIXTURE_CSV.as_bytes(), "csv").unwrap())
            .await
            .unwrap();

        assert_eq!(split.buckets().await.unwrap(), combined.buckets().await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_uploads_on_one_key() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open_store(&dir).await);
        let key = BucketKey::new("AETNA", "IL", "90837", Some("CO-16"));

        let handles: Vec<_> = (0..24)
            .map(|i| {
                let store = Arc::clone(&store);
                let upload = single_line_upload(&format!("upload-{}", i), &key, ClaimStatus::Denied);
                tokio::spawn(async move { store.apply(upload).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let buckets = store.buckets().await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].counts.total, 24);
        assert_eq!(buckets[0].counts.denied, 24);
        assert_eq!(store.upload_count().await.unwrap(), 24);
    }

    #[tokio::test]
    async fn test_login_attempts_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir).await;
            assert_eq!(store.record_attempt("analyst", 600).await.unwrap(), 1);
            assert_eq!(store.record_attempt("analyst", 600).await.unwrap(), 2);
            store.close().await;
        }

        let reopened = open_store(&dir).await;
        assert_eq!(reopened.record_attempt("analyst", 600).await.unwrap(), 3);
        assert_eq!(reopened.record_attempt("billing", 600).await.unwrap(), 1);
        // a new window starts over and drops the old one
        assert_eq!(reopened.record_attempt("analyst", 660).await.unwrap(), 1);
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM login_attempts")
            .fetch_one(&reopened.pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_reopen_keeps_counts() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir).await;
            store
                .apply(parse_and_aggregate(FIXTURE_CSV.as_bytes(), "csv").unwrap())
                .await
                .unwrap();
            store.close().await;
        }

        let reopened = open_store(&dir).await;
        let totals: u64 = reopened
            .buckets()
            .await
            .unwrap()
            .iter()
            .map(|b| b.counts.total)
            .sum();
        assert_eq!(totals, 6);
        assert_eq!(reopened.upload_count().await.unwrap(), 1);
    }
}
