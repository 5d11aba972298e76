//! In-process bucket store.
//!
//! Each bucket is its own small lock behind an `Arc`. The map lock is only
//! taken for writing when a new key appears, so uploads touching existing
//! disjoint keys never wait on one another.

use super::{ApplyOutcome, BucketStore};
use crate::auth::AttemptLedger;
use crate::error::StoreResult;
use crate::models::{
    AggregateBucket, AggregationResult, BucketCounts, BucketKey, TrendBucket, TrendKey,
};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, RwLock};

/// One bucket's counters. All four move together, so a snapshot always
/// has `total == approved + denied + partial`.
#[derive(Debug, Default)]
struct SharedCounts(std::sync::Mutex<BucketCounts>);

impl SharedCounts {
    fn add(&self, delta: &BucketCounts) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(delta);
    }

    fn snapshot(&self) -> BucketCounts {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type CounterMap<K> = RwLock<HashMap<K, Arc<SharedCounts>>>;

/// Bucket store living in process memory. Used for `--memory` and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: CounterMap<BucketKey>,
    trends: CounterMap<TrendKey>,
    ledger: Mutex<HashSet<String>>,
    attempts: Mutex<HashMap<(String, i64), u32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

async fn counter_for<K>(map: &CounterMap<K>, key: &K) -> Arc<SharedCounts>
where
    K: Eq + Hash + Clone,
{
    if let Some(counter) = map.read().await.get(key) {
        return Arc::clone(counter);
    }
    let mut guard = map.write().await;
    Arc::clone(guard.entry(key.clone()).or_default())
}

async fn snapshot<K>(map: &CounterMap<K>) -> Vec<(K, BucketCounts)>
where
    K: Ord + Clone,
{
    let guard = map.read().await;
    let mut rows: Vec<(K, BucketCounts)> = guard
        .iter()
        .map(|(key, counter)| (key.clone(), counter.snapshot()))
        .filter(|(_, counts)| !counts.is_empty())
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    rows
}

impl BucketStore for MemoryStore {
    async fn init(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn apply(&self, result: AggregationResult) -> StoreResult<ApplyOutcome> {
        if !self.ledger.lock().await.insert(result.fingerprint.clone()) {
            return Ok(ApplyOutcome::DuplicateUpload);
        }

        for (key, delta) in &result.bucket_deltas {
            counter_for(&self.buckets, key).await.add(delta);
        }
        for (key, delta) in &result.trend_deltas {
            counter_for(&self.trends, key).await.add(delta);
        }

        Ok(ApplyOutcome::Applied {
            buckets: result.bucket_deltas.len(),
            lines: result.lines_processed,
        })
    }

    async fn buckets(&self) -> StoreResult<Vec<AggregateBucket>> {
        Ok(snapshot(&self.buckets)
            .await
            .into_iter()
            .map(|(key, counts)| AggregateBucket { key, counts })
            .collect())
    }

    async fn trends(&self) -> StoreResult<Vec<TrendBucket>> {
        Ok(snapshot(&self.trends)
            .await
            .into_iter()
            .map(|(key, counts)| TrendBucket { key, counts })
            .collect())
    }

    async fn upload_count(&self) -> StoreResult<u64> {
        Ok(self.ledger.lock().await.len() as u64)
    }
}

impl AttemptLedger for MemoryStore {
    async fn record_attempt(&self, username: &str, window_start: i64) -> StoreResult<u32> {
        let mut attempts = self.attempts.lock().await;
        attempts.retain(|(_, start), _| *start >= window_start);
        let count = attempts
            .entry((username.to_string(), window_start))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }
}
