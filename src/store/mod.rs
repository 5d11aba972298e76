//! Aggregate bucket persistence.
//!
//! A store only ever holds counters keyed by de-identified dimensions plus a
//! ledger of upload fingerprints. Raw uploads and per-line detail are never
//! written.

pub mod memory;
pub mod retry;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreResult;
use crate::models::{AggregateBucket, AggregationResult, TrendBucket};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use tracing::{debug, info};

/// What happened when an upload was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Deltas were added to the store.
    Applied { buckets: usize, lines: u64 },
    /// The fingerprint was already in the ledger; nothing changed.
    DuplicateUpload,
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyOutcome::Applied { buckets, lines } => {
                write!(f, "applied {} lines to {} buckets", lines, buckets)
            }
            ApplyOutcome::DuplicateUpload => write!(f, "duplicate upload, nothing applied"),
        }
    }
}

/// Backing storage for aggregate counters.
///
/// Implementations must make each bucket increment atomic: two uploads
/// touching the same key never lose an increment.
pub trait BucketStore: Send + Sync {
    /// Create the schema. Safe to call more than once.
    fn init(&self) -> impl Future<Output = StoreResult<()>> + Send;

    /// Add one upload's deltas, unless its fingerprint was seen before.
    fn apply(
        &self,
        result: AggregationResult,
    ) -> impl Future<Output = StoreResult<ApplyOutcome>> + Send;

    /// All aggregate buckets, ordered by key.
    fn buckets(&self) -> impl Future<Output = StoreResult<Vec<AggregateBucket>>> + Send;

    /// All monthly trend buckets, ordered by key.
    fn trends(&self) -> impl Future<Output = StoreResult<Vec<TrendBucket>>> + Send;

    /// Number of uploads in the ledger.
    fn upload_count(&self) -> impl Future<Output = StoreResult<u64>> + Send;
}

/// Apply a parsed upload to a store.
///
/// Takes the result by value, so the same parse cannot be applied twice.
pub async fn apply_aggregation<S: BucketStore>(
    result: AggregationResult,
    store: &S,
) -> StoreResult<ApplyOutcome> {
    let fingerprint = short_fingerprint(&result.fingerprint).to_string();

    if result.is_empty() {
        debug!(upload = %fingerprint, "Upload has no deltas, recording in ledger only");
    }

    let outcome = store.apply(result).await?;
    match outcome {
        ApplyOutcome::Applied { buckets, lines } => {
            info!(upload = %fingerprint, buckets, lines, "Applied upload");
        }
        ApplyOutcome::DuplicateUpload => {
            info!(upload = %fingerprint, "Skipped duplicate upload");
        }
    }
    Ok(outcome)
}

/// First 12 hex digits, enough to tell uploads apart in logs.
pub fn short_fingerprint(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::models::{
        AggregationResult, BucketCounts, BucketKey, ClaimStatus, TrendKey, UploadFormat,
    };

    /// A one-line upload hitting a single bucket.
    pub fn single_line_upload(fingerprint: &str, key: &BucketKey, status: ClaimStatus) -> AggregationResult {
        AggregationResult {
            fingerprint: fingerprint.to_string(),
            format: UploadFormat::Csv,
            bucket_deltas: vec![(key.clone(), BucketCounts::of(status))],
            trend_deltas: vec![(
                TrendKey {
                    state: key.state.clone(),
                    service_month: "2024-03".to_string(),
                },
                BucketCounts::of(status),
            )],
            lines_processed: 1,
            lines_skipped: 0,
            skipped: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Split a CSV export into two uploads sharing its header row.
    pub fn split_csv(text: &str, first_rows: usize) -> (String, String) {
        let mut lines = text.lines();
        let header = lines.next().unwrap_or_default();
        let rows: Vec<&str> = lines.collect();
        let (a, b) = rows.split_at(first_rows.min(rows.len()));
        (
            format!("{}\n{}\n", header, a.join("\n")),
            format!("{}\n{}\n", header, b.join("\n")),
        )
    }
}
