//! Exponential backoff for SQLite lock contention.

use crate::error::{StoreError, StoreResult};
use std::future::Future;
use std::time::{Duration, Instant};

const INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 1000;

/// Retry `operation` while it fails with a lock conflict.
///
/// Backoff starts at 10 ms and doubles up to 1 s. Once `max_wait_ms` has
/// elapsed the conflict is surfaced as [`StoreError::PersistenceConflict`].
/// Any other error is returned immediately.
pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt: u32 = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    let elapsed_ms = start_time.elapsed().as_millis();
                    if elapsed_ms > 2000 {
                        tracing::warn!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms,
                            "Store write succeeded after a long retry period"
                        );
                    } else {
                        tracing::debug!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms,
                            "Store write succeeded after retry"
                        );
                    }
                }
                return Ok(value);
            }
            Err(err) if !err.is_lock_conflict() => return Err(err),
            Err(_) => {
                let elapsed = start_time.elapsed();
                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis(),
                        max_wait_ms,
                        "Store still locked, giving up"
                    );
                    return Err(StoreError::PersistenceConflict {
                        operation: operation_name.to_string(),
                        attempts: attempt,
                        elapsed_ms: elapsed.as_millis(),
                    });
                }

                let remaining = max_duration.saturating_sub(elapsed);
                let delay = Duration::from_millis(backoff_ms).min(remaining);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    elapsed_ms = elapsed.as_millis(),
                    backoff_ms = delay.as_millis(),
                    remaining_ms = remaining.as_millis(),
                    "Store locked, retrying after backoff"
                );

                tokio::time::sleep(delay).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn locked() -> StoreError {
        StoreError::Database(sqlx::Error::Protocol("database is locked".to_string()))
    }

    #[tokio::test]
    async fn test_retries_until_lock_clears() {
        let calls = AtomicU32::new(0);

        let value = retry_on_lock("test write", 5_000, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(locked())
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);

        let err = retry_on_lock("test write", 5_000, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(StoreError::Database(sqlx::Error::RowNotFound)) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StoreError::Database(sqlx::Error::RowNotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_persistence_conflict() {
        let err = retry_on_lock("test write", 40, || async { Err::<(), _>(locked()) })
            .await
            .unwrap_err();

        match err {
            StoreError::PersistenceConflict {
                operation,
                attempts,
                ..
            } => {
                assert_eq!(operation, "test write");
                assert!(attempts >= 2);
            }
            other => panic!("expected persistence conflict, got {:?}", other),
        }
    }
}
