//! Immediate, bounded retry of transient store failures.

use std::future::Future;

use tracing::warn;

use crate::error::StoreResult;

/// Run `op` until it succeeds, fails with a non-transient error, or has
/// been attempted `max_attempts` times. Retries are immediate; persisted
/// backoff is the job store's concern, not this helper's.
pub async fn with_retries<T, F, Fut>(max_attempts: u32, what: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!(operation = what, attempt, max_attempts, error = %e, "transient store error, retrying");
                attempt += 1;
                tokio::task::yield_now().await;
            }
            other => return other,
        }
    }
}
