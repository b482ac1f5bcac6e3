//! Timeout utilities.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Run an operation with a timeout.
///
/// The worker never retries on its own; a timed-out operation is reported
/// once and the caller decides the fallback.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> crate::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| {
            debug!(?timeout, "Operation timed out");
            crate::PulseError::Timeout(timeout)
        })
}
