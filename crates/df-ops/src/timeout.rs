//! Deadline wrapper for provider calls.

use crate::OperationError;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Run `fut` with a deadline; expiry is reported as a transient timeout.
pub async fn with_timeout<T, F>(timeout_ms: u64, fut: F) -> Result<T, OperationError>
where
    F: Future<Output = Result<T, OperationError>>,
{
    match timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(OperationError::Timeout(timeout_ms)),
    }
}
