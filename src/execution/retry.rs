use std::future::Future;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::ConnectorError;

/// Run a connector call, retrying transient failures with exponential backoff.
///
/// `call` receives the 1-based attempt number. Non-transient errors are returned as-is
/// on the first occurrence; a transient error on the last attempt becomes
/// `ConnectorError::RetriesExhausted`.
pub async fn with_retries<T, F, Fut>(config: &RetryConfig, operation: &str, mut call: F) -> Result<T, ConnectorError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ConnectorError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call(attempt).await {
            Ok(value) => return Ok(value),
            Err(ConnectorError::Transient(message)) if attempt < max_attempts => {
                let delay = config.backoff_for(attempt);
                warn!(operation, attempt, ?delay, "Transient connector failure, retrying: {}", message);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(ConnectorError::Transient(message)) => {
                return Err(ConnectorError::RetriesExhausted {
                    attempts: attempt,
                    last: message,
                })
            }
            Err(other) => return Err(other),
        }
    }
}
