use crate::error::Result;
use std::future::Future;
use std::time::Duration;

/// Attempts per read operation, including the first.
pub const MAX_ATTEMPTS: u32 = 5;
/// Fixed delay between attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Runs a read operation, retrying on transient (connection-level) failures
/// with a fixed delay. Any other failure, and exhaustion, surface the last
/// error unchanged. Write operations must not go through here: a timed-out
/// write may have been applied, and repeating it is not safe.
pub async fn with_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                tracing::warn!(
                    op = op_name,
                    attempt,
                    error = %err,
                    "transient error, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
