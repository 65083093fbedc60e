//! Bounded retry for provider and mailbox calls

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed(Duration),
    /// Start at `initial`, double after each retry, never above `max`
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    fn first(&self) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, .. } => initial,
        }
    }

    fn next(&self, current: Duration) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { max, .. } => std::cmp::min(current * 2, max),
        }
    }
}

/// Run `operation`, retrying transient errors up to `max_retries` times.
/// Permanent errors are returned on the first failure.
pub async fn with_retry<T, F, Fut>(
    operation_name: &str,
    max_retries: u32,
    backoff: Backoff,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = backoff.first();
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_permanent() || attempts > max_retries => return Err(e),
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name,
                    attempts,
                    max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = backoff.next(delay);
            }
        }
    }
}
