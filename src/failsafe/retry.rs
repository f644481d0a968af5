//! Retry policy for upstream OAuth calls

use std::future::Future;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use tracing::warn;

use crate::Error;

/// Fixed-delay retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between attempts
    pub delay: Duration,
    /// Retries after the first attempt
    pub max_retries: usize,
}

impl Default for RetryPolicy {
    /// One retry after one second
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            max_retries: 1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            delay: Duration::ZERO,
            max_retries: 0,
        }
    }

    fn backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.delay)
            .with_max_times(self.max_retries)
    }
}

/// Run `f`, retrying only errors for which [`Error::is_retryable`] holds.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once retries
/// are exhausted.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, name: &str, f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    f.retry(policy.backoff())
        .sleep(tokio::time::sleep)
        .when(Error::is_retryable)
        .notify(|err: &Error, delay: Duration| {
            warn!(
                operation = name,
                delay_ms = delay.as_millis(),
                error = %err,
                "Retrying after transient failure"
            );
        })
        .await
}
