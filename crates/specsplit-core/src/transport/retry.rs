//! Bounded retry with a fixed backoff.
//!
//! Connection establishment on the draft side uses a fixed attempt budget and
//! a short fixed delay between attempts, so the worst-case time to give up is
//! predictable: `(max_attempts - 1) * backoff` plus the attempts themselves.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: Duration,
}

impl RetryConfig {
    /// Fixed-delay retry policy.
    pub fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Attempts actually made; a zero budget still tries once.
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Statistics about a retry operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Number of attempts made.
    pub attempts: u32,
    /// Total delay slept between attempts.
    pub total_delay: Duration,
}

/// Retry an async operation until it succeeds, hits a non-retryable error,
/// or runs out of attempts.
///
/// Returns the final result together with the attempt statistics.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut stats = RetryStats::default();
    let max_attempts = config.effective_attempts();

    loop {
        stats.attempts += 1;

        let err = match operation().await {
            Ok(value) => {
                if stats.attempts > 1 {
                    debug!("Operation succeeded after {} attempts", stats.attempts);
                }
                return (Ok(value), stats);
            }
            Err(e) => e,
        };

        if !should_retry(&err) {
            debug!("Error is not retryable: {}", err);
            return (Err(err), stats);
        }

        if stats.attempts >= max_attempts {
            warn!(
                "All {} attempts exhausted. Last error: {}",
                max_attempts, err
            );
            return (Err(err), stats);
        }

        debug!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            stats.attempts, max_attempts, err, config.backoff
        );
        tokio::time::sleep(config.backoff).await;
        stats.total_delay += config.backoff;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_zero_budget_still_tries_once() {
        assert_eq!(RetryConfig::fixed(0, Duration::ZERO).effective_attempts(), 1);
        assert_eq!(RetryConfig::fixed(4, Duration::ZERO).effective_attempts(), 4);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let config = RetryConfig::fixed(3, Duration::from_millis(5));
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let (result, stats) = retry_async(
            &config,
            || {
                let counter = counter_clone.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("refused".to_string())
                    } else {
                        Ok(42)
                    }
                }
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.total_delay, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_retry_stops_at_budget() {
        let config = RetryConfig::fixed(4, Duration::from_millis(1));
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let (result, stats) = retry_async(
            &config,
            || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                async { Err::<i32, _>("refused".to_string()) }
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(result.unwrap_err(), "refused");
        assert_eq!(stats.attempts, 4);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(stats.total_delay, Duration::from_millis(3));
    }

    #[tokio::test]
    async fn test_retry_non_retryable_error() {
        let config = RetryConfig::fixed(3, Duration::from_millis(1));

        let (result, stats) = retry_async(
            &config,
            || async { Err::<i32, _>("bad address".to_string()) },
            |e: &String| !e.contains("bad address"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.total_delay, Duration::ZERO);
    }
}
