//! Bounded exponential backoff for capability and store calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Retry policy: `max_attempts` total tries, delay doubling from
/// `base_delay` between them.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before the given retry (attempt 0 is the first try, no delay).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.base_delay * 2u32.saturating_pow(attempt - 1)
        }
    }
}

/// Run `op` under the policy. `is_transient` gates which errors are retried;
/// non-transient errors surface immediately.
pub async fn with_backoff<T, E, F, Fut>(
    policy: BackoffPolicy,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> std::result::Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        let delay = policy.delay_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < policy.max_attempts && is_transient(&err) => {
                warn!(attempt, error = %err, "transient failure, retrying");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::new(3, Duration::from_millis(1));

        let result: Result<u32, String> = with_backoff(policy, |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::new(3, Duration::from_millis(1));

        let result: Result<(), String> = with_backoff(policy, |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("still broken".to_string()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::new(5, Duration::from_millis(1));

        let result: Result<(), String> = with_backoff(policy, |_| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("caller error".to_string()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_doubles() {
        let policy = BackoffPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }
}
