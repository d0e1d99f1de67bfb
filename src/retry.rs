//! Bounded exponential backoff for provider calls.
//!
//! Workers wrap every mail and embedding call in [`with_backoff`], so a
//! rate-limit signal or a timeout pauses the worker instead of failing the
//! whole run. Fatal errors return immediately. Every wait adds a random
//! jitter of up to half the base delay.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::ProviderError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_ms: u64, max_ms: u64) -> Self {
        Self {
            max_retries,
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    /// `min(max, base * 2^attempt)`, attempt counted from 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Random extra wait in `[0, base / 2]`.
    pub fn jitter(&self) -> Duration {
        let max_ms = (self.base.as_millis() / 2) as u64;
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

/// Run `op` until it succeeds, fails fatally, or exhausts the policy.
///
/// A `RateLimited` error carrying `retry_after` waits at least that long.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let mut delay = policy.delay(attempt) + policy.jitter();
                if let ProviderError::RateLimited {
                    retry_after: Some(after),
                } = &err
                {
                    delay = delay.max(*after);
                }
                tracing::warn!(
                    operation = what,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying provider call"
                );
                tokio::time::sleep(delay).await;
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

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, 1, 5)
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(10, 500, 60_000);
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(4000));
        assert_eq!(policy.delay(20), Duration::from_millis(60_000));
    }

    #[test]
    fn test_jitter_stays_within_half_base() {
        let policy = RetryPolicy::new(3, 500, 60_000);
        for _ in 0..100 {
            assert!(policy.jitter() <= Duration::from_millis(250));
        }
        assert_eq!(RetryPolicy::new(3, 1, 5).jitter(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast(3), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProviderError::Transient("timeout".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&fast(2), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::RateLimited { retry_after: None })
        })
        .await;
        assert!(matches!(result, Err(ProviderError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&fast(5), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Fatal("400".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
