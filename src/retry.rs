use crate::credentials::Tier;
use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How many times to try an LLM call and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(2000),
            multiplier: 1.5,
        }
    }
}

impl RetryPolicy {
    /// Free keys rotate on their own, so they only get a flat pause; the
    /// primary key backs off from 2s by a factor of 1.5.
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Free => Self {
                multiplier: 1.0,
                ..Self::default()
            },
            Tier::Primary => Self::default(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor)
    }
}

/// Run `operation` until it succeeds, fails with something other than a
/// transient overload, or runs out of attempts.
pub async fn call_with_retry<F, Fut, T>(policy: RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying: {err}"
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
    use crate::error::{Error, ServiceError};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn retries_overload_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let value = call_with_retry(fast(3), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::from(ServiceError::from_status("gemini", 503, "overloaded")))
                } else {
                    Ok("script")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, "script");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let err = call_with_retry(fast(2), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::from(ServiceError::from_status("gemini", 503, "busy")))
            }
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn circuit_open_is_never_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let err = call_with_retry(fast(5), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::CircuitOpen {
                    context: "llm".into(),
                    failures: 5,
                    last_failure: "quota".into(),
                })
            }
        })
        .await
        .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delays_grow_by_tier() {
        let primary = RetryPolicy::for_tier(Tier::Primary);
        assert_eq!(primary.delay_for(1), Duration::from_millis(2000));
        assert_eq!(primary.delay_for(2), Duration::from_millis(3000));
        assert_eq!(primary.delay_for(3), Duration::from_millis(4500));

        let free = RetryPolicy::for_tier(Tier::Free);
        assert_eq!(free.delay_for(3), Duration::from_millis(2000));
    }
}
