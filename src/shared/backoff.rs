//! Exponential backoff with flood-wait awareness.
//!
//! Rate-limit signals are slept exactly as instructed and never consume a
//! retry credit; retryable errors back off `base * factor^attempt` clamped
//! to a ceiling; everything else bubbles up immediately.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::DomainError;
use crate::shared::config::RetrySettings;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        let defaults = Self::default();
        Self {
            max_retries: settings.max_retries.unwrap_or(defaults.max_retries),
            base_delay: settings
                .base_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.base_delay),
            max_delay: settings
                .max_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_delay),
            factor: settings.factor.unwrap_or(defaults.factor),
        }
    }

    /// Delay before retry number `attempt` (zero-based), clamped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `op` under the policy. Flood waits sleep the instructed seconds and
/// re-run without consuming an attempt; cancellation abandons remaining
/// attempts.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    context: &str,
    mut op: F,
) -> Result<T, DomainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DomainError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(DomainError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(DomainError::FloodWait { seconds }) => {
                warn!(context, wait_secs = seconds, "flood wait, sleeping");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                    _ = cancel.cancelled() => return Err(DomainError::Cancelled),
                }
            }
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                debug!(
                    context,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retryable error, backing off"
                );
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(DomainError::Cancelled),
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            factor: 2.0,
        }
    }

    #[test]
    fn test_delay_clamped_to_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
    }

    #[test]
    fn test_from_settings_fills_defaults() {
        let settings = RetrySettings { max_retries: Some(5), ..Default::default() };
        let policy = RetryPolicy::from_settings(&settings);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let result = with_retry(&fast_policy(), &CancellationToken::new(), "test", move || {
            let calls = Arc::clone(&calls_in);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DomainError::Gateway("transient".into()))
                } else {
                    Ok(7u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_bubbles_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let result: Result<(), _> =
            with_retry(&fast_policy(), &CancellationToken::new(), "test", move || {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(DomainError::Auth("nope".into()))
                }
            })
            .await;
        assert!(matches!(result, Err(DomainError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_flood_wait_does_not_consume_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        // One zero-second flood wait, then max_retries transient failures,
        // then success: only possible if the flood wait kept its credit.
        let policy = fast_policy();
        let result = with_retry(&policy, &CancellationToken::new(), "test", move || {
            let calls = Arc::clone(&calls_in);
            async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(DomainError::FloodWait { seconds: 0 }),
                    n if n <= 3 => Err(DomainError::Gateway("transient".into())),
                    _ => Ok(()),
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_exhausted_retries_returns_last_error() {
        let result: Result<(), _> =
            with_retry(&fast_policy(), &CancellationToken::new(), "test", || async {
                Err(DomainError::Gateway("always".into()))
            })
            .await;
        assert!(matches!(result, Err(DomainError::Gateway(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> =
            with_retry(&fast_policy(), &cancel, "test", || async { Ok(()) }).await;
        assert!(matches!(result, Err(DomainError::Cancelled)));
    }
}
