//! Bounded exponential-backoff retries around a single provider call
//!
//! The delay before retry `n` (1-based) is `min(base_delay * multiplier^(n-1), max_delay)`,
//! optionally scaled by a random factor in `[1 - jitter, 1 + jitter]`. A `retry-after` hint from
//! the provider stretches that delay to the hint; a hint longer than `max_delay` ends the loop so
//! the caller can move on instead of waiting. Fatal errors end the loop immediately. Both the provider call and the backoff sleep race the caller's cancellation
//! token, so a cancelled request drops its in-flight call rather than just ignoring it.
use crate::errors::{ErrorClass, RetryError, RetryableError};
use crate::providers::ProviderRole;
use bon::Builder;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    #[builder(default = 3)]
    pub max_attempts: u32,
    #[builder(default = Duration::from_millis(500))]
    pub base_delay: Duration,
    #[builder(default = 2.0)]
    pub multiplier: f64,
    #[builder(default = Duration::from_secs(5))]
    pub max_delay: Duration,
    /// Fractional jitter applied to each delay, between 0.0 and 1.0.
    #[builder(default = 0.0)]
    pub jitter: f64,
    /// Deadline for a single attempt; an attempt that overruns fails with a retryable timeout.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self::builder()
            .max_attempts(3)
            .base_delay(Duration::from_millis(500))
            .max_delay(Duration::from_secs(5))
            .jitter(0.1)
            .attempt_timeout(Duration::from_secs(60))
            .build()
    }

    /// Cheap, fast calls: retry often with short waits.
    pub fn aggressive() -> Self {
        Self::builder()
            .max_attempts(5)
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(2))
            .jitter(0.2)
            .attempt_timeout(Duration::from_secs(20))
            .build()
    }

    /// Expensive calls such as structured output or reasoning: fewer, longer-spaced attempts.
    pub fn conservative() -> Self {
        Self::builder()
            .max_attempts(3)
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(10))
            .jitter(0.1)
            .attempt_timeout(Duration::from_secs(120))
            .build()
    }

    pub fn for_role(role: ProviderRole) -> Self {
        match role {
            ProviderRole::Fast => Self::aggressive(),
            ProviderRole::Reasoning => Self::conservative(),
            _ => Self::standard(),
        }
    }

    /// Un-jittered delay before retry `retry` (1 = the wait before the second attempt).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        let secs = (self.base_delay.as_secs_f64() * factor).min(max_secs);
        if secs.is_finite() {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.max_delay
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor)
    }
}

/// Worst-case time [`with_retry`] can spend on `policy`: every backoff at maximum jitter, plus
/// every attempt running to its timeout when one is set. Callers use it to size outer deadlines.
///
/// Provider `retry-after` hints are not included; each can stretch a backoff up to `max_delay`.
pub fn calculate_max_retry_time(policy: &RetryPolicy) -> Duration {
    let attempts = policy.max_attempts.max(1);
    let jitter = policy.jitter.clamp(0.0, 1.0);
    let backoff: Duration = (1..attempts)
        .map(|retry| policy.delay_for_retry(retry).mul_f64(1.0 + jitter))
        .sum();
    let calls = policy
        .attempt_timeout
        .map(|t| t * attempts)
        .unwrap_or_default();
    backoff + calls
}

/// One attempt made by [`with_retry`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    /// Wait before this attempt started.
    pub delay: Duration,
    /// `None` if the attempt succeeded.
    pub classification: Option<ErrorClass>,
    /// Time since the retry loop started, measured when this attempt finished.
    pub elapsed: Duration,
}

/// A successful result together with what it took to get it.
#[derive(Debug, Clone)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: Vec<RetryAttempt>,
    pub elapsed: Duration,
}

/// Run `operation` until it succeeds, fails fatally, runs out of attempts, or `cancel` fires.
///
/// `operation` receives the 1-based attempt number. On terminal failure the last error is
/// returned with the attempt count and total elapsed time.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<Retried<T>, RetryError<E>>
where
    E: RetryableError,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut history = Vec::with_capacity(max_attempts as usize);
    let mut delay = Duration::ZERO;
    let mut attempt = 1;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(E::timed_out(started.elapsed())),
            result = run_attempt(policy, operation(attempt)) => result,
        };

        let error = match result {
            Ok(value) => {
                history.push(RetryAttempt {
                    attempt,
                    delay,
                    classification: None,
                    elapsed: started.elapsed(),
                });
                return Ok(Retried {
                    value,
                    attempts: history,
                    elapsed: started.elapsed(),
                });
            }
            Err(error) => error,
        };

        let class = error.class();
        history.push(RetryAttempt {
            attempt,
            delay,
            classification: Some(class),
            elapsed: started.elapsed(),
        });

        let exhausted = attempt >= max_attempts;
        if class == ErrorClass::Fatal || exhausted || cancel.is_cancelled() {
            if class == ErrorClass::Retryable && exhausted {
                warn!(attempts = attempt, "Retries exhausted: {}", error);
            }
            return Err(RetryError {
                error,
                attempts: attempt,
                elapsed: started.elapsed(),
            });
        }

        let backoff = policy.jittered(policy.delay_for_retry(attempt));
        delay = match error.retry_after() {
            Some(hint) if hint > policy.max_delay => {
                warn!(
                    attempts = attempt,
                    retry_after_ms = hint.as_millis() as u64,
                    "Provider asked for a longer wait than the policy allows: {}",
                    error
                );
                return Err(RetryError {
                    error,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                });
            }
            Some(hint) => backoff.max(hint),
            None => backoff,
        };
        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retryable failure, backing off: {}",
            error
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetryError {
                    error: E::timed_out(started.elapsed()),
                    attempts: attempt,
                    elapsed: started.elapsed(),
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

async fn run_attempt<T, E, Fut>(policy: &RetryPolicy, call: Fut) -> Result<T, E>
where
    E: RetryableError,
    Fut: Future<Output = Result<T, E>>,
{
    match policy.attempt_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(timeout)),
        },
        None => call.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProviderError;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(base_ms))
            .multiplier(2.0)
            .max_delay(Duration::from_secs(10))
            .build()
    }

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(4, 800)]
    #[case(10, 10_000)]
    fn test_backoff_schedule_is_capped(#[case] retry: u32, #[case] expected_ms: u64) {
        let policy = policy(20, 100);
        assert_eq!(
            policy.delay_for_retry(retry),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn test_huge_retry_numbers_do_not_overflow() {
        let policy = policy(u32::MAX, 100);
        assert_eq!(policy.delay_for_retry(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_calculate_max_retry_time() {
        assert_eq!(
            calculate_max_retry_time(&policy(3, 100)),
            Duration::from_millis(300)
        );
        assert_eq!(calculate_max_retry_time(&policy(1, 100)), Duration::ZERO);

        let with_timeout = RetryPolicy::builder()
            .max_attempts(2)
            .base_delay(Duration::from_millis(100))
            .jitter(0.5)
            .attempt_timeout(Duration::from_secs(1))
            .build();
        assert_eq!(
            calculate_max_retry_time(&with_timeout),
            Duration::from_millis(150) + Duration::from_secs(2)
        );
    }

    #[test]
    fn test_presets_differ_in_bounds() {
        let aggressive = RetryPolicy::aggressive();
        let conservative = RetryPolicy::conservative();
        assert!(aggressive.max_attempts > conservative.max_attempts);
        assert!(aggressive.base_delay < conservative.base_delay);
        assert!(aggressive.max_delay < conservative.max_delay);
        assert_eq!(RetryPolicy::for_role(ProviderRole::Fast), aggressive);
        assert_eq!(RetryPolicy::for_role(ProviderRole::Reasoning), conservative);
        assert_eq!(
            RetryPolicy::for_role(ProviderRole::Primary),
            RetryPolicy::standard()
        );
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(1000))
            .jitter(0.25)
            .build();
        for _ in 0..200 {
            let d = policy.jittered(Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_errors_exhaust_attempts_with_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result: Result<Retried<()>, _> =
            with_retry(&policy(3, 100), &CancellationToken::new(), |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::Upstream {
                        status: 503,
                        message: "unavailable".into(),
                    })
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts, 3);
        assert!(err.elapsed >= Duration::from_millis(300));
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(matches!(err.error, ProviderError::Upstream { status: 503, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_aborts_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<Retried<()>, _> =
            with_retry(&policy(5, 100), &CancellationToken::new(), |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::Authentication { status: 401 })
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.elapsed, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let result = with_retry(&policy(3, 100), &CancellationToken::new(), |attempt| async move {
            if attempt < 3 {
                Err(ProviderError::Timeout(Duration::from_secs(1)))
            } else {
                Ok("done")
            }
        })
        .await
        .unwrap();

        assert_eq!(result.value, "done");
        assert_eq!(result.attempts.len(), 3);
        assert_eq!(result.attempts[1].delay, Duration::from_millis(100));
        assert_eq!(result.attempts[2].delay, Duration::from_millis(200));
        assert_eq!(
            result.attempts[0].classification,
            Some(ErrorClass::Retryable)
        );
        assert_eq!(result.attempts[2].classification, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retryable() {
        let policy = RetryPolicy::builder()
            .max_attempts(2)
            .base_delay(Duration::from_millis(10))
            .attempt_timeout(Duration::from_secs(1))
            .build();
        let result = with_retry(&policy, &CancellationToken::new(), |attempt| async move {
            if attempt == 1 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok::<_, ProviderError>(attempt)
        })
        .await
        .unwrap();
        assert_eq!(result.value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_in_flight_call() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            trigger.cancel();
        });

        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<Retried<()>, _> = with_retry(&policy(5, 100), &cancel, |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err.error, ProviderError::Timeout(_)));
        assert!(err.error.is_retryable());
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.elapsed < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_stretches_backoff() {
        let result = with_retry(&policy(2, 100), &CancellationToken::new(), |attempt| async move {
            if attempt == 1 {
                Err(ProviderError::RateLimited {
                    retry_after: Some(Duration::from_secs(7)),
                })
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();

        assert_eq!(result.value, 2);
        assert_eq!(result.attempts[1].delay, Duration::from_secs(7));
        assert!(result.elapsed >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_rate_limit_hint_keeps_longer_backoff() {
        let result = with_retry(&policy(2, 500), &CancellationToken::new(), |attempt| async move {
            if attempt == 1 {
                Err(ProviderError::RateLimited {
                    retry_after: Some(Duration::from_millis(50)),
                })
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();
        assert_eq!(result.attempts[1].delay, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_beyond_max_delay_stops_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<Retried<()>, _> =
            with_retry(&policy(5, 100), &CancellationToken::new(), |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::RateLimited {
                        retry_after: Some(Duration::from_secs(60)),
                    })
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.elapsed, Duration::ZERO);
        assert!(matches!(err.error, ProviderError::RateLimited { .. }));
    }
}
