//! ============================================================================
//! Retry Logic - Exponential Backoff for Cold-Path Jobs
//! ============================================================================
//! Wraps a whole unit of work (embedding, index and summarizer calls) with:
//! - Exponential backoff with jitter between attempts
//! - Error classification (retryable vs permanent vs rate limited)
//! - A fixed attempt budget; exhausted jobs are reported, not requeued
//! ============================================================================

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::MemoryError;

/// Configuration for job retry behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Base delay between retries (will be multiplied by 2^attempt)
    pub base_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8000,
            jitter: true,
        }
    }
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorKind {
    /// Error is likely transient, should retry
    Retryable,
    /// Error is permanent, don't retry
    Permanent,
    /// Rate limited, back off more aggressively
    RateLimited,
}

/// Result of running a job under the retry budget
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Job completed
    Succeeded { value: T, attempts: u32 },
    /// Job hit a permanent error and was not retried further
    Aborted { error: anyhow::Error, attempts: u32 },
    /// Every attempt failed
    Exhausted { error: anyhow::Error, attempts: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Aborted { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn into_result(self) -> anyhow::Result<T> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Ok(value),
            RetryOutcome::Aborted { error, .. } => Err(error),
            RetryOutcome::Exhausted { error, attempts } => {
                Err(error.context(format!("failed after {} attempts", attempts)))
            }
        }
    }
}

/// Classify an error to determine if retry is appropriate
pub fn classify_error(error: &anyhow::Error) -> ErrorKind {
    if let Some(memory_error) = error.downcast_ref::<MemoryError>() {
        if memory_error.is_validation() {
            return ErrorKind::Permanent;
        }
    }

    classify_message(&format!("{:#}", error))
}

/// Classify a raw error message
pub fn classify_message(error: &str) -> ErrorKind {
    let lower = error.to_lowercase();

    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
    {
        return ErrorKind::RateLimited;
    }

    // Credentials and malformed requests won't fix themselves
    if lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("401")
        || lower.contains("403")
        || lower.contains("permission denied")
    {
        return ErrorKind::Permanent;
    }

    // Default to retryable for unknown errors
    ErrorKind::Retryable
}

/// Calculate delay with exponential backoff and optional jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let base_delay = config.base_delay_ms.saturating_mul(multiplier);
    let capped_delay = base_delay.min(config.max_delay_ms);

    let final_delay = if config.jitter {
        // Add random jitter (0-50% of delay)
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..0.5);
        (capped_delay as f64 * jitter_factor) as u64
    } else {
        capped_delay
    };

    Duration::from_millis(final_delay)
}

/// Run `op` until it succeeds, hits a permanent error, or the budget runs out.
/// `op` receives the zero-based attempt number.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = calculate_delay(attempt - 1, config);
            debug!("{}: retry attempt {} after {:?} delay", label, attempt, delay);
            sleep(delay).await;
        }

        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt + 1,
                }
            }
            Err(error) => {
                let kind = classify_error(&error);
                warn!(
                    "{}: attempt {} failed ({:?}): {:#}",
                    label,
                    attempt + 1,
                    kind,
                    error
                );

                match kind {
                    ErrorKind::Permanent => {
                        return RetryOutcome::Aborted {
                            error,
                            attempts: attempt + 1,
                        }
                    }
                    ErrorKind::RateLimited => {
                        let rate_limit_delay = Duration::from_millis(config.max_delay_ms);
                        if attempt + 1 < max_attempts {
                            warn!("{}: rate limited, waiting {:?}", label, rate_limit_delay);
                            sleep(rate_limit_delay).await;
                        }
                    }
                    ErrorKind::Retryable => {}
                }

                attempt += 1;
                if attempt >= max_attempts {
                    return RetryOutcome::Exhausted {
                        error,
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
        }
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_message("rate limit exceeded"), ErrorKind::RateLimited);
        assert_eq!(
            classify_message("HTTP 429 Too Many Requests"),
            ErrorKind::RateLimited
        );
        assert_eq!(classify_message("401 Unauthorized"), ErrorKind::Permanent);
        assert_eq!(classify_message("connection refused"), ErrorKind::Retryable);
        assert_eq!(classify_message("unknown error xyz"), ErrorKind::Retryable);
    }

    #[test]
    fn test_validation_errors_are_permanent() {
        let err = anyhow::Error::new(MemoryError::MissingIdentifier("owner_id"));
        assert_eq!(classify_error(&err), ErrorKind::Permanent);

        let err = anyhow::Error::new(MemoryError::FilterRejected("shape".into()));
        assert_eq!(classify_error(&err), ErrorKind::Retryable);
    }

    #[test]
    fn test_calculate_delay() {
        let config = RetryConfig {
            jitter: false,
            ..Default::default()
        };

        assert_eq!(calculate_delay(0, &config), Duration::from_millis(500));
        assert_eq!(calculate_delay(1, &config), Duration::from_millis(1000));
        assert_eq!(calculate_delay(2, &config), Duration::from_millis(2000));
        assert_eq!(calculate_delay(3, &config), Duration::from_millis(4000));
        // Should be capped at max_delay_ms
        assert_eq!(calculate_delay(10, &config), Duration::from_millis(8000));
        assert_eq!(calculate_delay(200, &config), Duration::from_millis(8000));
    }

    #[test]
    fn test_calculate_delay_with_jitter() {
        let config = RetryConfig {
            jitter: true,
            base_delay_ms: 1000,
            max_delay_ms: 10000,
            ..Default::default()
        };

        for _ in 0..10 {
            let delay = calculate_delay(0, &config);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let outcome = retry_with_backoff(&fast_config(3), "job", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow!("connection reset"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(outcome.attempts(), 3);
        assert_eq!(outcome.into_result().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_retry_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = retry_with_backoff(&fast_config(3), "job", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("timeout")) }
        })
        .await;

        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(outcome
            .into_result()
            .unwrap_err()
            .to_string()
            .contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = retry_with_backoff(&fast_config(5), "job", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::Error::new(MemoryError::MissingIdentifier("owner_id"))) }
        })
        .await;

        assert!(matches!(outcome, RetryOutcome::Aborted { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
