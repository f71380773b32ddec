//! Bounded retry with exponential backoff for collaborator calls.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry budget for one network call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = no retries, run once).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds).
    pub backoff_base_ms: u64,
    /// Maximum wall-clock time for a single attempt (milliseconds, 0 = unbounded).
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    // 2, 4, 8, 16, 32 seconds between attempts
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 2_000,
            attempt_timeout_ms: 10_000,
        }
    }
}

impl RetryConfig {
    /// No retries and no per-attempt timeout.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: 0,
            attempt_timeout_ms: 0,
        }
    }

    /// Delay before the retry following `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Why a retried call gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// A non-transient error; no further attempts were made.
    Fatal { attempts: u32, error: E },
    /// Every attempt failed with a transient error.
    Exhausted { attempts: u32, last: E },
    /// The final attempt exceeded the per-attempt timeout.
    TimedOut { attempts: u32, limit_ms: u64 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::TimedOut { attempts, .. } => *attempts,
        }
    }
}

/// Run `op` until it succeeds, fails fatally, or the retry budget runs out.
///
/// `is_transient` decides which errors are worth another attempt. Attempts
/// that exceed `attempt_timeout_ms` count as transient.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation: &str,
    is_transient: P,
    mut op: F,
) -> Result<(T, u32), RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = config.max_retries + 1;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let outcome = if config.attempt_timeout_ms > 0 {
            tokio::time::timeout(Duration::from_millis(config.attempt_timeout_ms), op())
                .await
                .ok()
        } else {
            Some(op().await)
        };

        match outcome {
            Some(Ok(value)) => return Ok((value, attempt)),
            Some(Err(err)) if !is_transient(&err) => {
                return Err(RetryError::Fatal {
                    attempts: attempt,
                    error: err,
                });
            }
            Some(Err(err)) => {
                if attempt == max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                tracing::warn!(
                    event = "retry.transient_error",
                    operation = %operation,
                    attempt = attempt,
                    error = %err,
                );
            }
            None => {
                if attempt == max_attempts {
                    return Err(RetryError::TimedOut {
                        attempts: attempt,
                        limit_ms: config.attempt_timeout_ms,
                    });
                }
                tracing::warn!(
                    event = "retry.attempt_timeout",
                    operation = %operation,
                    attempt = attempt,
                    limit_ms = config.attempt_timeout_ms,
                );
            }
        }

        tokio::time::sleep(config.backoff_for(attempt)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            backoff_base_ms: 1,
            attempt_timeout_ms: 1_000,
        }
    }

    #[test]
    fn test_default_matches_conbench_client_budget() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.backoff_for(1), Duration::from_secs(2));
        assert_eq!(cfg.backoff_for(5), Duration::from_secs(32));
    }

    #[test]
    fn test_retry_config_serde_roundtrip() {
        let cfg = fast(3);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: RetryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let (value, attempts) =
            retry_with_backoff(&fast(2), "op", |_: &String| true, || async { Ok::<_, String>(7) })
                .await
                .unwrap();
        assert_eq!(value, 7);
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let (_, attempts) = retry_with_backoff(&fast(3), "op", |_: &String| true, move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::Relaxed) < 2 {
                    Err("502".to_string())
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let err = retry_with_backoff(&fast(5), "op", |e: &String| e != "fatal", move || {
            c.fetch_add(1, Ordering::Relaxed);
            async { Err::<(), _>("fatal".to_string()) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RetryError::Fatal { attempts: 1, .. }));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let err = retry_with_backoff(&fast(1), "op", |_: &String| true, || async {
            Err::<(), _>("503".to_string())
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts(), 2);
        match err {
            RetryError::Exhausted { last, .. } => assert_eq!(last, "503"),
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let cfg = RetryConfig {
            max_retries: 0,
            backoff_base_ms: 1,
            attempt_timeout_ms: 20,
        };
        let err = retry_with_backoff(&cfg, "op", |_: &String| true, || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, String>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RetryError::TimedOut { attempts: 1, limit_ms: 20 }));
    }
}
