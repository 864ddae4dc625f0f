#![forbid(unsafe_code)]

//! Bounded retries around one fetch-engine operation.
//!
//! Transient failures (throttling, transport timeouts) are retried after a
//! backoff that grows with the attempt number; the first fatal failure ends
//! the item immediately. Every attempt leaves an [`AttemptRecord`] so the
//! orchestrator can report the last detail the engine gave us.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::fetch::FetchError;
use crate::pacing::DelayScheduler;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    FatalFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1-based.
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub error_detail: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("fatal failure on attempt {}", attempts.len())]
    Fatal { attempts: Vec<AttemptRecord> },
    #[error("all {} attempts failed transiently", attempts.len())]
    Exhausted { attempts: Vec<AttemptRecord> },
    #[error("interrupted by operator")]
    Interrupted { attempts: Vec<AttemptRecord> },
}

impl RetryError {
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            RetryError::Fatal { attempts }
            | RetryError::Exhausted { attempts }
            | RetryError::Interrupted { attempts } => attempts,
        }
    }

    /// The error detail of the last failed attempt, if any attempt ran.
    pub fn last_detail(&self) -> &str {
        self.attempts()
            .last()
            .map(|record| record.error_detail.as_str())
            .unwrap_or("no attempt was made")
    }
}

#[derive(Debug, Clone)]
pub struct RetryEngine {
    max_attempts: u32,
    attempt_timeout: Option<Duration>,
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Some(DEFAULT_ATTEMPT_TIMEOUT))
    }
}

impl RetryEngine {
    /// `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32, attempt_timeout: Option<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempt_timeout,
        }
    }

    /// Runs `operation` until it succeeds, fails fatally, or `max_attempts`
    /// transient failures have happened. The closure receives the 1-based
    /// attempt number.
    ///
    /// Each attempt races the run's cancellation token: an interrupt drops the
    /// in-flight future (which kills any child process spawned with
    /// `kill_on_drop`) and resolves as [`RetryError::Interrupted`].
    pub async fn attempt<T, F, Fut>(
        &self,
        delays: &DelayScheduler,
        label: &str,
        mut operation: F,
    ) -> Result<(T, Vec<AttemptRecord>), RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let cancel = delays.cancellation();
        let mut attempts = Vec::new();

        for attempt_number in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(RetryError::Interrupted { attempts });
            }

            debug!(label, attempt = attempt_number, "attempt starting");
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Interrupted { attempts });
                }
                result = self.bounded(operation(attempt_number)) => result,
            };

            match result {
                Ok(value) => {
                    attempts.push(AttemptRecord {
                        attempt_number,
                        outcome: AttemptOutcome::Success,
                        error_detail: String::new(),
                    });
                    return Ok((value, attempts));
                }
                Err(FetchError::Fatal(detail)) => {
                    warn!(label, attempt = attempt_number, %detail, "fatal failure, not retrying");
                    attempts.push(AttemptRecord {
                        attempt_number,
                        outcome: AttemptOutcome::FatalFailure,
                        error_detail: detail,
                    });
                    return Err(RetryError::Fatal { attempts });
                }
                Err(FetchError::Transient(detail)) => {
                    warn!(
                        label,
                        attempt = attempt_number,
                        max = self.max_attempts,
                        %detail,
                        "transient failure"
                    );
                    attempts.push(AttemptRecord {
                        attempt_number,
                        outcome: AttemptOutcome::TransientFailure,
                        error_detail: detail,
                    });
                    if attempt_number < self.max_attempts
                        && delays.wait_backoff(attempt_number).await.is_err()
                    {
                        return Err(RetryError::Interrupted { attempts });
                    }
                }
            }
        }

        Err(RetryError::Exhausted { attempts })
    }

    async fn bounded<T, Fut>(&self, future: Fut) -> Result<T, FetchError>
    where
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let Some(limit) = self.attempt_timeout else {
            return future.await;
        };
        match tokio::time::timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Transient(format!(
                "attempt timed out after {}s",
                limit.as_secs_f64()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::testing::RecordingSleeper;
    use crate::pacing::{DEFAULT_BACKOFF, DelayScheduler};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn delays(sleeper: Arc<RecordingSleeper>) -> (DelayScheduler, CancellationToken) {
        let token = CancellationToken::new();
        (
            DelayScheduler::new(None, DEFAULT_BACKOFF, sleeper, token.clone()),
            token,
        )
    }

    #[tokio::test]
    async fn transient_failures_stop_after_exactly_max_attempts() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let (delays, _token) = delays(sleeper.clone());
        let calls = AtomicU32::new(0);

        let result: Result<((), _), _> = RetryEngine::new(3, None)
            .attempt(&delays, "item", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::Transient("HTTP Error 429".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { .. }));
        let numbers: Vec<u32> = err.attempts().iter().map(|r| r.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(err.last_detail(), "HTTP Error 429");

        // Backoff only between attempts, growing each time.
        let waits = sleeper.recorded();
        assert_eq!(waits.len(), 2);
        assert!(waits[1] > waits[0]);
    }

    #[tokio::test]
    async fn fatal_on_first_attempt_never_retries() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let (delays, _token) = delays(sleeper.clone());
        let calls = AtomicU32::new(0);

        let result: Result<((), _), _> = RetryEngine::new(3, None)
            .attempt(&delays, "item", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::Fatal("Video unavailable".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Fatal { .. }));
        assert_eq!(err.attempts()[0].outcome, AttemptOutcome::FatalFailure);
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn transient_then_success_returns_the_value() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let (delays, _token) = delays(sleeper.clone());

        let (value, attempts) = RetryEngine::new(3, None)
            .attempt(&delays, "item", |attempt| async move {
                if attempt < 2 {
                    Err(FetchError::Transient("timed out".into()))
                } else {
                    Ok(attempt * 10)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 20);
        let outcomes: Vec<AttemptOutcome> = attempts.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![AttemptOutcome::TransientFailure, AttemptOutcome::Success]
        );
        assert_eq!(sleeper.recorded().len(), 1);
    }

    #[tokio::test]
    async fn hung_attempt_times_out_as_transient() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let (delays, _token) = delays(sleeper);

        let result: Result<((), _), _> = RetryEngine::new(2, Some(Duration::from_millis(20)))
            .attempt(&delays, "item", |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { .. }));
        assert_eq!(err.attempts().len(), 2);
        assert!(err.last_detail().contains("timed out"));
    }

    #[tokio::test]
    async fn interrupt_mid_attempt_drops_the_operation() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let (delays, token) = delays(sleeper);
        let calls = AtomicU32::new(0);

        let result: Result<((), _), _> = RetryEngine::new(3, None)
            .attempt(&delays, "item", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                token.cancel();
                std::future::pending()
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Interrupted { .. })));
    }

    #[tokio::test]
    async fn already_cancelled_run_makes_no_attempt() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let (delays, token) = delays(sleeper);
        token.cancel();

        let result: Result<((), _), _> = RetryEngine::default()
            .attempt(&delays, "item", |_| async { Ok(()) })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Interrupted { .. }));
        assert!(err.attempts().is_empty());
        assert_eq!(err.last_detail(), "no attempt was made");
    }
}
