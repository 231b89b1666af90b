//! Bounded retries with exponential backoff around a transcription call.
//!
//! The attempt bookkeeping lives in [`Backoff`], a small state machine that
//! knows nothing about time. [`with_retries`] drives it and waits through an
//! injected [`Clock`].

use std::future::Future;
use std::time::Duration;

use crate::transcribe::TranscriptionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(30),
        }
    }
}

/// Tracks how many attempts have been made and how long to wait before the
/// next one. The delay doubles after every failure.
#[derive(Debug, Clone)]
pub struct Backoff {
    max_attempts: u32,
    attempt: u32,
    next_delay: Duration,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts.max(1),
            attempt: 0,
            next_delay: policy.initial_delay,
        }
    }

    /// Marks the start of an attempt and returns its 1-based number.
    pub fn begin(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Records a transient failure of the current attempt. Returns the delay
    /// to wait before the next attempt, or `None` once attempts are used up.
    pub fn on_transient_failure(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.next_delay;
        self.next_delay = self.next_delay.saturating_mul(2);
        Some(delay)
    }
}

/// Where retry waits go. Production code sleeps on the tokio timer.
pub trait Clock {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("fatal failure on attempt {attempt}: {source:#}")]
    Fatal {
        attempt: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed after {attempts} attempts: {last:#}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: anyhow::Error,
    },
}

/// Runs `op` until it succeeds, fails fatally, or the policy's attempts are
/// exhausted. `op` receives the 1-based attempt number.
pub async fn with_retries<T, F, Fut, C>(
    policy: &RetryPolicy,
    clock: &C,
    label: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TranscriptionError>>,
    C: Clock,
{
    let mut backoff = Backoff::new(policy);
    loop {
        let attempt = backoff.begin();
        tracing::debug!(item = label, attempt, max = policy.max_attempts, "attempting");
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(TranscriptionError::Fatal(source)) => {
                tracing::warn!(item = label, attempt, "fatal failure, not retrying: {source:#}");
                return Err(RetryError::Fatal { attempt, source });
            }
            Err(TranscriptionError::Transient(e)) => match backoff.on_transient_failure() {
                Some(delay) => {
                    tracing::warn!(item = label, attempt, ?delay, "attempt failed, retrying: {e:#}");
                    clock.sleep(delay).await;
                }
                None => {
                    tracing::warn!(item = label, attempt, "giving up: {e:#}");
                    return Err(RetryError::RetriesExhausted {
                        attempts: backoff.attempts(),
                        last: e,
                    });
                }
            },
        }
    }
}
