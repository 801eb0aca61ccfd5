//! The retry controller wrapping every provider call.
//!
//! One controller instance serves a whole job: it runs an operation up to
//! `max_retries + 1` times, sleeps the classified backoff between attempts,
//! records error and retry counters in the store, and feeds every attempt
//! outcome to the governor. Backoff sleeps are broken into sub-second slices
//! so a cancellation lands within half a second even mid-backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::error::{ErrorKind, RetryPolicy, TranslationError};
use crate::governor::Governor;
use crate::job::store::JobStore;
use crate::job::JobId;

/// How often a backoff sleep wakes to poll for cancellation.
const CANCELLATION_POLL: Duration = Duration::from_millis(500);

pub struct RetryController {
    store: JobStore,
    governor: Arc<Governor>,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(store: JobStore, governor: Arc<Governor>, policy: RetryPolicy) -> Self {
        Self {
            store,
            governor,
            policy,
        }
    }

    /// Runs `operation` until it succeeds or the policy gives up.
    ///
    /// Non-retryable and stop-immediately errors are returned unwrapped after
    /// the failing attempt. A retryable error that outlives the policy is
    /// wrapped into a retries-exhausted error carrying the attempt and
    /// elapsed totals. Cancellation always propagates as a cancelled error,
    /// never wrapped.
    pub async fn run<T, F, Fut>(
        &self,
        job_id: &JobId,
        mut operation: F,
    ) -> Result<T, TranslationError>
    where
        F: FnMut(u16) -> Fut,
        Fut: Future<Output = Result<T, TranslationError>>,
    {
        let started = Instant::now();
        let mut attempt: u16 = 0;
        loop {
            self.store.check_cancellation(job_id)?;
            let error = match operation(attempt).await {
                Ok(value) => {
                    self.governor.on_success();
                    return Ok(value);
                }
                Err(error) => error,
            };
            if error.kind == ErrorKind::Cancelled {
                return Err(error);
            }
            self.governor.on_error(error.kind == ErrorKind::RateLimited);
            self.store.record_error(job_id);

            let elapsed = started.elapsed();
            if !self.policy.should_retry(attempt, elapsed, &error) {
                if error.is_retryable() && !error.should_stop_immediately() {
                    return Err(exhausted(error, attempt, elapsed));
                }
                return Err(error);
            }

            let delay = self.delay(&error, attempt);
            tracing::warn!(
                %job_id,
                kind = %error.kind,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, backing off: {}",
                error.message
            );
            self.store.record_retry(job_id);
            self.sleep_checking_cancellation(job_id, delay).await?;
            attempt += 1;
        }
    }

    fn delay(&self, error: &TranslationError, attempt: u16) -> Duration {
        let mut delay = if self.policy.exponential {
            error.retry_delay(attempt)
        } else {
            error.retry_after.unwrap_or(self.policy.base_delay)
        };
        delay = delay.min(self.policy.max_delay);
        if self.policy.jitter {
            delay = delay.mul_f64(rand::thread_rng().gen_range(0.9..=1.1));
        }
        delay
    }

    /// Sleeps `delay` in short slices, giving up as soon as the job's
    /// cancellation flag is observed.
    async fn sleep_checking_cancellation(
        &self,
        job_id: &JobId,
        delay: Duration,
    ) -> Result<(), TranslationError> {
        let mut remaining = delay;
        while remaining > Duration::ZERO {
            self.store.check_cancellation(job_id)?;
            let slice = remaining.min(CANCELLATION_POLL);
            tokio::time::sleep(slice).await;
            remaining -= slice;
        }
        self.store.check_cancellation(job_id)
    }
}

fn exhausted(error: TranslationError, attempt: u16, elapsed: Duration) -> TranslationError {
    let attempts = u32::from(attempt) + 1;
    TranslationError::new(
        ErrorKind::RetriesExhausted,
        format!("giving up after {attempts} attempts: {}", error.message),
        error.severity,
    )
    .with_context(serde_json::json!({
        "attempts": attempts,
        "elapsed_secs": elapsed.as_secs_f64(),
        "last_kind": error.kind.as_str(),
    }))
}
