//! The owned, in-memory job table.
//!
//! All job state lives behind a single mutex: status and health queries run
//! concurrently with progress updates, and serialising every mutation
//! through one lock keeps terminal transitions linearizable, so two racing
//! terminal transitions can never both win.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::TranslationError;

use super::{Job, JobId, JobStatus};

/// Retention and timeout tuning for the store's sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Running jobs older than this are promoted to timed-out.
    pub job_timeout: Duration,
    /// How long after finishing a job keeps its cancellation bookkeeping.
    pub resource_grace: Duration,
    /// How many finished jobs to retain before evicting the oldest.
    pub max_finished: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(2 * 60 * 60),
            resource_grace: Duration::from_secs(5 * 60),
            max_finished: 100,
        }
    }
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    tokens: HashMap<JobId, CancellationToken>,
}

/// What a sweep did, so the owner can release per-job resources it holds.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Running jobs promoted to timed-out.
    pub timed_out: Vec<JobId>,
    /// Terminal jobs whose ancillary bookkeeping was released.
    pub released: Vec<JobId>,
    /// Finished jobs evicted beyond the retention cap.
    pub evicted: Vec<JobId>,
}

/// The single source of truth for job lifecycle state.
#[derive(Clone, Default)]
pub struct JobStore {
    config: StoreConfig,
    inner: Arc<Mutex<Inner>>,
}

impl JobStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            inner: Default::default(),
        }
    }

    /// Creates a pending job and its cancellation bookkeeping.
    pub fn create(&self) -> Job {
        let job = Job::new(JobId::generate());
        let mut inner = self.lock();
        inner
            .tokens
            .insert(job.id.clone(), CancellationToken::new());
        inner.jobs.insert(job.id.clone(), job.clone());
        job
    }

    /// A point-in-time snapshot of a job.
    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.lock().jobs.get(id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|job| job.status.is_active())
            .count()
    }

    /// Moves a job from pending to running. Rejects any other source state.
    pub fn start(&self, id: &JobId) -> Result<(), TranslationError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| TranslationError::internal(format!("unknown job {id}")))?;
        if job.status != JobStatus::Pending {
            return Err(TranslationError::internal(format!(
                "job {id} cannot start from {:?}",
                job.status
            )));
        }
        job.mark_started();
        tracing::debug!(%id, "job started");
        Ok(())
    }

    pub fn update_progress(&self, id: &JobId, step: &str, completed: u32, total: u32) {
        if let Some(job) = self.lock().jobs.get_mut(id) {
            job.update_progress(step, completed, total);
        }
    }

    /// Attaches a key/value payload entry to a job.
    pub fn set_data(&self, id: &JobId, key: &str, value: String) {
        if let Some(job) = self.lock().jobs.get_mut(id) {
            job.data.insert(key.to_owned(), value);
        }
    }

    /// Marks a job completed. A no-op for jobs already terminal.
    pub fn complete(&self, id: &JobId) -> bool {
        let mut inner = self.lock();
        match inner.jobs.get_mut(id) {
            Some(job) if job.status.is_active() => {
                job.mark_completed();
                tracing::debug!(%id, "job completed");
                true
            }
            _ => false,
        }
    }

    /// Marks a job failed with its terminal error. No-op when terminal.
    pub fn fail(&self, id: &JobId, error: TranslationError) -> bool {
        let mut inner = self.lock();
        match inner.jobs.get_mut(id) {
            Some(job) if job.status.is_active() => {
                tracing::error!(%id, kind = %error.kind, "job failed: {}", error.message);
                job.mark_failed(error);
                true
            }
            _ => false,
        }
    }

    /// Requests cancellation: sets the flag and marks the job cancelled.
    ///
    /// Returns `Some(had_started)` when the job transitioned, `None` for
    /// unknown or already-terminal jobs. Whether the job had started is
    /// decided under the same lock as the transition, so the caller can tell
    /// who owns the terminal progress event: the driver task for started
    /// jobs, the canceller for jobs that never ran.
    ///
    /// The flag stays observable after the transition so in-flight work can
    /// still see it at its next poll point.
    pub fn cancel(&self, id: &JobId) -> Option<bool> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(id)?;
        if job.status.is_terminal() {
            return None;
        }
        let had_started = job.started_at.is_some();
        job.mark_cancelled();
        if let Some(token) = inner.tokens.get(id) {
            token.cancel();
        }
        tracing::debug!(%id, "job cancelled");
        Some(had_started)
    }

    pub fn is_cancelled(&self, id: &JobId) -> bool {
        self.lock()
            .tokens
            .get(id)
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }

    /// Raises a cancelled error when the job's flag is set.
    ///
    /// This is the only mechanism by which the driver and the retry
    /// controller learn of cancellation; it is cooperative, not preemptive.
    pub fn check_cancellation(&self, id: &JobId) -> Result<(), TranslationError> {
        if self.is_cancelled(id) {
            Err(TranslationError::cancelled())
        } else {
            Ok(())
        }
    }

    pub fn record_error(&self, id: &JobId) {
        if let Some(job) = self.lock().jobs.get_mut(id) {
            job.error_count += 1;
        }
    }

    pub fn record_retry(&self, id: &JobId) {
        if let Some(job) = self.lock().jobs.get_mut(id) {
            job.retry_count += 1;
        }
    }

    /// One janitor pass: timeout promotion, resource release, eviction.
    pub fn sweep(&self) -> SweepOutcome {
        let now = Utc::now();
        let mut outcome = SweepOutcome::default();
        let mut inner = self.lock();

        let timeout = TimeDelta::from_std(self.config.job_timeout)
            .unwrap_or_else(|_| TimeDelta::MAX);
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Running
                && job.started_at.is_some_and(|started| now - started > timeout)
            {
                job.mark_timed_out();
                outcome.timed_out.push(job.id.clone());
            }
        }
        // Flag timed-out jobs so any straggling work stops at its next poll.
        for id in &outcome.timed_out {
            tracing::warn!(%id, "job exceeded its timeout");
            if let Some(token) = inner.tokens.get(id) {
                token.cancel();
            }
        }

        let grace = TimeDelta::from_std(self.config.resource_grace)
            .unwrap_or_else(|_| TimeDelta::MAX);
        let release: Vec<JobId> = inner
            .tokens
            .keys()
            .filter(|&id| {
                inner.jobs.get(id).map_or(true, |job| {
                    job.status.is_terminal()
                        && job.finished_at.is_some_and(|finished| now - finished > grace)
                })
            })
            .cloned()
            .collect();
        for id in &release {
            inner.tokens.remove(id);
        }
        outcome.released = release;

        let mut finished: Vec<(JobId, chrono::DateTime<Utc>)> = inner
            .jobs
            .values()
            .filter(|job| job.status.is_terminal())
            .map(|job| (job.id.clone(), job.finished_at.unwrap_or(job.created_at)))
            .collect();
        if finished.len() > self.config.max_finished {
            finished.sort_by_key(|(_, finished_at)| *finished_at);
            let excess = finished.len() - self.config.max_finished;
            for (id, _) in finished.into_iter().take(excess) {
                inner.jobs.remove(&id);
                inner.tokens.remove(&id);
                outcome.evicted.push(id);
            }
        }

        outcome
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }
}
