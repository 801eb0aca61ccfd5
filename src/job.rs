//! The canonical job record and its state machine.
//!
//! A job is one end-to-end extract → translate → re-embed unit of work.
//! The record itself is inert data; every mutation goes through the
//! [`store::JobStore`], which owns the lock and enforces the legal
//! transitions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::TranslationError;

pub mod store;

/// An opaque job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(String);

impl JobId {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobStatus {
    /// Pending and running jobs are active; everything else is terminal.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

/// One translation job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_step: String,
    pub completed_steps: u32,
    pub total_steps: u32,
    pub error_count: u32,
    pub retry_count: u32,
    /// The terminal error, for failed jobs.
    pub error: Option<TranslationError>,
    /// Arbitrary caller payload: file names, output locations.
    pub data: HashMap<String, String>,
}

impl Job {
    fn new(id: JobId) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            current_step: String::new(),
            completed_steps: 0,
            total_steps: 0,
            error_count: 0,
            retry_count: 0,
            error: None,
            data: HashMap::new(),
        }
    }

    pub fn progress_percentage(&self) -> f32 {
        if self.total_steps == 0 {
            0.0
        } else {
            self.completed_steps as f32 / self.total_steps as f32 * 100.0
        }
    }

    /// Wall-clock duration from start to finish, or to now while running.
    pub fn duration(&self) -> Option<chrono::TimeDelta> {
        let started = self.started_at?;
        Some(self.finished_at.unwrap_or_else(Utc::now) - started)
    }

    fn update_progress(&mut self, step: &str, completed: u32, total: u32) {
        self.current_step = step.to_owned();
        self.total_steps = total;
        self.completed_steps = completed.min(total);
    }

    fn mark_started(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
    }

    fn mark_failed(&mut self, error: TranslationError) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.finished_at = Some(Utc::now());
    }

    fn mark_timed_out(&mut self) {
        self.status = JobStatus::TimedOut;
        self.finished_at = Some(Utc::now());
    }
}
