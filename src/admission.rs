//! The admission gate in front of job creation.
//!
//! Two independent checks, both rejecting rather than queueing: a minimum
//! spacing between accepted jobs, and a ceiling on simultaneously active
//! jobs. An accepted request holds a permit whose drop releases its slot, so
//! every exit path of a job gives the slot back.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{ErrorKind, Severity, TranslationError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Minimum time between two accepted jobs.
    pub min_interval: Duration,
    /// Maximum number of jobs holding a permit at once.
    pub max_active: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            max_active: 5,
        }
    }
}

#[derive(Debug)]
struct State {
    last_admitted: Option<Instant>,
    active: usize,
}

#[derive(Debug)]
pub struct AdmissionGate {
    config: AdmissionConfig,
    state: Mutex<State>,
}

/// A held admission slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    gate: Arc<AdmissionGate>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        state.active = state.active.saturating_sub(1);
    }
}

impl AdmissionGate {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                last_admitted: None,
                active: 0,
            }),
        }
    }

    /// Admits one job or rejects it with a rate-limited error.
    pub fn admit(self: &Arc<Self>) -> Result<AdmissionPermit, TranslationError> {
        let mut state = self.lock();
        if state.active >= self.config.max_active {
            return Err(TranslationError::new(
                ErrorKind::RateLimited,
                format!("too many active jobs ({} running)", state.active),
                Severity::Medium,
            ));
        }
        let now = Instant::now();
        if let Some(last) = state.last_admitted {
            let since = now.duration_since(last);
            if since < self.config.min_interval {
                return Err(TranslationError::new(
                    ErrorKind::RateLimited,
                    "requests are arriving too quickly",
                    Severity::Medium,
                )
                .with_retry_after(self.config.min_interval - since));
            }
        }
        state.last_admitted = Some(now);
        state.active += 1;
        Ok(AdmissionPermit {
            gate: Arc::clone(self),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    fn gate(config: AdmissionConfig) -> Arc<AdmissionGate> {
        Arc::new(AdmissionGate::new(config))
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_requests_are_rejected_not_queued() {
        let gate = gate(AdmissionConfig::default());
        let _permit = gate.admit().unwrap();

        let rejection = gate.admit().unwrap_err();
        assert_eq!(rejection.kind, ErrorKind::RateLimited);
        assert!(rejection.retry_after.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn spacing_opens_up_again_after_the_interval() {
        let gate = gate(AdmissionConfig::default());
        let _first = gate.admit().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_matches!(gate.admit(), Ok(_));
    }

    #[tokio::test(start_paused = true)]
    async fn the_active_ceiling_is_enforced() {
        let gate = gate(AdmissionConfig {
            min_interval: Duration::ZERO,
            max_active: 2,
        });
        let _a = gate.admit().unwrap();
        let _b = gate.admit().unwrap();
        let rejection = gate.admit().unwrap_err();
        assert_eq!(rejection.kind, ErrorKind::RateLimited);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_permit_frees_its_slot() {
        let gate = gate(AdmissionConfig {
            min_interval: Duration::ZERO,
            max_active: 1,
        });
        let permit = gate.admit().unwrap();
        assert_matches!(gate.admit(), Err(_));

        drop(permit);
        assert_matches!(gate.admit(), Ok(_));
    }
}
