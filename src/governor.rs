//! The adaptive concurrency governor.
//!
//! The governor watches the success/error signal coming back from the
//! provider and derives two numbers the batch scheduler consults before
//! every dispatch: how many workers may run, and how far apart dispatches
//! must be spaced.
//!
//! The policy is asymmetric: a confirmed rate-limit collapses the worker
//! budget to the floor at once, while recovery is earned one worker at a
//! time after a run of clean successes.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for the [`Governor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Worker budget the governor starts from.
    pub initial_workers: usize,
    /// Hard floor the budget collapses to under rate limiting.
    pub min_workers: usize,
    /// Ceiling the budget can recover up to.
    pub max_workers: usize,
    /// Spacing between dispatches the governor starts from.
    pub initial_spacing: Duration,
    /// Floor the spacing can recover down to.
    pub min_spacing: Duration,
    /// Ceiling the spacing can grow up to.
    pub max_spacing: Duration,
    /// Spacing reduction earned by a clean success streak.
    pub recovery_step: Duration,
    /// Spacing increase on a generic error.
    pub error_step: Duration,
    /// Spacing increase on a rate-limit error.
    pub rate_limit_step: Duration,
    /// Consecutive successes (with no outstanding errors) needed to grow.
    pub ramp_up_after: u32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            initial_workers: 3,
            min_workers: 1,
            max_workers: 8,
            initial_spacing: Duration::from_millis(200),
            min_spacing: Duration::from_millis(50),
            max_spacing: Duration::from_secs(5),
            recovery_step: Duration::from_millis(50),
            error_step: Duration::from_millis(200),
            rate_limit_step: Duration::from_secs(1),
            ramp_up_after: 10,
        }
    }
}

/// The budget handed to the scheduler: re-read before every dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub max_workers: usize,
    pub min_spacing: Duration,
}

#[derive(Debug)]
struct State {
    workers: usize,
    spacing: Duration,
    successes: u32,
    errors: u32,
    rate_limit_streak: u32,
}

/// Tracks recent provider signal and derives the current parallelism budget.
#[derive(Debug)]
pub struct Governor {
    config: GovernorConfig,
    state: Mutex<State>,
}

impl Governor {
    pub fn new(config: GovernorConfig) -> Self {
        let state = State {
            workers: config.initial_workers.clamp(config.min_workers, config.max_workers),
            spacing: config.initial_spacing,
            successes: 0,
            errors: 0,
            rate_limit_streak: 0,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Records a successful provider call.
    pub fn on_success(&self) {
        let mut state = self.lock();
        state.errors = state.errors.saturating_sub(1);
        state.rate_limit_streak = 0;
        state.successes += 1;
        if state.successes >= self.config.ramp_up_after && state.errors == 0 {
            state.workers = (state.workers + 1).min(self.config.max_workers);
            state.spacing = state
                .spacing
                .saturating_sub(self.config.recovery_step)
                .max(self.config.min_spacing);
            state.successes = 0;
            tracing::debug!(
                workers = state.workers,
                spacing_ms = state.spacing.as_millis() as u64,
                "concurrency budget raised after clean streak"
            );
        }
    }

    /// Records a failed provider call.
    ///
    /// A rate-limit error collapses the worker budget to the floor at once;
    /// any other error backs off by a single worker.
    pub fn on_error(&self, rate_limited: bool) {
        let mut state = self.lock();
        state.successes = 0;
        if rate_limited {
            state.rate_limit_streak += 1;
            state.workers = self.config.min_workers;
            state.spacing = (state.spacing + self.config.rate_limit_step)
                .min(self.config.max_spacing);
            tracing::warn!(
                streak = state.rate_limit_streak,
                spacing_ms = state.spacing.as_millis() as u64,
                "rate limited upstream, collapsing worker budget to {}",
                state.workers
            );
        } else {
            state.errors += 1;
            state.workers = state.workers.saturating_sub(1).max(self.config.min_workers);
            state.spacing =
                (state.spacing + self.config.error_step).min(self.config.max_spacing);
        }
    }

    /// The budget to apply to the next dispatch.
    pub fn budget(&self) -> Budget {
        let state = self.lock();
        Budget {
            max_workers: state.workers,
            min_spacing: state.spacing,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned governor lock means a panic mid-update; the counters
        // are still structurally valid, so keep going.
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn governor() -> Governor {
        Governor::new(GovernorConfig::default())
    }

    #[test]
    fn rate_limit_collapses_to_the_floor_immediately() {
        let governor = governor();
        // Ramp up first so the collapse is visible from above the floor.
        for _ in 0..30 {
            governor.on_success();
        }
        assert!(governor.budget().max_workers > GovernorConfig::default().min_workers);

        governor.on_error(true);
        assert_eq!(
            governor.budget().max_workers,
            GovernorConfig::default().min_workers
        );
    }

    #[test]
    fn rate_limit_widens_spacing_more_than_a_generic_error() {
        let config = GovernorConfig::default();
        let rate_limited = governor();
        rate_limited.on_error(true);
        let generic = governor();
        generic.on_error(false);

        assert_eq!(
            rate_limited.budget().min_spacing,
            config.initial_spacing + config.rate_limit_step
        );
        assert_eq!(
            generic.budget().min_spacing,
            config.initial_spacing + config.error_step
        );
    }

    #[test]
    fn ten_clean_successes_earn_one_worker() {
        let governor = governor();
        let initial = governor.budget().max_workers;
        for _ in 0..9 {
            governor.on_success();
        }
        assert_eq!(governor.budget().max_workers, initial);
        governor.on_success();
        assert_eq!(governor.budget().max_workers, initial + 1);
    }

    #[test]
    fn outstanding_errors_block_the_ramp_up() {
        let governor = governor();
        let initial = governor.budget().max_workers;
        // Many errors, then fewer successes than needed to clear them.
        for _ in 0..12 {
            governor.on_error(false);
        }
        for _ in 0..10 {
            governor.on_success();
        }
        assert!(governor.budget().max_workers <= initial);
    }

    #[test]
    fn generic_error_steps_down_one_worker() {
        let governor = governor();
        let initial = governor.budget().max_workers;
        governor.on_error(false);
        assert_eq!(governor.budget().max_workers, initial - 1);
    }

    #[test]
    fn budget_respects_the_ceiling_and_spacing_floor() {
        let config = GovernorConfig::default();
        let governor = governor();
        for _ in 0..1000 {
            governor.on_success();
        }
        let budget = governor.budget();
        assert_eq!(budget.max_workers, config.max_workers);
        assert_eq!(budget.min_spacing, config.min_spacing);
    }

    #[test]
    fn spacing_never_exceeds_the_ceiling() {
        let config = GovernorConfig::default();
        let governor = governor();
        for _ in 0..100 {
            governor.on_error(true);
        }
        assert_eq!(governor.budget().min_spacing, config.max_spacing);
    }
}
