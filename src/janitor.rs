//! The background sweep keeping the job table bounded.
//!
//! On a fixed interval the janitor asks the store for one sweep pass and
//! hands the outcome to a hook so the owner can drop whatever it holds per
//! job (progress channels, output artifacts). It runs until its cancellation
//! token fires.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::job::store::{JobStore, SweepOutcome};

pub(crate) type SweepHook = Box<dyn Fn(&SweepOutcome) + Send + Sync>;

pub(crate) struct JanitorRunner {
    store: JobStore,
    interval: Duration,
    on_sweep: SweepHook,
}

impl JanitorRunner {
    pub(crate) fn new(store: JobStore, interval: Duration, on_sweep: SweepHook) -> Self {
        Self {
            store,
            interval,
            on_sweep,
        }
    }

    pub(crate) fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            // The first tick fires immediately; skip it so a freshly started
            // engine does not sweep before any job exists.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("janitor shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let outcome = self.store.sweep();
                        if outcome != SweepOutcome::default() {
                            tracing::debug!(
                                timed_out = outcome.timed_out.len(),
                                released = outcome.released.len(),
                                evicted = outcome.evicted.len(),
                                "sweep pass finished"
                            );
                        }
                        (self.on_sweep)(&outcome);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::job::store::StoreConfig;
    use crate::job::JobStatus;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn promotes_overdue_jobs_on_its_interval() {
        let store = JobStore::new(StoreConfig {
            job_timeout: Duration::from_secs(1),
            ..Default::default()
        });
        let job = store.create();
        store.start(&job.id).unwrap();

        let timed_out = Arc::new(AtomicUsize::new(0));
        let hook = {
            let timed_out = Arc::clone(&timed_out);
            Box::new(move |outcome: &SweepOutcome| {
                timed_out.fetch_add(outcome.timed_out.len(), Ordering::SeqCst);
            })
        };
        let token = CancellationToken::new();
        let handle =
            JanitorRunner::new(store.clone(), Duration::from_secs(2), hook).spawn(token.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.get(&job.id).unwrap().status, JobStatus::TimedOut);
        assert_eq!(timed_out.load(Ordering::SeqCst), 1);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_the_token_fires() {
        let store = JobStore::new(StoreConfig::default());
        let token = CancellationToken::new();
        let handle = JanitorRunner::new(store, Duration::from_secs(1), Box::new(|_| {}))
            .spawn(token.clone());
        token.cancel();
        handle.await.unwrap();
    }
}
