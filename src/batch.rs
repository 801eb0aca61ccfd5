//! The bounded-concurrency batch scheduler.
//!
//! Runs a list of texts through an async translate operation under the
//! governor's live budget: the worker ceiling and the minimum spacing
//! between dispatches are re-read before every dispatch, so a mid-batch
//! rate-limit collapse takes effect on the very next item. Results come back
//! in item order regardless of completion order, and a failed item never
//! aborts the batch.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::TranslationError;
use crate::governor::Governor;

/// The outcome of one batch item.
#[derive(Debug)]
pub struct BatchResult {
    /// The input text of the item.
    pub original: String,
    /// The translated text, or the original text when the item failed.
    pub text: String,
    pub success: bool,
    /// How many provider attempts the item used.
    pub attempts: u16,
    pub error: Option<TranslationError>,
}

pub struct BatchScheduler {
    governor: Arc<Governor>,
}

impl BatchScheduler {
    pub fn new(governor: Arc<Governor>) -> Self {
        Self { governor }
    }

    /// Translates `items` concurrently, invoking `on_progress` with the
    /// running completion count and the item's success flag after every
    /// item, failed ones included. The operation reports the attempt count
    /// it spent alongside its outcome.
    ///
    /// `results[i]` always corresponds to `items[i]`.
    pub async fn run<F, Fut>(
        &self,
        items: Vec<String>,
        mut translate: F,
        mut on_progress: impl FnMut(usize, usize, bool),
    ) -> Vec<BatchResult>
    where
        F: FnMut(usize, String) -> Fut,
        Fut: Future<Output = (Result<String, TranslationError>, u16)> + Send + 'static,
    {
        let total = items.len();
        let mut slots: Vec<Option<BatchResult>> = Vec::new();
        slots.resize_with(total, || None);
        let mut workers: JoinSet<(usize, Result<String, TranslationError>, u16)> =
            JoinSet::new();
        let mut next = 0;
        let mut completed = 0;
        let mut last_dispatch: Option<Instant> = None;

        loop {
            if next < total {
                let budget = self.governor.budget();
                if workers.len() < budget.max_workers.max(1) {
                    if let Some(last) = last_dispatch {
                        let since = last.elapsed();
                        if since < budget.min_spacing {
                            tokio::time::sleep(budget.min_spacing - since).await;
                        }
                    }
                    last_dispatch = Some(Instant::now());
                    let index = next;
                    let future = translate(index, items[index].clone());
                    workers.spawn(async move {
                        let (outcome, attempts) = future.await;
                        (index, outcome, attempts)
                    });
                    next += 1;
                    continue;
                }
            }

            match workers.join_next().await {
                Some(Ok((index, outcome, attempts))) => {
                    let success = outcome.is_ok();
                    slots[index] = Some(match outcome {
                        Ok(text) => BatchResult {
                            original: items[index].clone(),
                            text,
                            success: true,
                            attempts,
                            error: None,
                        },
                        Err(error) => {
                            tracing::warn!(
                                index,
                                kind = %error.kind,
                                attempts,
                                "batch item failed, keeping original text"
                            );
                            BatchResult {
                                original: items[index].clone(),
                                text: items[index].clone(),
                                success: false,
                                attempts,
                                error: Some(error),
                            }
                        }
                    });
                    completed += 1;
                    on_progress(completed, total, success);
                }
                Some(Err(join_error)) => {
                    // A panicked worker; its slot is filled below.
                    tracing::error!(error = %join_error, "batch worker panicked");
                    completed += 1;
                    on_progress(completed, total, false);
                }
                None if next >= total => break,
                None => {}
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| BatchResult {
                    original: items[index].clone(),
                    text: items[index].clone(),
                    success: false,
                    attempts: 0,
                    error: Some(TranslationError::internal("batch worker vanished")),
                })
            })
            .collect()
    }
}
