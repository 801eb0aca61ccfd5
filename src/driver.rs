//! The job driver: runs one translation job end to end.
//!
//! decode → translate each scalar field and book entry under the retry
//! controller → translate the alternate greetings as a batch → re-embed →
//! complete. Codec failures are fatal; per-field provider failures follow
//! the job's field-failure policy; cancellation is polled at every field
//! boundary and turns into a cancelled terminal state rather than a failure.

use std::sync::Arc;

use crate::batch::BatchScheduler;
use crate::card::{CharacterCard, FieldKind, PromptSet};
use crate::codec;
use crate::error::{ErrorKind, RetryPolicy, TranslationError};
use crate::governor::Governor;
use crate::job::store::JobStore;
use crate::job::JobId;
use crate::progress::{Phase, ProgressEvent, ProgressHub};
use crate::provider::Translator;
use crate::retry::RetryController;

/// What to do when a single field exhausts its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FieldFailurePolicy {
    /// Keep the original text and move on to the next field.
    #[default]
    SkipField,
    /// Fail the whole job with the field's error.
    AbortJob,
}

/// Everything a single run needs beyond the source image.
pub struct TranslationRequest {
    pub translator: Arc<dyn Translator>,
    pub prompts: PromptSet,
    pub retry_policy: RetryPolicy,
    pub failure_policy: FieldFailurePolicy,
}

/// The outputs of a completed job.
#[derive(Debug, Clone)]
pub struct JobArtifacts {
    /// The translated card document.
    pub card: CharacterCard,
    /// The rebuilt image carrying the translated document.
    pub image: Vec<u8>,
}

pub struct JobDriver {
    store: JobStore,
    governor: Arc<Governor>,
    hub: Arc<ProgressHub>,
}

struct Run<'a> {
    driver: &'a JobDriver,
    job_id: &'a JobId,
    retry: Arc<RetryController>,
    request: &'a TranslationRequest,
    completed: u32,
    total: u32,
}

impl JobDriver {
    pub fn new(store: JobStore, governor: Arc<Governor>, hub: Arc<ProgressHub>) -> Self {
        Self {
            store,
            governor,
            hub,
        }
    }

    /// Runs the job to a terminal state.
    ///
    /// The returned artifacts are also what a status query should hand out;
    /// the error mirrors the terminal error recorded on the job.
    pub async fn run(
        &self,
        job_id: &JobId,
        source: &[u8],
        request: &TranslationRequest,
    ) -> Result<JobArtifacts, TranslationError> {
        if let Err(error) = self.store.start(job_id) {
            // A cancel can land between creation and start. The canceller
            // saw a job that never started and already published the
            // terminal event, so only report the outcome here.
            if self.store.is_cancelled(job_id) {
                return Err(TranslationError::cancelled());
            }
            return Err(error);
        }

        match self.execute(job_id, source, request).await {
            Ok(artifacts) => {
                self.store.complete(job_id);
                let outputs = self
                    .store
                    .get(job_id)
                    .map(|job| job.data.into_iter().collect())
                    .unwrap_or_default();
                self.hub.publish(job_id, ProgressEvent::Completed { outputs });
                tracing::info!(%job_id, "job finished");
                Ok(artifacts)
            }
            Err(error) if error.kind == ErrorKind::Cancelled => {
                self.store.cancel(job_id);
                self.hub.publish(job_id, ProgressEvent::Cancelled);
                Err(error)
            }
            Err(error) => {
                self.store.fail(job_id, error.clone());
                self.hub.publish(job_id, ProgressEvent::error(&error));
                Err(error)
            }
        }
    }

    async fn execute(
        &self,
        job_id: &JobId,
        source: &[u8],
        request: &TranslationRequest,
    ) -> Result<JobArtifacts, TranslationError> {
        let mut card = codec::decode(source)?
            .ok_or_else(|| TranslationError::file("image carries no character card"))?;

        let scalars: Vec<FieldKind> = FieldKind::SCALARS
            .into_iter()
            .filter(|&kind| card.data.scalar(kind).is_some())
            .collect();
        let book_entries = card
            .data
            .character_book
            .as_ref()
            .map(|book| book.entries.len())
            .unwrap_or(0);
        let greetings = card.data.alternate_greetings.len();
        let total = (scalars.len() + book_entries + greetings) as u32;

        let mut run = Run {
            driver: self,
            job_id,
            retry: Arc::new(RetryController::new(
                self.store.clone(),
                Arc::clone(&self.governor),
                request.retry_policy.clone(),
            )),
            request,
            completed: 0,
            total,
        };

        for kind in scalars {
            self.store.check_cancellation(job_id)?;
            let text = card
                .data
                .scalar(kind)
                .map(str::to_owned)
                .unwrap_or_default();
            if let Some(translated) = run.translate_field(kind, &text).await? {
                card.data.set_scalar(kind, translated);
            }
        }

        if let Some(book) = card.data.character_book.as_mut() {
            for entry in &mut book.entries {
                self.store.check_cancellation(job_id)?;
                let translated = run
                    .translate_field(FieldKind::BookContent, &entry.content)
                    .await?;
                if let Some(translated) = translated {
                    entry.content = translated;
                }
            }
        }

        self.store.check_cancellation(job_id)?;
        if greetings > 0 {
            card.data.alternate_greetings =
                run.translate_greetings(card.data.alternate_greetings.clone()).await;
            self.store.check_cancellation(job_id)?;
        }

        let image = codec::encode(source, &card)?;
        Ok(JobArtifacts { card, image })
    }
}

impl Run<'_> {
    /// Translates one scalar unit of the card.
    ///
    /// `Ok(None)` means the field keeps its current text, either because it
    /// was empty or because it failed under the skip-field policy.
    async fn translate_field(
        &mut self,
        kind: FieldKind,
        text: &str,
    ) -> Result<Option<String>, TranslationError> {
        self.publish(kind, Phase::Starting);
        if text.trim().is_empty() {
            self.step(kind, Phase::Skipped);
            return Ok(None);
        }

        let prompt = self.request.prompts.resolve(kind);
        let translator = &self.request.translator;
        let outcome = self
            .retry
            .run(self.job_id, |_| translator.translate(prompt, text))
            .await;
        match outcome {
            Ok(translated) => {
                self.step(kind, Phase::Completed);
                Ok(Some(translated))
            }
            Err(error) if error.kind == ErrorKind::Cancelled => Err(error),
            Err(error) if error.should_stop_immediately() => Err(error),
            Err(error) => match self.request.failure_policy {
                FieldFailurePolicy::AbortJob => Err(error),
                FieldFailurePolicy::SkipField => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        field = %kind,
                        kind = %error.kind,
                        "field failed, keeping original text"
                    );
                    self.step(kind, Phase::Skipped);
                    Ok(None)
                }
            },
        }
    }

    /// Translates the alternate greetings as one governed batch.
    ///
    /// Failed greetings keep their original text; order is preserved.
    async fn translate_greetings(&mut self, greetings: Vec<String>) -> Vec<String> {
        let scheduler = BatchScheduler::new(Arc::clone(&self.driver.governor));
        let prompt = self
            .request
            .prompts
            .resolve(FieldKind::AlternateGreeting)
            .to_owned();
        let translator = Arc::clone(&self.request.translator);
        let retry = Arc::clone(&self.retry);
        let job_id = self.job_id.clone();

        let base = self.completed;
        let results = scheduler
            .run(
                greetings,
                move |_, text| {
                    let prompt = prompt.clone();
                    let translator = Arc::clone(&translator);
                    let retry = Arc::clone(&retry);
                    let job_id = job_id.clone();
                    async move {
                        let mut attempts: u16 = 0;
                        let outcome = retry
                            .run(&job_id, |attempt| {
                                attempts = attempt + 1;
                                translator.translate(&prompt, &text)
                            })
                            .await;
                        (outcome, attempts)
                    }
                },
                |done, _, success| {
                    self.completed = base + done as u32;
                    self.driver.store.update_progress(
                        self.job_id,
                        FieldKind::AlternateGreeting.as_str(),
                        self.completed,
                        self.total,
                    );
                    // A failed greeting keeps its original text, so it
                    // surfaces as skipped, the same as a skipped field.
                    let phase = if success {
                        Phase::Completed
                    } else {
                        Phase::Skipped
                    };
                    self.publish(FieldKind::AlternateGreeting, phase);
                },
            )
            .await;

        results.into_iter().map(|result| result.text).collect()
    }

    fn step(&mut self, kind: FieldKind, phase: Phase) {
        self.completed += 1;
        self.driver
            .store
            .update_progress(self.job_id, kind.as_str(), self.completed, self.total);
        self.publish(kind, phase);
    }

    fn publish(&self, kind: FieldKind, phase: Phase) {
        let percentage = if self.total == 0 {
            0.0
        } else {
            self.completed as f32 / self.total as f32 * 100.0
        };
        self.driver.hub.publish(
            self.job_id,
            ProgressEvent::Progress {
                field: kind.as_str().to_owned(),
                phase,
                completed: self.completed,
                total: self.total,
                percentage,
            },
        );
    }
}
