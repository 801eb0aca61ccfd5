//! A job engine translating character cards embedded in PNG images.
//!
//! A card image carries a JSON document in a `tEXt`/`zTXt` chunk. The
//! [`Engine`] accepts jobs that extract that document, translate its textual
//! fields through a pluggable [`Translator`], and rebuild the image with the
//! translated document. Around that core it runs a classified retry loop, an
//! adaptive concurrency governor, per-job progress streams, cooperative
//! cancellation, an admission gate, and a background janitor keeping the job
//! table bounded.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use cardbabel::{Engine, EngineConfig, ProviderSettings, Translator};
//! # async fn example(translator: Arc<dyn Translator>, settings: ProviderSettings, image: Vec<u8>) {
//! let engine = Engine::new(EngineConfig::default());
//! let job = engine.create_job().unwrap();
//! engine.start_job(&job.id, image, &settings, translator).unwrap();
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub mod admission;
pub mod batch;
pub mod card;
pub mod codec;
pub mod driver;
pub mod error;
pub mod governor;
mod janitor;
pub mod job;
pub mod progress;
pub mod provider;
pub mod retry;

pub use admission::AdmissionConfig;
pub use card::{CharacterCard, FieldKind, PromptSet};
pub use driver::{FieldFailurePolicy, JobArtifacts, TranslationRequest};
pub use error::{ErrorKind, RetryPolicy, Severity, TranslationError};
pub use governor::GovernorConfig;
pub use job::store::StoreConfig;
pub use job::{Job, JobId, JobStatus};
pub use progress::ProgressEvent;
pub use provider::{ProviderSettings, Translator};

use admission::{AdmissionGate, AdmissionPermit};
use driver::JobDriver;
use governor::Governor;
use janitor::JanitorRunner;
use job::store::JobStore;
use progress::ProgressHub;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub governor: GovernorConfig,
    pub admission: AdmissionConfig,
    pub retry: RetryPolicy,
    pub failure_policy: FieldFailurePolicy,
    pub prompts: PromptSet,
    /// How often the janitor sweeps the job table.
    pub janitor_interval: Duration,
    /// Heartbeat period on quiet progress streams.
    pub heartbeat: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            governor: GovernorConfig::default(),
            admission: AdmissionConfig::default(),
            retry: RetryPolicy::default(),
            failure_policy: FieldFailurePolicy::default(),
            prompts: PromptSet {
                description: "Translate this character description faithfully.".to_owned(),
                dialogue: "Translate this dialogue naturally, keeping the speaker's voice."
                    .to_owned(),
                base: "Translate this text faithfully.".to_owned(),
            },
            janitor_interval: Duration::from_secs(60),
            heartbeat: Duration::from_secs(30),
        }
    }
}

/// A point-in-time status report for one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub id: JobId,
    pub status: JobStatus,
    pub current_step: String,
    pub completed_steps: u32,
    pub total_steps: u32,
    pub percentage: f32,
    pub error_count: u32,
    pub retry_count: u32,
    pub duration_ms: Option<i64>,
    pub error: Option<ErrorReport>,
}

/// The terminal error of a failed job, flattened for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub severity: Severity,
    pub retryable: bool,
}

impl From<Job> for JobReport {
    fn from(job: Job) -> Self {
        Self {
            percentage: job.progress_percentage(),
            duration_ms: job.duration().map(|duration| duration.num_milliseconds()),
            error: job.error.as_ref().map(|error| ErrorReport {
                kind: error.kind,
                message: error.message.clone(),
                severity: error.severity,
                retryable: error.is_retryable(),
            }),
            id: job.id,
            status: job.status,
            current_step: job.current_step,
            completed_steps: job.completed_steps,
            total_steps: job.total_steps,
            error_count: job.error_count,
            retry_count: job.retry_count,
        }
    }
}

type ArtifactTable = Arc<Mutex<HashMap<JobId, JobArtifacts>>>;
type PermitTable = Arc<Mutex<HashMap<JobId, AdmissionPermit>>>;

/// The translation job engine.
///
/// Must be created inside a tokio runtime: construction spawns the janitor,
/// and starting a job spawns its driver task.
pub struct Engine {
    store: JobStore,
    driver: Arc<JobDriver>,
    hub: Arc<ProgressHub>,
    gate: Arc<AdmissionGate>,
    artifacts: ArtifactTable,
    permits: PermitTable,
    prompts: PromptSet,
    retry: RetryPolicy,
    failure_policy: FieldFailurePolicy,
    tasks: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
    janitor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let store = JobStore::new(config.store);
        let governor = Arc::new(Governor::new(config.governor));
        let hub = Arc::new(ProgressHub::new(config.heartbeat));
        let artifacts: ArtifactTable = Default::default();
        let permits: PermitTable = Default::default();
        let shutdown = CancellationToken::new();

        let janitor = {
            let hub = Arc::clone(&hub);
            let artifacts = Arc::clone(&artifacts);
            let permits = Arc::clone(&permits);
            JanitorRunner::new(
                store.clone(),
                config.janitor_interval,
                Box::new(move |outcome| {
                    for id in &outcome.timed_out {
                        hub.publish(
                            id,
                            ProgressEvent::Error {
                                kind: ErrorKind::Timeout,
                                message: "job exceeded its time limit".to_owned(),
                                retryable: false,
                            },
                        );
                        lock(&permits).remove(id);
                    }
                    for id in &outcome.released {
                        hub.release(id);
                    }
                    for id in &outcome.evicted {
                        hub.release(id);
                        lock(&artifacts).remove(id);
                        lock(&permits).remove(id);
                    }
                }),
            )
            .spawn(shutdown.clone())
        };

        Self {
            driver: Arc::new(JobDriver::new(
                store.clone(),
                governor,
                Arc::clone(&hub),
            )),
            store,
            hub,
            gate: Arc::new(AdmissionGate::new(config.admission)),
            artifacts,
            permits,
            prompts: config.prompts,
            retry: config.retry,
            failure_policy: config.failure_policy,
            tasks: Mutex::new(JoinSet::new()),
            shutdown,
            janitor: Mutex::new(Some(janitor)),
        }
    }

    /// Admits and creates a pending job.
    ///
    /// Rejected with a rate-limited error when jobs arrive too quickly or
    /// too many are active; rejected requests are never queued.
    pub fn create_job(&self) -> Result<Job, TranslationError> {
        let permit = self.gate.admit()?;
        let job = self.store.create();
        lock(&self.permits).insert(job.id.clone(), permit);
        tracing::info!(job_id = %job.id, "job created");
        Ok(job)
    }

    /// Starts a pending job on a background task.
    ///
    /// The provider settings are validated for completeness up front;
    /// incomplete settings reject the start with an invalid-request error
    /// and leave the job pending.
    pub fn start_job(
        &self,
        job_id: &JobId,
        source: Vec<u8>,
        settings: &ProviderSettings,
        translator: Arc<dyn Translator>,
    ) -> Result<(), TranslationError> {
        settings.validate()?;
        match self.store.get(job_id) {
            None => {
                return Err(TranslationError::internal(format!("unknown job {job_id}")));
            }
            Some(job) if job.status != JobStatus::Pending => {
                return Err(TranslationError::internal(format!(
                    "job {job_id} was already started"
                )));
            }
            Some(_) => {}
        }
        let driver = Arc::clone(&self.driver);
        let request = TranslationRequest {
            translator,
            prompts: self.prompts.clone(),
            retry_policy: self.retry.clone(),
            failure_policy: self.failure_policy,
        };
        let artifacts = Arc::clone(&self.artifacts);
        let permits = Arc::clone(&self.permits);
        let id = job_id.clone();
        lock(&self.tasks).spawn(async move {
            if let Ok(outputs) = driver.run(&id, &source, &request).await {
                lock(&artifacts).insert(id.clone(), outputs);
            }
            lock(&permits).remove(&id);
        });
        Ok(())
    }

    pub fn status(&self, job_id: &JobId) -> Option<JobReport> {
        self.store.get(job_id).map(JobReport::from)
    }

    /// Requests cancellation of a job. Returns whether anything changed.
    pub fn cancel_job(&self, job_id: &JobId) -> bool {
        match self.store.cancel(job_id) {
            None => false,
            // A started job's driver task publishes the terminal event at
            // its next poll; publishing here too would duplicate it.
            Some(true) => true,
            Some(false) => {
                // A never-started job has no driver task to publish its end.
                self.hub.publish(job_id, ProgressEvent::Cancelled);
                lock(&self.permits).remove(job_id);
                true
            }
        }
    }

    /// Opens the progress event stream of a job.
    pub fn subscribe(&self, job_id: &JobId) -> impl Stream<Item = ProgressEvent> {
        self.hub.subscribe(job_id)
    }

    /// Feeds an inbound control message from a progress subscriber.
    pub fn control(&self, job_id: &JobId, message: &str) {
        self.hub.handle_control(job_id, message);
    }

    /// The outputs of a completed job, while it is still retained.
    pub fn artifacts(&self, job_id: &JobId) -> Option<JobArtifacts> {
        lock(&self.artifacts).get(job_id).cloned()
    }

    /// Stops the janitor and waits for every running job task to finish.
    pub async fn graceful_shutdown(&self) {
        self.shutdown.cancel();
        let janitor = lock(&self.janitor).take();
        if let Some(handle) = janitor {
            let _ = handle.await;
        }
        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        while tasks.join_next().await.is_some() {}
        tracing::info!("engine shut down");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

#[cfg(test)]
mod test {
    use futures::StreamExt;

    use crate::provider::test::{settings, MockTranslator};

    use super::*;

    fn engine() -> Engine {
        Engine::new(EngineConfig {
            admission: AdmissionConfig {
                min_interval: Duration::ZERO,
                max_active: 5,
            },
            retry: RetryPolicy {
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn source() -> Vec<u8> {
        let card: CharacterCard = serde_json::from_value(serde_json::json!({
            "data": {
                "name": "Aki",
                "description": "Hi",
                "alternate_greetings": ["A", "B"],
            },
        }))
        .unwrap();
        crate::codec::test::image_with_card(&card)
    }

    async fn wait_for_terminal(
        stream: impl Stream<Item = ProgressEvent>,
    ) -> Option<ProgressEvent> {
        let mut stream = Box::pin(stream);
        while let Some(event) = stream.next().await {
            if event.is_terminal() {
                return Some(event);
            }
        }
        None
    }

    #[tokio::test(start_paused = true)]
    async fn a_job_runs_to_completion_with_ordered_outputs() {
        let engine = engine();
        let job = engine.create_job().unwrap();
        let stream = engine.subscribe(&job.id);
        engine
            .start_job(
                &job.id,
                source(),
                &settings(),
                Arc::new(MockTranslator::with_map([
                    ("Hi", "嗨"),
                    ("A", "甲"),
                    ("B", "乙"),
                ])),
            )
            .unwrap();

        let terminal = wait_for_terminal(stream).await.unwrap();
        assert!(matches!(terminal, ProgressEvent::Completed { .. }));

        let report = engine.status(&job.id).unwrap();
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.percentage, 100.0);

        let artifacts = engine.artifacts(&job.id).unwrap();
        assert_eq!(artifacts.card.data.description.as_deref(), Some("嗨"));
        assert_eq!(artifacts.card.data.alternate_greetings, vec!["甲", "乙"]);
        let embedded = codec::decode(&artifacts.image).unwrap().unwrap();
        assert_eq!(embedded, artifacts.card);

        engine.graceful_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn an_always_rate_limited_provider_fails_the_job() {
        let engine = Engine::new(EngineConfig {
            admission: AdmissionConfig {
                min_interval: Duration::ZERO,
                max_active: 5,
            },
            failure_policy: FieldFailurePolicy::AbortJob,
            retry: RetryPolicy {
                max_retries: 3,
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        });
        let job = engine.create_job().unwrap();
        let stream = engine.subscribe(&job.id);
        engine
            .start_job(
                &job.id,
                source(),
                &settings(),
                Arc::new(MockTranslator::always_status(429)),
            )
            .unwrap();

        let terminal = wait_for_terminal(stream).await.unwrap();
        assert!(matches!(
            terminal,
            ProgressEvent::Error {
                kind: ErrorKind::RetriesExhausted,
                ..
            }
        ));

        let report = engine.status(&job.id).unwrap();
        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.retry_count, 3);
        assert_eq!(
            report.error.as_ref().map(|error| error.kind),
            Some(ErrorKind::RetriesExhausted)
        );
        assert!(engine.artifacts(&job.id).is_none());

        engine.graceful_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_settings_reject_the_start_and_leave_the_job_pending() {
        let engine = engine();
        let job = engine.create_job().unwrap();
        let blank_key = ProviderSettings {
            api_key: String::new(),
            ..settings()
        };

        let rejection = engine
            .start_job(
                &job.id,
                source(),
                &blank_key,
                Arc::new(MockTranslator::with_map([])),
            )
            .unwrap_err();

        assert_eq!(rejection.kind, ErrorKind::InvalidRequest);
        assert_eq!(engine.status(&job.id).unwrap().status, JobStatus::Pending);
        engine.graceful_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn admission_rejects_back_to_back_jobs() {
        let engine = Engine::new(EngineConfig::default());
        engine.create_job().unwrap();
        let rejection = engine.create_job().unwrap_err();
        assert_eq!(rejection.kind, ErrorKind::RateLimited);
        engine.graceful_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_running_job_ends_it_as_cancelled() {
        let engine = engine();
        let job = engine.create_job().unwrap();
        let stream = engine.subscribe(&job.id);
        let translator = MockTranslator::with_map([("Hi", "嗨"), ("A", "甲"), ("B", "乙")])
            .delayed(Duration::from_secs(5));
        engine
            .start_job(&job.id, source(), &settings(), Arc::new(translator))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(engine.cancel_job(&job.id));

        let terminal = wait_for_terminal(stream).await.unwrap();
        assert_eq!(terminal, ProgressEvent::Cancelled);
        assert_eq!(engine.status(&job.id).unwrap().status, JobStatus::Cancelled);

        engine.graceful_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_pending_job_releases_its_slot() {
        let engine = Engine::new(EngineConfig {
            admission: AdmissionConfig {
                min_interval: Duration::ZERO,
                max_active: 1,
            },
            ..Default::default()
        });
        let job = engine.create_job().unwrap();
        assert!(engine.create_job().is_err());

        assert!(engine.cancel_job(&job.id));
        assert!(engine.create_job().is_ok());
        engine.graceful_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn status_of_an_unknown_job_is_none() {
        let engine = engine();
        assert!(engine.status(&JobId::from("nope")).is_none());
        assert!(!engine.cancel_job(&JobId::from("nope")));
        engine.graceful_shutdown().await;
    }
}
