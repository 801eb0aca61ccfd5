//! Per-job progress push channels.
//!
//! The driver publishes events as it works; clients subscribe to a job and
//! receive an ordered stream starting with `connected`, interleaved with
//! periodic heartbeats while the job is quiet. A terminal event (`completed`,
//! `error`, `cancelled`) ends the stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{ErrorKind, TranslationError};
use crate::job::JobId;

/// Where a field currently is in its translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Completed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Connected {
        job_id: JobId,
    },
    Progress {
        field: String,
        phase: Phase,
        completed: u32,
        total: u32,
        percentage: f32,
    },
    Error {
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
    Cancelled,
    Completed {
        outputs: HashMap<String, String>,
    },
    Heartbeat,
}

impl ProgressEvent {
    pub fn error(error: &TranslationError) -> Self {
        Self::Error {
            kind: error.kind,
            message: error.message.clone(),
            retryable: error.is_retryable(),
        }
    }

    /// Terminal events end a subscriber's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Error { .. } | Self::Cancelled | Self::Completed { .. }
        )
    }
}

/// The inbound control token a client may send to keep its channel alive.
pub const KEEP_ALIVE: &str = "ping";

type Subscribers = HashMap<JobId, Vec<mpsc::UnboundedSender<ProgressEvent>>>;

/// Routes events from the driver to any number of per-job subscribers.
pub struct ProgressHub {
    subscribers: Mutex<Subscribers>,
    heartbeat: Duration,
}

impl ProgressHub {
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            heartbeat,
        }
    }

    /// Delivers an event to every live subscriber of `job_id`.
    ///
    /// Publishing to a job with no subscribers is a quiet no-op; progress is
    /// advisory and never blocks the driver.
    pub fn publish(&self, job_id: &JobId, event: ProgressEvent) {
        let mut subscribers = self.lock();
        if let Some(senders) = subscribers.get_mut(job_id) {
            senders.retain(|sender| sender.send(event.clone()).is_ok());
            if senders.is_empty() {
                subscribers.remove(job_id);
            }
        }
    }

    /// Handles an inbound control message from a subscriber.
    ///
    /// The keep-alive token is answered with a heartbeat; anything else is
    /// ignored.
    pub fn handle_control(&self, job_id: &JobId, message: &str) {
        if message == KEEP_ALIVE {
            self.publish(job_id, ProgressEvent::Heartbeat);
        }
    }

    /// Opens an event stream for a job.
    ///
    /// The first item is always `connected`. Heartbeats are emitted while no
    /// event arrives; the stream ends after a terminal event or once the hub
    /// releases the job.
    pub fn subscribe(self: &Arc<Self>, job_id: &JobId) -> impl Stream<Item = ProgressEvent> {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.lock().entry(job_id.clone()).or_default().push(sender);
        let job_id = job_id.clone();
        let heartbeat = self.heartbeat;
        async_stream::stream! {
            yield ProgressEvent::Connected { job_id };
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                tokio::select! {
                    event = receiver.recv() => {
                        let Some(event) = event else { break };
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            break;
                        }
                        ticker.reset();
                    }
                    _ = ticker.tick() => {
                        yield ProgressEvent::Heartbeat;
                    }
                }
            }
        }
    }

    /// Drops every subscriber of a job, ending their streams.
    pub fn release(&self, job_id: &JobId) {
        self.lock().remove(job_id);
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(|err| err.into_inner())
    }
}
