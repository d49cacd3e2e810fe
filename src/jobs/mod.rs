//! # Background Jobs
//!
//! Long-running, cancellable operations (model downloads, transcription runs)
//! executed off the request path.
//!
//! ## Key Components:
//! - **Worker** (`worker.rs`): one tokio task per job with a cooperative stop signal
//! - **Registry** (`registry.rs`): table of in-flight jobs, at most one per resource
//! - **Operation**: the trait a job body implements, including its cleanup
//!
//! ## Job Lifecycle:
//! `started` → zero or more `progress` → exactly one of `completed`,
//! `failed` or `cancelled`. A failed or cancelled job has its partial state
//! discarded before the terminal event is published.

pub mod registry;
pub mod worker;

pub use registry::{JobRegistry, JobTicket};
pub use worker::StopSignal;

use crate::events::{EventBus, JobEvent};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// What a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Download,
    Transcription,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Download => write!(f, "download"),
            JobKind::Transcription => write!(f, "transcription"),
        }
    }
}

/// Failure inside a running job.
///
/// These never leave the worker: the registry turns them into a `failed`
/// (or `cancelled`) event.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job was cancelled")]
    Cancelled,

    #[error("transfer failed: {0:#}")]
    Transfer(anyhow::Error),

    #[error("transcription engine failed: {0:#}")]
    Engine(anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Full diagnostic text for the `failed` event.
    pub fn detail(&self) -> String {
        match self {
            JobError::Transfer(err) | JobError::Engine(err) => format!("{:?}", err),
            other => format!("{:?}", other),
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed { reason: String, detail: String },
    Cancelled,
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed)
    }
}

/// Everything a job body can see while it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub resource: String,
    pub job_id: Uuid,
    pub kind: JobKind,
    stop: StopSignal,
    events: EventBus,
}

impl JobContext {
    pub(crate) fn new(
        resource: String,
        job_id: Uuid,
        kind: JobKind,
        stop: StopSignal,
        events: EventBus,
    ) -> Self {
        Self {
            resource,
            job_id,
            kind,
            stop,
            events,
        }
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Safe point: bail out with `JobError::Cancelled` once a stop was requested.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        self.stop.checkpoint()
    }

    pub fn progress(&self, task: impl Into<String>, current: u64, total: Option<u64>) {
        self.events.publish(JobEvent::Progress {
            resource: self.resource.clone(),
            task: task.into(),
            current,
            total,
        });
    }
}

/// A job body plus the cleanup that undoes its partial work.
#[async_trait]
pub trait Operation: Send + 'static {
    fn kind(&self) -> JobKind;

    /// Do the work, calling `ctx.checkpoint()` at safe points.
    async fn run(&mut self, ctx: &JobContext) -> Result<(), JobError>;

    /// Remove partial state after a failure or cancellation.
    ///
    /// Must only touch artifacts this job created.
    async fn discard(&mut self) -> anyhow::Result<()>;
}
