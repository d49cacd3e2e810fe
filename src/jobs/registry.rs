//! # Job Registry
//!
//! Table of in-flight jobs keyed by resource id (a model name for downloads,
//! a file id for transcriptions).
//!
//! ## Guarantees:
//! - **At most one job per resource**: a second `start` for a busy resource
//!   fails with `AlreadyRunning`; the check and the insert happen under one lock
//! - **Exactly one terminal event per job**: only the job's own worker
//!   publishes it, after cleanup, and only once
//! - **No leaked entries**: the worker removes its entry however the body
//!   ends (success, error, cancellation or panic)
//!
//! ## Runtime:
//! Workers run on the tokio runtime the registry was created on, not on the
//! runtime of whoever calls `start`. HTTP worker runtimes go away when the
//! server stops; jobs must survive that so shutdown can still stop and clean
//! them up.
//!
//! ## Thread Safety:
//! The table sits behind a `parking_lot::Mutex`. It is never held across an
//! `.await`; `stop` collects handles under the lock and joins outside it,
//! because exiting workers need the lock to reap themselves.

use crate::error::{AppError, AppResult};
use crate::events::{EventBus, JobEvent};
use crate::jobs::worker::WorkerHandle;
use crate::jobs::{JobContext, JobError, JobKind, JobOutcome, Operation};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct Job {
    id: Uuid,
    kind: JobKind,
    handle: WorkerHandle,
    started_at: DateTime<Utc>,
}

/// Running or asked to stop but not yet exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Cancelling,
}

/// Read-only view of an in-flight job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub resource: String,
    pub kind: JobKind,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
}

/// Returned by `start`; lets the caller wait for the job if it wants to.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub job_id: Uuid,
    pub resource: String,
    handle: WorkerHandle,
    outcome: Arc<OnceLock<JobOutcome>>,
}

impl JobTicket {
    /// Wait for the job to end and return how it ended.
    pub async fn wait(&self) -> JobOutcome {
        self.handle.join().await;
        self.outcome.get().cloned().unwrap_or_else(|| JobOutcome::Failed {
            reason: "worker exited without reporting an outcome".to_string(),
            detail: String::new(),
        })
    }
}

struct Inner {
    jobs: Mutex<HashMap<String, Job>>,
    events: EventBus,
    runtime: Option<Handle>,
}

/// Owns every in-flight job. Create one per process and share clones.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<Inner>,
}

impl JobRegistry {
    /// Created outside a runtime, jobs run on whichever runtime starts them.
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                events,
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Start `operation` for `resource` on its own worker.
    ///
    /// Returns as soon as the worker is spawned. Fails with `AlreadyRunning`
    /// if the resource already has a job.
    pub fn start<O: Operation>(&self, resource: &str, operation: O) -> AppResult<JobTicket> {
        let mut jobs = self.inner.jobs.lock();
        if let Some(existing) = jobs.get(resource) {
            debug!(resource, job_id = %existing.id, "Rejecting duplicate job");
            return Err(AppError::AlreadyRunning(resource.to_string()));
        }

        let job_id = Uuid::new_v4();
        let kind = operation.kind();
        let outcome = Arc::new(OnceLock::new());

        self.inner.events.publish(JobEvent::Started {
            resource: resource.to_string(),
            kind,
            job_id,
        });

        let inner = Arc::clone(&self.inner);
        let resource_owned = resource.to_string();
        let outcome_slot = Arc::clone(&outcome);
        let runtime = self.inner.runtime.clone().unwrap_or_else(Handle::current);
        let handle = WorkerHandle::spawn(&runtime, move |stop| {
            let ctx = JobContext::new(resource_owned, job_id, kind, stop, inner.events.clone());
            run_job(inner, ctx, operation, outcome_slot)
        });

        jobs.insert(
            resource.to_string(),
            Job {
                id: job_id,
                kind,
                handle: handle.clone(),
                started_at: Utc::now(),
            },
        );
        info!(resource, job_id = %job_id, kind = %kind, "Job started");

        Ok(JobTicket {
            job_id,
            resource: resource.to_string(),
            handle,
            outcome,
        })
    }

    /// Stop the job for `resource` and wait until it has exited and cleaned up.
    ///
    /// Returns false if no job was running for it.
    pub async fn stop(&self, resource: &str) -> bool {
        let handle = self
            .inner
            .jobs
            .lock()
            .get(resource)
            .map(|job| job.handle.clone());

        match handle {
            Some(handle) => {
                info!(resource, "Stop requested");
                handle.request_stop();
                handle.join().await;
                true
            }
            None => false,
        }
    }

    /// Stop every job. With nothing running this does nothing at all.
    pub async fn stop_all(&self) -> usize {
        self.stop_matching(|_| true).await
    }

    /// Stop every job of one kind.
    pub async fn stop_all_of(&self, kind: JobKind) -> usize {
        self.stop_matching(|job_kind| job_kind == kind).await
    }

    async fn stop_matching(&self, filter: impl Fn(JobKind) -> bool) -> usize {
        let handles: Vec<WorkerHandle> = self
            .inner
            .jobs
            .lock()
            .values()
            .filter(|job| filter(job.kind))
            .map(|job| job.handle.clone())
            .collect();

        if handles.is_empty() {
            return 0;
        }

        info!(count = handles.len(), "Stopping jobs");
        for handle in &handles {
            handle.request_stop();
        }
        join_all(handles.iter().map(|handle| handle.join())).await;
        handles.len()
    }

    pub fn is_active(&self, resource: &str) -> bool {
        self.inner.jobs.lock().contains_key(resource)
    }

    pub fn active_count(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    /// In-flight jobs, oldest first.
    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self
            .inner
            .jobs
            .lock()
            .iter()
            .map(|(resource, job)| JobSnapshot {
                job_id: job.id,
                resource: resource.clone(),
                kind: job.kind,
                state: if job.handle.is_stop_requested() {
                    JobState::Cancelling
                } else {
                    JobState::Running
                },
                started_at: job.started_at,
            })
            .collect();
        jobs.sort_by_key(|job| job.started_at);
        jobs
    }
}

/// Worker body: run, classify, clean up, reap, publish.
async fn run_job<O: Operation>(
    inner: Arc<Inner>,
    ctx: JobContext,
    mut operation: O,
    outcome_slot: Arc<OnceLock<JobOutcome>>,
) {
    let result = if ctx.stop_signal().is_stop_requested() {
        Ok(Err(JobError::Cancelled))
    } else {
        AssertUnwindSafe(operation.run(&ctx)).catch_unwind().await
    };

    let outcome = match result {
        Ok(Ok(())) => JobOutcome::Completed,
        Ok(Err(JobError::Cancelled)) => JobOutcome::Cancelled,
        Ok(Err(err)) if ctx.stop_signal().is_stop_requested() => {
            debug!(resource = %ctx.resource, error = %err, "Job errored while stopping");
            JobOutcome::Cancelled
        }
        Ok(Err(err)) => JobOutcome::Failed {
            reason: err.to_string(),
            detail: err.detail(),
        },
        Err(panic) => JobOutcome::Failed {
            reason: "job panicked".to_string(),
            detail: panic_message(&*panic),
        },
    };

    // A panicking cleanup must not keep the resource marked in flight.
    if !outcome.is_completed() {
        match AssertUnwindSafe(operation.discard()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(resource = %ctx.resource, error = %err, "Failed to discard partial job state")
            }
            Err(panic) => {
                error!(resource = %ctx.resource, panic = %panic_message(&*panic), "Discard panicked")
            }
        }
    }

    let terminal = match &outcome {
        JobOutcome::Completed => {
            info!(resource = %ctx.resource, job_id = %ctx.job_id, kind = %ctx.kind, "Job completed");
            JobEvent::Completed {
                resource: ctx.resource.clone(),
                kind: ctx.kind,
            }
        }
        JobOutcome::Cancelled => {
            info!(resource = %ctx.resource, job_id = %ctx.job_id, kind = %ctx.kind, "Job cancelled");
            JobEvent::Cancelled {
                resource: ctx.resource.clone(),
                kind: ctx.kind,
            }
        }
        JobOutcome::Failed { reason, detail } => {
            error!(resource = %ctx.resource, job_id = %ctx.job_id, kind = %ctx.kind, reason = %reason, "Job failed");
            JobEvent::Failed {
                resource: ctx.resource.clone(),
                kind: ctx.kind,
                reason: reason.clone(),
                detail: detail.clone(),
            }
        }
    };

    let _ = outcome_slot.set(outcome);

    // Reap and publish under the lock so a new job for this resource cannot
    // announce itself before this one's terminal event.
    let mut jobs = inner.jobs.lock();
    if jobs.get(&ctx.resource).map(|job| job.id) == Some(ctx.job_id) {
        jobs.remove(&ctx.resource);
    }
    inner.events.publish(terminal);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
