//! # Cancellable Worker
//!
//! Runs one unit of work on its own tokio task and lets other tasks ask it to
//! stop and wait for it to exit.
//!
//! Stopping is cooperative. `request_stop` only raises a flag; the task body
//! must look at its `StopSignal` at safe points (between download chunks,
//! between engine stages) and return. A body that never looks runs to
//! completion. Nothing is ever aborted from the outside.

use crate::jobs::JobError;
use std::future::Future;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// The task-side view of a stop request.
#[derive(Debug, Clone)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    #[cfg(test)]
    pub(crate) fn from_token(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    /// Safe point: returns `JobError::Cancelled` if a stop was requested.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.is_stop_requested() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Await `work`, giving up with `JobError::Cancelled` as soon as a stop is
    /// requested. For waits that may never finish on their own, such as a
    /// stalled socket read.
    pub async fn or_stopped<F: Future>(&self, work: F) -> Result<F::Output, JobError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(JobError::Cancelled),
            output = work => Ok(output),
        }
    }
}

/// Handle to a spawned worker. Clones refer to the same worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    stop: CancellationToken,
    exited: CancellationToken,
}

impl WorkerHandle {
    /// Spawn `task` on `runtime`.
    ///
    /// The exit flag is tied to a drop guard owned by the task, so `join`
    /// returns even if the task body panics.
    pub fn spawn<F, Fut>(runtime: &Handle, task: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let exited = CancellationToken::new();
        let exit_guard = exited.clone().drop_guard();
        let body = task(StopSignal {
            token: stop.clone(),
        });

        runtime.spawn(async move {
            let _exit_guard = exit_guard;
            body.await;
        });

        Self {
            stop,
            exited,
        }
    }

    /// Ask the task to stop at its next safe point. Idempotent.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Wait until the task has fully exited, however it ended.
    pub async fn join(&self) {
        self.exited.cancelled().await
    }

    pub fn is_finished(&self) -> bool {
        self.exited.is_cancelled()
    }
}
