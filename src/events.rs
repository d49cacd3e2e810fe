//! # Job Event Stream
//!
//! Process-wide push channel carrying job lifecycle events to whoever is
//! currently watching (normally the browser UI via server-sent events).
//!
//! ## Delivery Semantics:
//! - **Non-blocking publish**: workers never wait on observers; with no
//!   subscriber an event is simply dropped
//! - **No replay**: a new subscriber only sees events published after it
//!   subscribed
//! - **Bounded buffering**: a subscriber that falls more than `capacity` events
//!   behind skips the oldest ones
//!
//! ## Wire Format:
//! Every event becomes one SSE message:
//! ```text
//! event: completed
//! data: {"type":"completed","resource":"large-v3","kind":"download"}
//! ```
//! Failures and cancellations share the `error` event name.

use crate::jobs::JobKind;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;
use uuid::Uuid;

/// A lifecycle event for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Started {
        resource: String,
        kind: JobKind,
        job_id: Uuid,
    },
    Progress {
        resource: String,
        task: String,
        current: u64,
        total: Option<u64>,
    },
    Completed {
        resource: String,
        kind: JobKind,
    },
    Failed {
        resource: String,
        kind: JobKind,
        reason: String,
        detail: String,
    },
    Cancelled {
        resource: String,
        kind: JobKind,
    },
}

impl JobEvent {
    pub fn resource(&self) -> &str {
        match self {
            JobEvent::Started { resource, .. }
            | JobEvent::Progress { resource, .. }
            | JobEvent::Completed { resource, .. }
            | JobEvent::Failed { resource, .. }
            | JobEvent::Cancelled { resource, .. } => resource,
        }
    }

    /// Whether this event ends a job's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled { .. }
        )
    }

    /// SSE event name. Cancellations are reported the same way as failures.
    pub fn stream_name(&self) -> &'static str {
        match self {
            JobEvent::Started { .. } => "started",
            JobEvent::Progress { .. } => "progress",
            JobEvent::Completed { .. } => "completed",
            JobEvent::Failed { .. } | JobEvent::Cancelled { .. } => "error",
        }
    }

    /// Encode as one server-sent-events message.
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"type\":\"encoding_error\",\"message\":\"{}\"}}", e)
        });
        format!("event: {}\ndata: {}\n\n", self.stream_name(), data)
    }
}

/// Shared publish point for job events. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Never blocks; dropped when nobody is listening.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    /// Receive future events. Earlier events are never replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Infinite stream of future events, skipping over lag gaps.
    pub fn stream(&self) -> impl Stream<Item = JobEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(error = %err, "Event subscriber lagged behind");
                    None
                }
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
