//! Best-effort progress notifications.
//!
//! Publishing never blocks the publisher and never fails the workflow: a
//! broadcast with no subscribers or a lagging subscriber simply drops events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use valor_core::db::unix_timestamp_millis;

use crate::workflow::{AgentErrorKind, Capability, Phase, WorkflowStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEventKind {
    PhaseChanged { status: WorkflowStatus },
    AgentStarted { capability: Capability },
    AgentRetrying { capability: Capability, attempt: u32, delay_ms: u64 },
    AgentSucceeded { capability: Capability },
    AgentFailed { capability: Capability, error: AgentErrorKind },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub workflow_id: String,
    pub phase: Phase,
    pub progress: f64,
    pub message: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: ProgressEventKind,
}

impl ProgressEvent {
    pub fn new(
        workflow_id: impl Into<String>,
        phase: Phase,
        progress: f64,
        kind: ProgressEventKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            phase,
            progress,
            message: message.into(),
            timestamp: unix_timestamp_millis(),
            kind,
        }
    }
}

/// Fire-and-forget event sink.
pub trait ProgressPublisher: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Fans events out to any number of in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl ProgressPublisher for BroadcastPublisher {
    fn publish(&self, event: ProgressEvent) {
        // Err means no receivers, which is fine.
        if self.tx.send(event).is_err() {
            trace!("Progress event dropped: no subscribers");
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl ProgressPublisher for NoopPublisher {
    fn publish(&self, _event: ProgressEvent) {}
}
