//! Background writer that keeps storage off the workflow hot path.
//!
//! Jobs are applied strictly in submission order, so a later state of a
//! workflow never gets overwritten by an earlier one. Store failures are
//! logged and dropped; in-memory state stays authoritative.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::WorkflowStore;
use crate::workflow::{ValidationResult, WorkflowState};

enum PersistJob {
    State(Box<WorkflowState>),
    Result {
        workflow_id: String,
        result: Box<ValidationResult>,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the writer task. Cloning shares the same queue.
#[derive(Clone)]
pub struct Persister {
    tx: mpsc::UnboundedSender<PersistJob>,
}

impl Persister {
    /// Spawn the writer on the current Tokio runtime.
    ///
    /// The task exits once every handle has been dropped and the queue drained.
    pub fn spawn(store: Arc<dyn WorkflowStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    PersistJob::State(state) => {
                        if let Err(e) = store.save_state(&state).await {
                            warn!(
                                workflow_id = %state.workflow_id,
                                error = %e,
                                "Failed to persist workflow state"
                            );
                        }
                    }
                    PersistJob::Result {
                        workflow_id,
                        result,
                    } => {
                        if let Err(e) = store.save_result(&workflow_id, &result).await {
                            warn!(%workflow_id, error = %e, "Failed to persist validation result");
                        }
                    }
                    PersistJob::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Persister stopped");
        });
        Self { tx }
    }

    pub fn save_state(&self, state: &WorkflowState) {
        self.submit(PersistJob::State(Box::new(state.clone())));
    }

    pub fn save_result(&self, workflow_id: &str, result: &ValidationResult) {
        self.submit(PersistJob::Result {
            workflow_id: workflow_id.to_string(),
            result: Box::new(result.clone()),
        });
    }

    /// Wait until every job submitted before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(PersistJob::Flush(done_tx));
        let _ = done_rx.await;
    }

    fn submit(&self, job: PersistJob) {
        if self.tx.send(job).is_err() {
            warn!("Persister is not running; job dropped");
        }
    }
}

impl std::fmt::Debug for Persister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persister")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::Map;

    use super::*;
    use crate::storage::MemoryStore;
    use crate::workflow::{Capability, Phase, Priority, ValidationRequest, WorkflowStatus};

    fn state() -> WorkflowState {
        WorkflowState::new(
            "wf-1",
            ValidationRequest {
                business_concept: "B2B BNPL".to_string(),
                target_market: "Nordics".to_string(),
                analysis_scope: vec![Capability::FraudDetection],
                priority: Priority::Normal,
                custom_parameters: Map::new(),
            },
        )
    }

    #[tokio::test]
    async fn flush_observes_every_prior_write() {
        let store = Arc::new(MemoryStore::new());
        let persister = Persister::spawn(store.clone());

        let mut state = state();
        persister.save_state(&state);
        state.start();
        state.advance(Phase::TaskDistribution).unwrap();
        persister.save_state(&state);
        persister.flush().await;

        let stored = store.state("wf-1").await.unwrap();
        assert_eq!(stored.status, WorkflowStatus::InProgress);
        assert_eq!(stored.current_phase, Phase::TaskDistribution);
    }

    #[tokio::test]
    async fn store_failure_does_not_stop_writer() {
        let store = Arc::new(MemoryStore::new());
        let persister = Persister::spawn(store.clone());
        let result = ValidationResult {
            overall_score: 0.0,
            confidence_level: 0.0,
            capability_results: BTreeMap::new(),
            recommendations: Vec::new(),
            data_quality_score: 0.0,
            analysis_completeness: 0.0,
            requested_count: 0,
            successful_count: 0,
            skipped: Vec::new(),
            quality_flags: Vec::new(),
        };

        // No workflow row yet: the store rejects the result.
        persister.save_result("wf-1", &result);
        persister.save_state(&state());
        persister.flush().await;

        assert!(store.state("wf-1").await.is_some());
        assert!(store.load_result("wf-1").await.unwrap().is_none());
    }
}
