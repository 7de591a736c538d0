//! Durable workflow storage.
//!
//! The orchestrator only talks to [`WorkflowStore`]. `SQLite` backs it in
//! production; [`MemoryStore`] serves tests and one-shot CLI runs.

mod db;
mod models;
mod persister;
mod queries;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::workflow::{StatusSnapshot, ValidationResult, WorkflowState};

pub use db::{Database, DatabaseError};
pub use models::{ValidationResultRow, WorkflowRow};
pub use persister::Persister;

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn save_state(&self, state: &WorkflowState) -> Result<(), DatabaseError>;

    async fn save_result(
        &self,
        workflow_id: &str,
        result: &ValidationResult,
    ) -> Result<(), DatabaseError>;

    async fn load_snapshot(&self, workflow_id: &str) -> Result<Option<StatusSnapshot>, DatabaseError>;

    async fn load_result(&self, workflow_id: &str)
    -> Result<Option<ValidationResult>, DatabaseError>;
}

#[async_trait]
impl WorkflowStore for Database {
    async fn save_state(&self, state: &WorkflowState) -> Result<(), DatabaseError> {
        self.upsert_workflow(state).await
    }

    async fn save_result(
        &self,
        workflow_id: &str,
        result: &ValidationResult,
    ) -> Result<(), DatabaseError> {
        self.upsert_result(workflow_id, result).await
    }

    async fn load_snapshot(&self, workflow_id: &str) -> Result<Option<StatusSnapshot>, DatabaseError> {
        match self.get_workflow(workflow_id).await {
            Ok(row) => Ok(Some(serde_json::from_str(&row.snapshot_json)?)),
            Err(DatabaseError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn load_result(
        &self,
        workflow_id: &str,
    ) -> Result<Option<ValidationResult>, DatabaseError> {
        match self.get_result(workflow_id).await {
            Ok(row) => Ok(Some(serde_json::from_str(&row.result_json)?)),
            Err(DatabaseError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Process-local store. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: RwLock<HashMap<String, WorkflowState>>,
    results: RwLock<HashMap<String, ValidationResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn state(&self, workflow_id: &str) -> Option<WorkflowState> {
        self.states.read().await.get(workflow_id).cloned()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn save_state(&self, state: &WorkflowState) -> Result<(), DatabaseError> {
        self.states
            .write()
            .await
            .insert(state.workflow_id.clone(), state.clone());
        Ok(())
    }

    async fn save_result(
        &self,
        workflow_id: &str,
        result: &ValidationResult,
    ) -> Result<(), DatabaseError> {
        if !self.states.read().await.contains_key(workflow_id) {
            return Err(DatabaseError::NotFound(format!("Workflow {workflow_id}")));
        }
        self.results
            .write()
            .await
            .insert(workflow_id.to_string(), result.clone());
        Ok(())
    }

    async fn load_snapshot(&self, workflow_id: &str) -> Result<Option<StatusSnapshot>, DatabaseError> {
        Ok(self
            .states
            .read()
            .await
            .get(workflow_id)
            .map(WorkflowState::snapshot))
    }

    async fn load_result(
        &self,
        workflow_id: &str,
    ) -> Result<Option<ValidationResult>, DatabaseError> {
        Ok(self.results.read().await.get(workflow_id).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use serde_json::Map;

    use super::*;
    use crate::workflow::{Capability, Priority, ValidationRequest};

    fn state(id: &str) -> WorkflowState {
        WorkflowState::new(
            id,
            ValidationRequest {
                business_concept: "Tokenized receivables".to_string(),
                target_market: "Singapore".to_string(),
                analysis_scope: vec![Capability::RegulatoryCompliance],
                priority: Priority::Normal,
                custom_parameters: Map::new(),
            },
        )
    }

    async fn exercise(store: Arc<dyn WorkflowStore>) {
        assert!(store.load_snapshot("wf-1").await.unwrap().is_none());
        let mut state = state("wf-1");
        store.save_state(&state).await.unwrap();
        state.start();
        store.save_state(&state).await.unwrap();

        let snapshot = store.load_snapshot("wf-1").await.unwrap().unwrap();
        assert_eq!(snapshot, state.snapshot());
        assert!(store.load_result("wf-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn database_store_contract() {
        exercise(Arc::new(Database::open_in_memory().await.unwrap())).await;
    }
}
