//! Database queries for workflow state and results.

use valor_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{ValidationResultRow, WorkflowRow};
use crate::workflow::{ValidationResult, WorkflowState};

impl Database {
    // =========================================================================
    // Workflow queries
    // =========================================================================

    /// Insert or replace the stored state of a workflow.
    pub async fn upsert_workflow(&self, state: &WorkflowState) -> Result<(), DatabaseError> {
        let state_json = serde_json::to_string(state)?;
        let snapshot_json = serde_json::to_string(&state.snapshot())?;
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO workflows
                (id, status, phase, progress, error_count, state_json, snapshot_json,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                phase = excluded.phase,
                progress = excluded.progress,
                error_count = excluded.error_count,
                state_json = excluded.state_json,
                snapshot_json = excluded.snapshot_json,
                updated_at = excluded.updated_at
            ",
        )
        .bind(&state.workflow_id)
        .bind(state.status.as_str())
        .bind(state.current_phase.as_str())
        .bind(state.progress)
        .bind(i64::from(state.error_count))
        .bind(state_json)
        .bind(snapshot_json)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Get a workflow by ID.
    pub async fn get_workflow(&self, id: &str) -> Result<WorkflowRow, DatabaseError> {
        sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Workflow {id}")))
    }

    /// List workflows, newest first, optionally filtered by status.
    pub async fn list_workflows(
        &self,
        status_filter: Option<&str>,
        limit: i64,
    ) -> Result<Vec<WorkflowRow>, DatabaseError> {
        let rows = if let Some(status) = status_filter {
            sqlx::query_as::<_, WorkflowRow>(
                "SELECT * FROM workflows WHERE status = ? ORDER BY created_at DESC, id LIMIT ?",
            )
            .bind(status)
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, WorkflowRow>(
                "SELECT * FROM workflows ORDER BY created_at DESC, id LIMIT ?",
            )
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        };

        Ok(rows)
    }

    // =========================================================================
    // Result queries
    // =========================================================================

    /// Store the synthesized result of a workflow. The workflow row must exist.
    pub async fn upsert_result(
        &self,
        workflow_id: &str,
        result: &ValidationResult,
    ) -> Result<(), DatabaseError> {
        let result_json = serde_json::to_string(result)?;

        sqlx::query(
            r"
            INSERT INTO validation_results
                (workflow_id, overall_score, confidence_level, analysis_completeness,
                 result_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(workflow_id) DO UPDATE SET
                overall_score = excluded.overall_score,
                confidence_level = excluded.confidence_level,
                analysis_completeness = excluded.analysis_completeness,
                result_json = excluded.result_json
            ",
        )
        .bind(workflow_id)
        .bind(result.overall_score)
        .bind(result.confidence_level)
        .bind(result.analysis_completeness)
        .bind(result_json)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Get the stored result of a workflow.
    pub async fn get_result(&self, workflow_id: &str) -> Result<ValidationResultRow, DatabaseError> {
        sqlx::query_as::<_, ValidationResultRow>(
            "SELECT * FROM validation_results WHERE workflow_id = ?",
        )
        .bind(workflow_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Result for workflow {workflow_id}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::Map;

    use super::*;
    use crate::workflow::{Capability, Phase, Priority, ValidationRequest, WorkflowStatus};

    fn state(id: &str) -> WorkflowState {
        WorkflowState::new(
            id,
            ValidationRequest {
                business_concept: "Micro-insurance for couriers".to_string(),
                target_market: "Brazil".to_string(),
                analysis_scope: vec![Capability::RiskAssessment],
                priority: Priority::High,
                custom_parameters: Map::new(),
            },
        )
    }

    fn result() -> ValidationResult {
        ValidationResult {
            overall_score: 64.0,
            confidence_level: 0.7,
            capability_results: BTreeMap::new(),
            recommendations: vec!["Pilot first".to_string()],
            data_quality_score: 0.6,
            analysis_completeness: 1.0,
            requested_count: 1,
            successful_count: 1,
            skipped: Vec::new(),
            quality_flags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row() {
        let db = Database::open_in_memory().await.unwrap();
        let mut state = state("wf-1");
        db.upsert_workflow(&state).await.unwrap();

        state.start();
        state.advance(Phase::TaskDistribution).unwrap();
        db.upsert_workflow(&state).await.unwrap();

        let row = db.get_workflow("wf-1").await.unwrap();
        assert_eq!(row.status, "in_progress");
        assert_eq!(row.phase, "task_distribution");
        assert_eq!(row.progress, 0.05);
        let stored: WorkflowState = serde_json::from_str(&row.state_json).unwrap();
        assert_eq!(stored, state);
    }

    #[tokio::test]
    async fn missing_workflow_is_not_found() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(matches!(
            db.get_workflow("nope").await,
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let db = Database::open_in_memory().await.unwrap();
        let mut running = state("wf-a");
        running.start();
        db.upsert_workflow(&running).await.unwrap();
        db.upsert_workflow(&state("wf-b")).await.unwrap();

        let pending = db
            .list_workflows(Some(WorkflowStatus::Pending.as_str()), 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "wf-b");
        assert_eq!(db.list_workflows(None, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn result_requires_workflow_row() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(db.upsert_result("ghost", &result()).await.is_err());

        db.upsert_workflow(&state("wf-1")).await.unwrap();
        db.upsert_result("wf-1", &result()).await.unwrap();
        let row = db.get_result("wf-1").await.unwrap();
        assert_eq!(row.overall_score, 64.0);
        let stored: ValidationResult = serde_json::from_str(&row.result_json).unwrap();
        assert_eq!(stored, result());
    }
}
