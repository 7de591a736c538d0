//! Database row types.

use serde::{Deserialize, Serialize};

/// Workflow record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkflowRow {
    pub id: String,
    pub status: String,
    pub phase: String,
    pub progress: f64,
    pub error_count: i64,
    pub state_json: String,
    pub snapshot_json: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Validation result record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ValidationResultRow {
    pub workflow_id: String,
    pub overall_score: f64,
    pub confidence_level: f64,
    pub analysis_completeness: f64,
    pub result_json: String,
    pub created_at: i64,
}
