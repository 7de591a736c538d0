//! Workflow domain model.

pub mod state;
pub mod types;

pub use state::{FailureReason, Phase, StatusSnapshot, TransitionError, WorkflowState, WorkflowStatus};
pub use types::{
    AgentError, AgentErrorKind, AgentResult, AgentTask, Capability, Complexity, Priority,
    QualityFlag, ValidationRequest, ValidationResult,
};
