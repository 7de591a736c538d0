//! Per-workflow state and its lifecycle.
//!
//! A [`WorkflowState`] is owned by exactly one driver task. Every mutation
//! goes through the methods here so the phase order and the monotonic
//! progress rule hold no matter which caller is driving.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use valor_core::db::unix_timestamp_millis;

use super::types::{AgentResult, Capability, ValidationRequest};

/// Progress reached on entering data synthesis. Agent completions fill the
/// range between [`Phase::ParallelExecution`]'s entry value and this.
const EXECUTION_CEILING: f64 = 0.80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initialization,
    TaskDistribution,
    ParallelExecution,
    DataSynthesis,
    QualityAssurance,
    Completion,
    Failed,
    Cancelled,
}

impl Phase {
    /// The phase that must follow this one on the forward path.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Initialization => Some(Self::TaskDistribution),
            Self::TaskDistribution => Some(Self::ParallelExecution),
            Self::ParallelExecution => Some(Self::DataSynthesis),
            Self::DataSynthesis => Some(Self::QualityAssurance),
            Self::QualityAssurance => Some(Self::Completion),
            Self::Completion | Self::Failed | Self::Cancelled => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completion | Self::Failed | Self::Cancelled)
    }

    /// Progress value a workflow holds at least once it enters this phase.
    /// Terminal failure phases carry no floor; progress freezes where it was.
    pub const fn entry_progress(self) -> f64 {
        match self {
            Self::Initialization | Self::Failed | Self::Cancelled => 0.0,
            Self::TaskDistribution => 0.05,
            Self::ParallelExecution => 0.10,
            Self::DataSynthesis => EXECUTION_CEILING,
            Self::QualityAssurance => 0.90,
            Self::Completion => 1.0,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::TaskDistribution => "task_distribution",
            Self::ParallelExecution => "parallel_execution",
            Self::DataSynthesis => "data_synthesis",
            Self::QualityAssurance => "quality_assurance",
            Self::Completion => "completion",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a workflow ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Rejected at admission by the cost guard.
    BudgetExceeded { reason: String },
    /// More errors accumulated than the configured ceiling allows.
    ErrorCeilingExceeded { error_count: u32, ceiling: u32 },
    /// An internal fault stopped the driver.
    Fatal { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExceeded { reason } => write!(f, "budget exceeded: {reason}"),
            Self::ErrorCeilingExceeded {
                error_count,
                ceiling,
            } => write!(f, "error count {error_count} exceeded ceiling {ceiling}"),
            Self::Fatal { message } => write!(f, "fatal: {message}"),
        }
    }
}

/// Rejected phase change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: Phase,
    pub to: Phase,
}

/// Point-in-time, read-only view of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub current_phase: Phase,
    pub progress: f64,
    pub active_agents: Vec<Capability>,
    pub completed_tasks: Vec<Capability>,
    pub pending_tasks: Vec<Capability>,
    pub skipped_tasks: Vec<Capability>,
    pub error_count: u32,
    pub created_at: i64,
    pub last_activity: i64,
    /// Unix millis; None until progress allows an estimate.
    pub estimated_completion: Option<i64>,
    pub failure: Option<FailureReason>,
}

/// Full mutable state of one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub request: ValidationRequest,
    pub status: WorkflowStatus,
    pub current_phase: Phase,
    pub progress: f64,
    pub active_agents: BTreeSet<Capability>,
    pub completed_tasks: BTreeSet<Capability>,
    pub pending_tasks: BTreeSet<Capability>,
    pub skipped_tasks: BTreeSet<Capability>,
    pub error_count: u32,
    pub agent_results: BTreeMap<Capability, AgentResult>,
    pub failure: Option<FailureReason>,
    pub created_at: i64,
    pub last_activity: i64,
    pub estimated_completion: Option<i64>,
    /// Tasks dispatched in parallel execution; sizes each agent's progress share.
    dispatched: usize,
}

impl WorkflowState {
    pub fn new(workflow_id: impl Into<String>, request: ValidationRequest) -> Self {
        let now = unix_timestamp_millis();
        Self {
            workflow_id: workflow_id.into(),
            request,
            status: WorkflowStatus::Pending,
            current_phase: Phase::Initialization,
            progress: 0.0,
            active_agents: BTreeSet::new(),
            completed_tasks: BTreeSet::new(),
            pending_tasks: BTreeSet::new(),
            skipped_tasks: BTreeSet::new(),
            error_count: 0,
            agent_results: BTreeMap::new(),
            failure: None,
            created_at: now,
            last_activity: now,
            estimated_completion: None,
            dispatched: 0,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the driver as running; the workflow stays in `initialization`.
    pub fn start(&mut self) {
        if self.status == WorkflowStatus::Pending {
            self.status = WorkflowStatus::InProgress;
            self.touch();
        }
    }

    /// Advance to the next phase on the forward path.
    ///
    /// Entering `completion` completes the workflow. Failure and cancellation
    /// go through [`Self::fail`] and [`Self::cancel`] instead.
    pub fn advance(&mut self, to: Phase) -> Result<(), TransitionError> {
        if self.is_terminal() || self.current_phase.next() != Some(to) {
            return Err(TransitionError {
                from: self.current_phase,
                to,
            });
        }
        self.current_phase = to;
        self.status = if to == Phase::Completion {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::InProgress
        };
        self.raise_progress(to.entry_progress());
        self.touch();
        Ok(())
    }

    /// Record the task list produced by distribution.
    pub fn plan(
        &mut self,
        dispatched: impl IntoIterator<Item = Capability>,
        skipped: impl IntoIterator<Item = Capability>,
    ) {
        self.pending_tasks = dispatched.into_iter().collect();
        self.skipped_tasks = skipped.into_iter().collect();
        self.dispatched = self.pending_tasks.len();
        self.touch();
    }

    /// A pool slot was granted and the agent is running.
    pub fn mark_active(&mut self, capability: Capability) {
        if self.pending_tasks.remove(&capability) {
            self.active_agents.insert(capability);
            self.touch();
        }
    }

    /// Record a terminal agent outcome and credit its progress share.
    ///
    /// Returns false when the capability already has a result.
    pub fn record_result(&mut self, result: AgentResult) -> bool {
        let capability = result.capability;
        if self.agent_results.contains_key(&capability) {
            return false;
        }
        self.pending_tasks.remove(&capability);
        self.active_agents.remove(&capability);
        self.completed_tasks.insert(capability);
        if !result.success {
            self.error_count = self.error_count.saturating_add(1);
        }
        self.agent_results.insert(capability, result);

        if self.dispatched > 0 {
            #[allow(clippy::cast_precision_loss)]
            let done = self.completed_tasks.len() as f64 / self.dispatched as f64;
            let floor = Phase::ParallelExecution.entry_progress();
            self.raise_progress((EXECUTION_CEILING - floor).mul_add(done, floor));
        }
        self.touch();
        true
    }

    /// Capabilities dispatched but not yet terminal.
    pub fn outstanding(&self) -> Vec<Capability> {
        self.pending_tasks
            .iter()
            .chain(&self.active_agents)
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Count an internal fault towards the error ceiling.
    pub fn record_fault(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
        self.touch();
    }

    /// Whether the error count has gone past `ceiling`.
    pub const fn exceeds(&self, ceiling: u32) -> bool {
        self.error_count > ceiling
    }

    /// Move to `failed`. No-op once terminal.
    pub fn fail(&mut self, reason: FailureReason) {
        if self.is_terminal() {
            return;
        }
        self.status = WorkflowStatus::Failed;
        self.current_phase = Phase::Failed;
        self.failure = Some(reason);
        self.active_agents.clear();
        self.touch();
    }

    /// Move to `cancelled`, freezing progress. No-op once terminal.
    pub fn cancel(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = WorkflowStatus::Cancelled;
        self.current_phase = Phase::Cancelled;
        self.active_agents.clear();
        self.touch();
    }

    /// Progress never decreases and never leaves [0, 1].
    fn raise_progress(&mut self, value: f64) {
        if value.is_finite() {
            self.progress = self.progress.max(value.clamp(0.0, 1.0));
        }
    }

    fn touch(&mut self) {
        let now = unix_timestamp_millis().max(self.last_activity);
        self.last_activity = now;
        self.estimated_completion = if self.is_terminal() {
            Some(now)
        } else if self.progress > 0.0 {
            let elapsed = (now - self.created_at).max(0);
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
            let total = (elapsed as f64 / self.progress) as i64;
            Some(self.created_at + total)
        } else {
            None
        };
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            current_phase: self.current_phase,
            progress: self.progress,
            active_agents: self.active_agents.iter().copied().collect(),
            completed_tasks: self.completed_tasks.iter().copied().collect(),
            pending_tasks: self.pending_tasks.iter().copied().collect(),
            skipped_tasks: self.skipped_tasks.iter().copied().collect(),
            error_count: self.error_count,
            created_at: self.created_at,
            last_activity: self.last_activity,
            estimated_completion: self.estimated_completion,
            failure: self.failure.clone(),
        }
    }
}
