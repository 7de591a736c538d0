//! Validation workflow supervisor.
//!
//! [`SupervisorOrchestrator`] is the high-level coordinator that:
//! - admits requests through the cost guard
//! - drives each accepted workflow through its phases on a dedicated task
//! - fans capability agents out under the profile's concurrency limit
//! - publishes snapshots and progress events, and persists state off the hot path
//!
//! Each workflow has exactly one writer, its driver task. Readers see
//! snapshots through a `watch` channel, so a status query never waits on
//! the driver and never observes a half-applied update.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use valor_core::{Config, CostProfile};

use crate::capability::HandlerRegistry;
use crate::guard::{BudgetGuard, CostGuard, ModelSelector, TieredModelSelector, estimate_workflow_cost};
use crate::progress::{BroadcastPublisher, ProgressEvent, ProgressEventKind, ProgressPublisher};
use crate::storage::{DatabaseError, MemoryStore, Persister, WorkflowStore};
use crate::workflow::{
    AgentErrorKind, AgentResult, AgentTask, Capability, Complexity, FailureReason, Phase,
    StatusSnapshot, ValidationRequest, ValidationResult, WorkflowState, WorkflowStatus,
};

use super::pool::AgentPool;
use super::runner::{AgentTaskRunner, RetryPolicy, RunContext};
use super::synthesis;

/// Errors from the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Workflow not found: {id}")]
    NotFound { id: String },

    #[error("Workflow {id} has no result (status: {status})")]
    NoResult { id: String, status: WorkflowStatus },

    #[error("Orchestrator at capacity: {limit} live workflows")]
    AtCapacity { limit: usize },

    #[error("Configuration error: {0}")]
    Config(#[from] valor_core::Error),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Returned by [`SupervisorOrchestrator::start_workflow`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTicket {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub failure: Option<FailureReason>,
}

/// Injectable collaborators of the orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    pub guard: Arc<dyn CostGuard>,
    pub selector: Arc<dyn ModelSelector>,
    pub publisher: Arc<dyn ProgressPublisher>,
    pub store: Arc<dyn WorkflowStore>,
}

impl Collaborators {
    /// Budget guard, tiered selector, broadcast publisher and in-memory store,
    /// all configured from `config`.
    pub fn from_config(config: &Config) -> Result<Self, OrchestratorError> {
        let profile = config.cost.profile()?;
        Ok(Self {
            guard: Arc::new(BudgetGuard::from_profile(&config.cost, profile)),
            selector: Arc::new(TieredModelSelector::new(
                profile.default_tier,
                config.models.clone(),
                config.cost.clone(),
            )),
            publisher: Arc::new(BroadcastPublisher::new(config.orchestrator.event_buffer)),
            store: Arc::new(MemoryStore::new()),
        })
    }
}

/// Why a driver stopped before completion.
enum Halt {
    Cancelled,
    Failed(FailureReason),
}

/// Handles kept for a workflow that has not yet been retired.
struct LiveWorkflow {
    status_tx: Arc<watch::Sender<StatusSnapshot>>,
    cancel: CancellationToken,
}

/// Everything the driver task owns for one workflow.
struct WorkflowRun {
    state: WorkflowState,
    status_tx: Arc<watch::Sender<StatusSnapshot>>,
    cancel: CancellationToken,
    /// Absolute workflow deadline, if configured.
    deadline: Option<Instant>,
}

impl WorkflowRun {
    /// Apply `f` and publish the new snapshot atomically with respect to
    /// cancellation. Refused once cancellation has been accepted.
    fn update<R>(&mut self, f: impl FnOnce(&mut WorkflowState) -> R) -> Result<R, Halt> {
        let Self {
            state,
            status_tx,
            cancel,
            ..
        } = self;
        let mut out = None;
        status_tx.send_if_modified(|snapshot| {
            if cancel.is_cancelled() {
                return false;
            }
            out = Some(f(state));
            *snapshot = state.snapshot();
            true
        });
        out.ok_or(Halt::Cancelled)
    }

    fn settle_cancelled(&mut self) {
        self.state.cancel();
        self.status_tx.send_replace(self.state.snapshot());
    }

    /// Fail the workflow unless cancellation won the race.
    fn settle_failed(&mut self, reason: FailureReason) {
        if self.update(|s| s.fail(reason)).is_err() {
            self.settle_cancelled();
        }
    }

    fn id(&self) -> &str {
        &self.state.workflow_id
    }
}

/// Coordinates every validation workflow of the process.
pub struct SupervisorOrchestrator {
    config: Config,
    profile: CostProfile,
    handlers: HandlerRegistry,
    guard: Arc<dyn CostGuard>,
    selector: Arc<dyn ModelSelector>,
    publisher: Arc<dyn ProgressPublisher>,
    store: Arc<dyn WorkflowStore>,
    persister: Persister,
    /// Workflows not yet retired, keyed by workflow ID.
    live: Arc<RwLock<HashMap<String, LiveWorkflow>>>,
    /// Recently retired workflows; older ones are answered from the store.
    archive: Arc<RwLock<Archive>>,
    /// Results of completed workflows that are still live.
    results: Arc<RwLock<HashMap<String, ValidationResult>>>,
}

impl SupervisorOrchestrator {
    /// Create an orchestrator. Must be called inside a Tokio runtime, since
    /// the storage writer task is spawned here.
    pub fn new(
        config: Config,
        handlers: HandlerRegistry,
        collaborators: Collaborators,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let profile = config.cost.profile()?.clone();
        let persister = Persister::spawn(Arc::clone(&collaborators.store));
        let archive = Archive::new(config.orchestrator.max_archived_workflows);

        info!(
            profile = %config.cost.active_profile,
            max_concurrent_agents = profile.max_concurrent_agents,
            handlers = handlers.len(),
            "SupervisorOrchestrator created"
        );

        Ok(Self {
            config,
            profile,
            handlers,
            guard: collaborators.guard,
            selector: collaborators.selector,
            publisher: collaborators.publisher,
            store: collaborators.store,
            persister,
            live: Arc::new(RwLock::new(HashMap::new())),
            archive: Arc::new(RwLock::new(archive)),
            results: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Validate and admit a request, then start its workflow in the background.
    ///
    /// A request rejected by the cost guard still gets a workflow ID, whose
    /// status is `failed` with [`FailureReason::BudgetExceeded`].
    pub async fn start_workflow(
        self: &Arc<Self>,
        request: ValidationRequest,
    ) -> Result<WorkflowTicket, OrchestratorError> {
        request
            .validate()
            .map_err(|message| OrchestratorError::Validation { message })?;

        let limit = self.config.orchestrator.max_live_workflows;
        if self.live.read().await.len() >= limit {
            return Err(OrchestratorError::AtCapacity { limit });
        }

        let workflow_id = Uuid::new_v4().to_string();
        let mut state = WorkflowState::new(&workflow_id, request);

        let dispatchable = state
            .request
            .scope()
            .into_iter()
            .filter(|c| self.handlers.contains(*c))
            .count();
        let estimate =
            estimate_workflow_cost(&self.config.cost, self.profile.default_tier, dispatchable);
        let admission = self.guard.check(estimate).await;

        if !admission.allowed {
            let reason = admission
                .reason
                .unwrap_or_else(|| "rejected by cost guard".to_string());
            warn!(%workflow_id, estimate_usd = estimate, %reason, "Workflow rejected at admission");
            state.fail(FailureReason::BudgetExceeded { reason });
            self.publish_phase(&state);
            self.persister.save_state(&state);
            self.persister.flush().await;
            self.archive
                .write()
                .await
                .insert(&workflow_id, state.snapshot(), None);
            return Ok(WorkflowTicket {
                workflow_id,
                status: state.status,
                failure: state.failure,
            });
        }

        let (status_tx, _) = watch::channel(state.snapshot());
        let status_tx = Arc::new(status_tx);
        let cancel = CancellationToken::new();
        {
            let mut live = self.live.write().await;
            if live.len() >= limit {
                return Err(OrchestratorError::AtCapacity { limit });
            }
            live.insert(
                workflow_id.clone(),
                LiveWorkflow {
                    status_tx: Arc::clone(&status_tx),
                    cancel: cancel.clone(),
                },
            );
        }
        self.persister.save_state(&state);

        info!(
            %workflow_id,
            capabilities = state.request.analysis_scope.len(),
            estimate_usd = estimate,
            "Workflow admitted"
        );

        let run = WorkflowRun {
            state,
            status_tx,
            cancel,
            deadline: None,
        };
        let driver = tokio::spawn(Arc::clone(self).drive(run));

        // A panicking driver must still leave a terminal status behind.
        let supervisor = Arc::clone(self);
        let id = workflow_id.clone();
        tokio::spawn(async move {
            if let Err(e) = driver.await {
                supervisor.recover_crashed(&id, &e.to_string()).await;
            }
        });

        Ok(WorkflowTicket {
            workflow_id,
            status: WorkflowStatus::Pending,
            failure: None,
        })
    }

    /// Current snapshot of a workflow.
    pub async fn get_status(&self, workflow_id: &str) -> Result<StatusSnapshot, OrchestratorError> {
        if let Some(entry) = self.live.read().await.get(workflow_id) {
            return Ok(entry.status_tx.borrow().clone());
        }
        if let Some(snapshot) = self.archive.read().await.snapshot(workflow_id) {
            return Ok(snapshot.clone());
        }
        self.store
            .load_snapshot(workflow_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound {
                id: workflow_id.to_string(),
            })
    }

    /// Request cancellation. Returns `true` when the workflow was live and
    /// not yet terminal; from then on it can only end in `cancelled`.
    pub async fn cancel_workflow(&self, workflow_id: &str) -> bool {
        let live = self.live.read().await;
        let Some(entry) = live.get(workflow_id) else {
            debug!(%workflow_id, "Cancel requested for unknown or retired workflow");
            return false;
        };
        let mut accepted = false;
        entry.status_tx.send_if_modified(|snapshot| {
            if !snapshot.status.is_terminal() {
                entry.cancel.cancel();
                accepted = true;
            }
            false
        });
        if accepted {
            info!(%workflow_id, "Workflow cancellation accepted");
        }
        accepted
    }

    /// Wait until the workflow reaches a terminal status.
    pub async fn wait_for_terminal(
        &self,
        workflow_id: &str,
    ) -> Result<StatusSnapshot, OrchestratorError> {
        let rx = self
            .live
            .read()
            .await
            .get(workflow_id)
            .map(|entry| entry.status_tx.subscribe());
        if let Some(mut rx) = rx {
            let terminal = rx
                .wait_for(|s| s.status.is_terminal())
                .await
                .map(|snapshot| snapshot.clone());
            if let Ok(snapshot) = terminal {
                return Ok(snapshot);
            }
        }
        self.get_status(workflow_id).await
    }

    /// Synthesized result of a completed workflow.
    pub async fn get_result(
        &self,
        workflow_id: &str,
    ) -> Result<ValidationResult, OrchestratorError> {
        if let Some(result) = self.results.read().await.get(workflow_id) {
            return Ok(result.clone());
        }
        if let Some(result) = self.archive.read().await.result(workflow_id) {
            return Ok(result.clone());
        }
        if let Some(result) = self.store.load_result(workflow_id).await? {
            return Ok(result);
        }
        let status = self.get_status(workflow_id).await?.status;
        Err(OrchestratorError::NoResult {
            id: workflow_id.to_string(),
            status,
        })
    }

    /// Number of workflows not yet retired.
    pub async fn live_count(&self) -> usize {
        self.live.read().await.len()
    }

    /// Number of retired workflows still held in memory.
    pub async fn archived_count(&self) -> usize {
        self.archive.read().await.len()
    }

    // =========================================================================
    // Driver
    // =========================================================================

    async fn drive(self: Arc<Self>, mut run: WorkflowRun) {
        run.deadline = self
            .config
            .orchestrator
            .workflow_deadline()
            .map(|d| Instant::now() + d);

        match self.execute(&mut run).await {
            Ok(()) => {
                info!(workflow_id = %run.id(), "Workflow completed");
            }
            Err(halt) => {
                match halt {
                    Halt::Cancelled => run.settle_cancelled(),
                    Halt::Failed(reason) => run.settle_failed(reason),
                }
                self.results.write().await.remove(run.id());
                self.publish_phase(&run.state);
                warn!(
                    workflow_id = %run.id(),
                    status = %run.state.status,
                    failure = ?run.state.failure,
                    progress = run.state.progress,
                    "Workflow did not complete"
                );
            }
        }
        self.retire(run).await;
    }

    async fn execute(&self, run: &mut WorkflowRun) -> Result<(), Halt> {
        run.update(WorkflowState::start)?;
        self.publish_phase(&run.state);
        self.persister.save_state(&run.state);

        self.enter(run, Phase::TaskDistribution)?;
        let tasks = self.distribute(run).await?;

        self.enter(run, Phase::ParallelExecution)?;
        self.execute_agents(run, tasks).await?;
        self.check_ceiling(run)?;

        self.enter(run, Phase::DataSynthesis)?;
        let skipped: Vec<Capability> = run.state.skipped_tasks.iter().copied().collect();
        let mut result = synthesis::synthesize(&run.state.agent_results, &skipped);

        self.enter(run, Phase::QualityAssurance)?;
        result.quality_flags =
            synthesis::quality_flags(&result, self.config.orchestrator.min_completeness);
        if !result.quality_flags.is_empty() {
            warn!(workflow_id = %run.id(), flags = ?result.quality_flags, "Quality check raised flags");
        }
        self.check_ceiling(run)?;

        // Visible before the completed status so readers never miss it.
        self.results
            .write()
            .await
            .insert(run.id().to_string(), result.clone());
        self.enter(run, Phase::Completion)?;
        self.persister.save_result(run.id(), &result);

        info!(
            workflow_id = %run.id(),
            overall_score = result.overall_score,
            confidence = result.confidence_level,
            completeness = result.analysis_completeness,
            "Validation synthesized"
        );
        Ok(())
    }

    /// Advance to `phase`, then announce and persist it.
    fn enter(&self, run: &mut WorkflowRun, phase: Phase) -> Result<(), Halt> {
        if let Err(e) = run.update(|s| s.advance(phase))? {
            error!(workflow_id = %run.id(), error = %e, "Illegal phase transition");
            run.update(WorkflowState::record_fault)?;
            return Err(Halt::Failed(FailureReason::Fatal {
                message: e.to_string(),
            }));
        }
        debug!(
            workflow_id = %run.id(),
            phase = %phase,
            progress = run.state.progress,
            "Workflow phase entered"
        );
        self.publish_phase(&run.state);
        self.persister.save_state(&run.state);
        Ok(())
    }

    fn check_ceiling(&self, run: &WorkflowRun) -> Result<(), Halt> {
        let ceiling = self.config.orchestrator.max_error_count;
        if run.state.exceeds(ceiling) {
            return Err(Halt::Failed(FailureReason::ErrorCeilingExceeded {
                error_count: run.state.error_count,
                ceiling,
            }));
        }
        Ok(())
    }

    /// Build one task per requested capability that has a handler.
    async fn distribute(&self, run: &mut WorkflowRun) -> Result<Vec<AgentTask>, Halt> {
        let (dispatch, skipped): (Vec<Capability>, Vec<Capability>) = run
            .state
            .request
            .scope()
            .into_iter()
            .partition(|c| self.handlers.contains(*c));
        for capability in &skipped {
            warn!(workflow_id = %run.id(), %capability, "No handler registered; capability skipped");
        }

        let remaining = self.guard.remaining_usd().await;
        #[allow(clippy::cast_precision_loss)]
        let per_task_budget = if dispatch.is_empty() {
            0.0
        } else {
            remaining.min(self.profile.max_workflow_cost_usd) / dispatch.len() as f64
        };

        let policy = RetryPolicy::from_config(&self.config.agents);
        let provisional = run
            .deadline
            .unwrap_or_else(|| Instant::now() + policy.worst_case(self.config.agents.timeout()));

        let priority = run.state.request.priority;
        let tasks: Vec<AgentTask> = dispatch
            .iter()
            .map(|&capability| {
                let complexity = Complexity::assess(capability, priority);
                let choice = self.selector.select(capability, complexity, per_task_budget);
                let mut parameters = run.state.request.task_parameters(capability);
                if let Some(fields) = parameters.as_object_mut() {
                    fields.insert("model".to_string(), choice.model.clone().into());
                }
                AgentTask {
                    workflow_id: run.id().to_string(),
                    capability,
                    model_tier: choice.tier,
                    model: choice.model,
                    parameters,
                    deadline: provisional,
                    retry_count: 0,
                }
            })
            .collect();

        run.update(|s| s.plan(dispatch.iter().copied(), skipped.iter().copied()))?;
        info!(
            workflow_id = %run.id(),
            dispatched = tasks.len(),
            skipped = skipped.len(),
            per_task_budget_usd = per_task_budget,
            "Tasks distributed"
        );
        Ok(tasks)
    }

    /// Fan tasks out under the pool limit and fan their results back in.
    async fn execute_agents(&self, run: &mut WorkflowRun, tasks: Vec<AgentTask>) -> Result<(), Halt> {
        if tasks.is_empty() {
            return Ok(());
        }

        let pool = AgentPool::new(self.profile.max_concurrent_agents);
        debug!(
            workflow_id = %run.id(),
            tasks = tasks.len(),
            max_concurrency = pool.max_concurrency(),
            "Dispatching agents"
        );
        let abort = run.cancel.child_token();
        let ctx = RunContext {
            workflow_id: run.id().to_string(),
            publisher: Arc::clone(&self.publisher),
            cancel: abort.clone(),
            status: run.status_tx.subscribe(),
        };
        let attempt_timeout = self.config.agents.timeout();
        let policy = RetryPolicy::from_config(&self.config.agents);
        let run_deadline = run.deadline;

        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<Capability>();
        let mut agents: JoinSet<AgentResult> = JoinSet::new();
        let mut capability_of: HashMap<Id, Capability> = HashMap::new();

        for mut task in tasks {
            let capability = task.capability;
            let Some(handler) = self.handlers.get(capability) else {
                continue;
            };
            let runner = AgentTaskRunner::new(handler, attempt_timeout, policy.clone())
                .with_tier_cost(self.config.cost.tier_cost(task.model_tier));
            let pool = pool.clone();
            let ctx = ctx.clone();
            let started_tx = started_tx.clone();

            let handle = agents.spawn(async move {
                let Ok(_permit) = pool.acquire().await else {
                    return AgentResult::failed(capability, AgentErrorKind::Cancelled, "agent pool closed");
                };
                if ctx.cancel.is_cancelled() {
                    return AgentResult::failed(
                        capability,
                        AgentErrorKind::Cancelled,
                        "cancelled before dispatch",
                    );
                }
                let _ = started_tx.send(capability);
                let bound = Instant::now() + runner.policy().worst_case(attempt_timeout);
                task.deadline = run_deadline.map_or(bound, |d| d.min(bound));
                runner.run(task, &ctx).await
            });
            capability_of.insert(handle.id(), capability);
        }
        drop(started_tx);

        let ceiling = self.config.orchestrator.max_error_count;
        let deadline_at = run.deadline.unwrap_or_else(Instant::now);
        let mut deadline_expired = false;

        let mut halt = loop {
            if agents.is_empty() {
                break None;
            }
            tokio::select! {
                biased;
                () = run.cancel.cancelled() => break Some(Halt::Cancelled),
                () = tokio::time::sleep_until(deadline_at), if run.deadline.is_some() => {
                    warn!(
                        workflow_id = %run.id(),
                        outstanding = ?run.state.outstanding(),
                        "Workflow deadline expired; finalizing with partial results"
                    );
                    deadline_expired = true;
                    break None;
                }
                Some(capability) = started_rx.recv() => {
                    if let Err(h) = run.update(|s| s.mark_active(capability)) {
                        break Some(h);
                    }
                }
                Some(joined) = agents.join_next_with_id() => {
                    let Some(result) = joined_result(run.id(), &capability_of, joined) else {
                        continue;
                    };
                    self.guard.record_usage(result.cost_usd).await;
                    if let Err(h) = self.apply_result(run, result) {
                        break Some(h);
                    }
                    if run.state.exceeds(ceiling) {
                        break Some(Halt::Failed(FailureReason::ErrorCeilingExceeded {
                            error_count: run.state.error_count,
                            ceiling,
                        }));
                    }
                }
                else => break None,
            }
        };

        // Outstanding agents stop at their next checkpoint. Whatever they
        // spent is still charged; after a deadline their results stand as
        // timeouts, otherwise they are dropped.
        abort.cancel();
        pool.close();
        while let Some(joined) = agents.join_next_with_id().await {
            let Some(result) = joined_result(run.id(), &capability_of, joined) else {
                continue;
            };
            self.guard.record_usage(result.cost_usd).await;
            if !deadline_expired || halt.is_some() {
                continue;
            }
            let timed_out = AgentResult::failed(
                result.capability,
                AgentErrorKind::AgentTimeout,
                "workflow deadline expired",
            )
            .with_attempts(result.attempts)
            .with_cost(result.cost_usd)
            .with_duration_ms(result.duration_ms);
            if let Err(h) = self.apply_result(run, timed_out) {
                halt = Some(h);
            }
        }
        if deadline_expired && halt.is_none() {
            for capability in run.state.outstanding() {
                let timed_out = AgentResult::failed(
                    capability,
                    AgentErrorKind::AgentTimeout,
                    "workflow deadline expired",
                );
                if let Err(h) = self.apply_result(run, timed_out) {
                    halt = Some(h);
                    break;
                }
            }
        }

        halt.map_or(Ok(()), Err)
    }

    /// Record a terminal agent result and announce it.
    fn apply_result(&self, run: &mut WorkflowRun, result: AgentResult) -> Result<(), Halt> {
        let capability = result.capability;
        let kind = match result.error_kind() {
            None => ProgressEventKind::AgentSucceeded { capability },
            Some(error) => ProgressEventKind::AgentFailed { capability, error },
        };
        if !run.update(|s| s.record_result(result))? {
            return Ok(());
        }
        self.publisher.publish(ProgressEvent::new(
            run.id(),
            run.state.current_phase,
            run.state.progress,
            kind,
            format!("{capability} finished"),
        ));
        self.persister.save_state(&run.state);
        Ok(())
    }

    fn publish_phase(&self, state: &WorkflowState) {
        self.publisher.publish(ProgressEvent::new(
            &state.workflow_id,
            state.current_phase,
            state.progress,
            ProgressEventKind::PhaseChanged {
                status: state.status,
            },
            format!("{} ({})", state.current_phase, state.status),
        ));
    }

    /// Persist the terminal state, then move the workflow from the live set
    /// to the archive.
    async fn retire(&self, run: WorkflowRun) {
        self.persister.save_state(&run.state);
        self.persister.flush().await;

        let id = run.state.workflow_id.clone();
        let result = self.results.read().await.get(&id).cloned();
        let evicted = self
            .archive
            .write()
            .await
            .insert(&id, run.state.snapshot(), result);
        self.results.write().await.remove(&id);
        self.live.write().await.remove(&id);
        debug!(workflow_id = %id, evicted, "Workflow retired");
    }

    async fn recover_crashed(&self, workflow_id: &str, message: &str) {
        error!(%workflow_id, error = %message, "Workflow driver crashed");
        let Some(entry) = self.live.write().await.remove(workflow_id) else {
            return;
        };
        let mut snapshot = entry.status_tx.borrow().clone();
        if !snapshot.status.is_terminal() {
            snapshot.status = WorkflowStatus::Failed;
            snapshot.current_phase = Phase::Failed;
            snapshot.active_agents.clear();
            snapshot.error_count = snapshot.error_count.saturating_add(1);
            snapshot.failure = Some(FailureReason::Fatal {
                message: format!("driver crashed: {message}"),
            });
        }
        entry.status_tx.send_replace(snapshot.clone());
        self.results.write().await.remove(workflow_id);
        self.archive.write().await.insert(workflow_id, snapshot, None);
    }
}

/// Terminal snapshot and result of one retired workflow.
struct Retired {
    snapshot: StatusSnapshot,
    result: Option<ValidationResult>,
}

/// Retired workflows in retirement order, bounded by `capacity`.
///
/// Completed, failed and rejected workflows are flushed to the store before
/// insertion, so an evicted id is still answered from there. A crashed
/// driver's snapshot lives only here; once evicted, the store reports the
/// last state it was sent.
struct Archive {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, Retired>,
}

impl Archive {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    /// Insert or replace an entry. Returns how many old entries were evicted.
    fn insert(
        &mut self,
        workflow_id: &str,
        snapshot: StatusSnapshot,
        result: Option<ValidationResult>,
    ) -> usize {
        let retired = Retired { snapshot, result };
        if self.entries.insert(workflow_id.to_string(), retired).is_none() {
            self.order.push_back(workflow_id.to_string());
        }
        let mut evicted = 0;
        while self.order.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted += 1;
        }
        evicted
    }

    fn snapshot(&self, workflow_id: &str) -> Option<&StatusSnapshot> {
        self.entries.get(workflow_id).map(|r| &r.snapshot)
    }

    fn result(&self, workflow_id: &str) -> Option<&ValidationResult> {
        self.entries.get(workflow_id).and_then(|r| r.result.as_ref())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Result of a joined agent task. A crashed task becomes an execution error.
fn joined_result(
    workflow_id: &str,
    capability_of: &HashMap<Id, Capability>,
    joined: Result<(Id, AgentResult), JoinError>,
) -> Option<AgentResult> {
    match joined {
        Ok((_, result)) => Some(result),
        Err(e) => {
            let Some(&capability) = capability_of.get(&e.id()) else {
                error!(%workflow_id, error = %e, "Unknown agent task ended");
                return None;
            };
            error!(%workflow_id, %capability, error = %e, "Agent task crashed");
            Some(AgentResult::failed(
                capability,
                AgentErrorKind::AgentExecutionError,
                format!("agent task crashed: {e}"),
            ))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use serde_json::{Map, json};

    use super::*;
    use crate::capability::{Fixture, FixtureHandler};
    use crate::workflow::Priority;

    fn request(scope: Vec<Capability>) -> ValidationRequest {
        ValidationRequest {
            business_concept: "Revenue-based financing for indie studios".to_string(),
            target_market: "North America".to_string(),
            analysis_scope: scope,
            priority: Priority::Normal,
            custom_parameters: Map::new(),
        }
    }

    fn registry(fixture: &Fixture) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        for capability in Capability::ALL {
            registry.register(capability, Arc::new(FixtureHandler::new(fixture.clone())));
        }
        registry
    }

    fn orchestrator(config: Config, handlers: HandlerRegistry) -> Arc<SupervisorOrchestrator> {
        let collaborators = Collaborators::from_config(&config).unwrap();
        Arc::new(SupervisorOrchestrator::new(config, handlers, collaborators).unwrap())
    }

    #[tokio::test]
    async fn invalid_request_creates_no_workflow() {
        let orch = orchestrator(Config::default(), HandlerRegistry::new());
        let mut req = request(vec![Capability::MarketAnalysis]);
        req.target_market = String::new();
        let err = orch.start_workflow(req).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation { .. }));
        assert_eq!(orch.live_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_workflow_is_not_found() {
        let orch = orchestrator(Config::default(), HandlerRegistry::new());
        assert!(matches!(
            orch.get_status("missing").await,
            Err(OrchestratorError::NotFound { .. })
        ));
        assert!(!orch.cancel_workflow("missing").await);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_workflow_is_retired_with_result() {
        let orch = orchestrator(
            Config::default(),
            registry(&Fixture::success(json!({"score": 75}), 0.8)),
        );
        let ticket = orch
            .start_workflow(request(vec![Capability::MarketAnalysis, Capability::RiskAssessment]))
            .await
            .unwrap();
        assert_eq!(ticket.status, WorkflowStatus::Pending);

        let snapshot = orch.wait_for_terminal(&ticket.workflow_id).await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Completed);
        assert_eq!(snapshot.progress, 1.0);

        let result = orch.get_result(&ticket.workflow_id).await.unwrap();
        assert_eq!(result.successful_count, 2);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(orch.live_count().await, 0);
        assert_eq!(
            orch.get_status(&ticket.workflow_id).await.unwrap().status,
            WorkflowStatus::Completed
        );
    }

    #[tokio::test]
    async fn at_capacity_is_rejected() {
        let mut config = Config::default();
        config.orchestrator.max_live_workflows = 1;
        let orch = orchestrator(
            config,
            registry(&Fixture::success(json!({}), 0.8).with_delay(Duration::from_secs(3600))),
        );
        orch.start_workflow(request(vec![Capability::MarketAnalysis]))
            .await
            .unwrap();
        let err = orch
            .start_workflow(request(vec![Capability::MarketAnalysis]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AtCapacity { limit: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn result_of_cancelled_workflow_is_unavailable() {
        let orch = orchestrator(
            Config::default(),
            registry(&Fixture::success(json!({}), 0.8).with_delay(Duration::from_secs(60))),
        );
        let ticket = orch
            .start_workflow(request(vec![Capability::FraudDetection]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(orch.cancel_workflow(&ticket.workflow_id).await);

        let snapshot = orch.wait_for_terminal(&ticket.workflow_id).await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Cancelled);
        assert!(matches!(
            orch.get_result(&ticket.workflow_id).await,
            Err(OrchestratorError::NoResult {
                status: WorkflowStatus::Cancelled,
                ..
            })
        ));
        assert!(!orch.cancel_workflow(&ticket.workflow_id).await);
    }

    fn retired(id: &str) -> StatusSnapshot {
        WorkflowState::new(id, request(vec![Capability::MarketAnalysis])).snapshot()
    }

    #[test]
    fn archive_evicts_oldest_first() {
        let mut archive = Archive::new(2);
        assert_eq!(archive.insert("a", retired("a"), None), 0);
        assert_eq!(archive.insert("b", retired("b"), None), 0);
        assert_eq!(archive.insert("c", retired("c"), None), 1);

        assert!(archive.snapshot("a").is_none());
        assert_eq!(archive.snapshot("b").unwrap().workflow_id, "b");
        assert_eq!(archive.snapshot("c").unwrap().workflow_id, "c");
        assert_eq!(archive.len(), 2);
    }

    #[test]
    fn archive_replacing_an_entry_keeps_its_slot() {
        let mut archive = Archive::new(2);
        archive.insert("a", retired("a"), None);
        archive.insert("b", retired("b"), None);
        assert_eq!(archive.insert("a", retired("a"), None), 0);
        assert_eq!(archive.len(), 2);

        archive.insert("c", retired("c"), None);
        assert!(archive.snapshot("a").is_none());
        assert!(archive.snapshot("b").is_some());
    }

    #[test]
    fn archive_without_result_reports_none() {
        let mut archive = Archive::new(1);
        archive.insert("a", retired("a"), None);
        assert!(archive.result("a").is_none());
        assert!(archive.snapshot("a").is_some());
    }

    #[tokio::test]
    async fn retired_results_move_into_the_bounded_archive() {
        let mut config = Config::default();
        config.orchestrator.max_archived_workflows = 1;
        let orch = orchestrator(config, registry(&Fixture::success(json!({}), 0.8)));

        let mut ids = Vec::new();
        for _ in 0..3 {
            let ticket = orch
                .start_workflow(request(vec![Capability::MarketAnalysis]))
                .await
                .unwrap();
            orch.wait_for_terminal(&ticket.workflow_id).await.unwrap();
            while orch.live_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            ids.push(ticket.workflow_id);
        }

        assert_eq!(orch.archived_count().await, 1);
        assert!(orch.results.read().await.is_empty());
        for id in &ids {
            assert_eq!(
                orch.get_status(id).await.unwrap().status,
                WorkflowStatus::Completed
            );
            assert_eq!(orch.get_result(id).await.unwrap().successful_count, 1);
        }
    }
}
