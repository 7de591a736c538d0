//! Execution envelope around a single capability handler.
//!
//! The runner owns timeout, retry and backoff for one [`AgentTask`] and
//! always produces an [`AgentResult`]; it never returns an error to the
//! orchestrator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use valor_core::config::AgentConfig;

use crate::capability::{CapabilityError, CapabilityHandler};
use crate::progress::{ProgressEvent, ProgressEventKind, ProgressPublisher};
use crate::workflow::{AgentErrorKind, AgentResult, AgentTask, StatusSnapshot};

/// Exponential backoff for transient handler failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl RetryPolicy {
    pub const fn from_config(config: &AgentConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            max_retries: config.max_retries,
        }
    }

    /// Delay before retry number `retry` (0-indexed), capped at `max_delay`.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(retry.min(64) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether a task that has already retried `retries` times may retry again.
    pub const fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Upper bound on the wall time a task can spend, given a per-attempt timeout.
    pub fn worst_case(&self, attempt_timeout: Duration) -> Duration {
        let attempts = self.max_retries.saturating_add(1);
        let backoff: Duration = (0..self.max_retries).map(|r| self.delay_for_retry(r)).sum();
        attempt_timeout.saturating_mul(attempts).saturating_add(backoff)
    }
}

/// Per-workflow context shared by every runner of that workflow.
#[derive(Clone)]
pub struct RunContext {
    pub workflow_id: String,
    pub publisher: Arc<dyn ProgressPublisher>,
    /// Fires on cancellation, error-ceiling breach or deadline expiry.
    pub cancel: CancellationToken,
    /// Latest workflow snapshot, read to stamp events with phase and progress.
    pub status: watch::Receiver<StatusSnapshot>,
}

impl RunContext {
    /// Publishes while holding the snapshot borrow, so the driver cannot
    /// publish a higher progress value in between.
    fn emit(&self, kind: ProgressEventKind, message: String) {
        let snapshot = self.status.borrow();
        self.publisher.publish(ProgressEvent::new(
            &self.workflow_id,
            snapshot.current_phase,
            snapshot.progress,
            kind,
            message,
        ));
    }
}

/// Runs one task against its handler.
#[derive(Clone)]
pub struct AgentTaskRunner {
    handler: Arc<dyn CapabilityHandler>,
    attempt_timeout: Duration,
    policy: RetryPolicy,
    /// Flat cost of one attempt when the handler reports none.
    tier_cost_usd: f64,
}

impl AgentTaskRunner {
    pub fn new(
        handler: Arc<dyn CapabilityHandler>,
        attempt_timeout: Duration,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            handler,
            attempt_timeout,
            policy,
            tier_cost_usd: 0.0,
        }
    }

    #[must_use]
    pub const fn with_tier_cost(mut self, tier_cost_usd: f64) -> Self {
        self.tier_cost_usd = tier_cost_usd;
        self
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `task` until success, a permanent error, exhausted retries,
    /// its deadline or cancellation.
    pub async fn run(&self, mut task: AgentTask, ctx: &RunContext) -> AgentResult {
        let started = Instant::now();
        let capability = task.capability;
        let mut attempts: u32 = 0;

        ctx.emit(
            ProgressEventKind::AgentStarted { capability },
            format!("{capability} started on {}", task.model),
        );

        let (kind, message) = loop {
            if ctx.cancel.is_cancelled() {
                break (AgentErrorKind::Cancelled, "cancelled".to_string());
            }
            let now = Instant::now();
            if now >= task.deadline {
                break (
                    AgentErrorKind::AgentTimeout,
                    "task deadline reached".to_string(),
                );
            }
            let budget = self.attempt_timeout.min(task.deadline - now);
            attempts += 1;

            let outcome = tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => None,
                outcome = tokio::time::timeout(budget, self.handler.execute(&task)) => Some(outcome),
            };

            let error = match outcome {
                None => break (AgentErrorKind::Cancelled, "cancelled mid-attempt".to_string()),
                Some(Ok(Ok(output))) => {
                    let cost = output
                        .cost_usd
                        .unwrap_or_else(|| self.attempts_cost(attempts));
                    info!(
                        workflow_id = %task.workflow_id,
                        %capability,
                        attempts,
                        confidence = output.confidence,
                        "Agent succeeded"
                    );
                    return AgentResult::succeeded(capability, output.payload, output.confidence)
                        .with_attempts(attempts)
                        .with_cost(cost)
                        .with_duration_ms(elapsed_ms(started));
                }
                Some(Ok(Err(e))) => e,
                Some(Err(_)) => CapabilityError::Timeout(format!(
                    "attempt {attempts} exceeded {}ms",
                    budget.as_millis()
                )),
            };

            if !error.is_transient() {
                warn!(
                    workflow_id = %task.workflow_id,
                    %capability,
                    error = %error,
                    "Agent failed with permanent error"
                );
                break (error.kind(), error.to_string());
            }
            if !self.policy.should_retry(task.retry_count) {
                warn!(
                    workflow_id = %task.workflow_id,
                    %capability,
                    attempts,
                    error = %error,
                    "Agent retries exhausted"
                );
                break (error.kind(), error.to_string());
            }
            let delay = self.policy.delay_for_retry(task.retry_count);
            if Instant::now() + delay >= task.deadline {
                break (
                    error.kind(),
                    format!("{error}; deadline leaves no room for a retry"),
                );
            }

            task.retry_count += 1;
            debug!(
                workflow_id = %task.workflow_id,
                %capability,
                retry = task.retry_count,
                delay_ms = delay.as_millis(),
                error = %error,
                "Retrying agent"
            );
            #[allow(clippy::cast_possible_truncation)]
            let delay_ms = delay.as_millis() as u64;
            ctx.emit(
                ProgressEventKind::AgentRetrying {
                    capability,
                    attempt: task.retry_count + 1,
                    delay_ms,
                },
                format!("{capability} retrying after {error}"),
            );

            let cancelled = tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => true,
                () = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                break (AgentErrorKind::Cancelled, "cancelled during backoff".to_string());
            }
        };

        AgentResult::failed(capability, kind, message)
            .with_attempts(attempts)
            .with_cost(self.attempts_cost(attempts))
            .with_duration_ms(elapsed_ms(started))
    }

    fn attempts_cost(&self, attempts: u32) -> f64 {
        self.tier_cost_usd * f64::from(attempts)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::{Map, json};
    use valor_core::ModelTier;

    use super::*;
    use crate::capability::{CapabilityOutput, Fixture, FixtureHandler};
    use crate::progress::BroadcastPublisher;
    use crate::workflow::{Capability, Priority, ValidationRequest, WorkflowState};

    struct CountingHandler {
        calls: AtomicU32,
        error: CapabilityError,
    }

    #[async_trait]
    impl CapabilityHandler for CountingHandler {
        async fn execute(&self, _task: &AgentTask) -> Result<CapabilityOutput, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_retries: 3,
        }
    }

    fn task(deadline: Duration) -> AgentTask {
        AgentTask {
            workflow_id: "wf-1".to_string(),
            capability: Capability::MarketAnalysis,
            model_tier: ModelTier::Standard,
            model: "standard-model".to_string(),
            parameters: json!({}),
            deadline: Instant::now() + deadline,
            retry_count: 0,
        }
    }

    fn context(publisher: Arc<dyn ProgressPublisher>) -> (RunContext, watch::Sender<StatusSnapshot>) {
        let state = WorkflowState::new(
            "wf-1",
            ValidationRequest {
                business_concept: "Marketplace escrow".to_string(),
                target_market: "India".to_string(),
                analysis_scope: vec![Capability::MarketAnalysis],
                priority: Priority::Normal,
                custom_parameters: Map::new(),
            },
        );
        let (tx, rx) = watch::channel(state.snapshot());
        (
            RunContext {
                workflow_id: "wf-1".to_string(),
                publisher,
                cancel: CancellationToken::new(),
                status: rx,
            },
            tx,
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_retry(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(1000), Duration::from_secs(1));
    }

    #[test]
    fn retry_budget_counts_retries_not_attempts() {
        let policy = policy();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn worst_case_covers_attempts_and_backoff() {
        // 4 attempts of 1s + 100 + 200 + 400 ms backoff
        assert_eq!(
            policy().worst_case(Duration::from_secs(1)),
            Duration::from_millis(4_700)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_records_cost_and_attempts() {
        let handler = Arc::new(FixtureHandler::new(
            Fixture::success(json!({"score": 80}), 0.9).failing_first(1),
        ));
        let runner =
            AgentTaskRunner::new(handler, Duration::from_secs(5), policy()).with_tier_cost(0.1);
        let (ctx, _tx) = context(Arc::new(crate::progress::NoopPublisher));

        let result = runner.run(task(Duration::from_secs(60)), &ctx).await;
        assert!(result.success);
        assert_eq!(result.attempts, 2);
        assert!((result.cost_usd - 0.2).abs() < 1e-9);
        assert_eq!(result.confidence_score, 0.9);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            error: CapabilityError::Unauthorized("missing key".to_string()),
        });
        let runner = AgentTaskRunner::new(handler.clone(), Duration::from_secs(5), policy());
        let (ctx, _tx) = context(Arc::new(crate::progress::NoopPublisher));

        let result = runner.run(task(Duration::from_secs(60)), &ctx).await;
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(AgentErrorKind::Authorization));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_exhausts_retries() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            error: CapabilityError::RateLimited("429".to_string()),
        });
        let publisher = Arc::new(BroadcastPublisher::new(32));
        let mut events = publisher.subscribe();
        let runner = AgentTaskRunner::new(handler.clone(), Duration::from_secs(5), policy());
        let (ctx, _tx) = context(publisher);

        let result = runner.run(task(Duration::from_secs(60)), &ctx).await;
        assert_eq!(result.error_kind(), Some(AgentErrorKind::RateLimited));
        assert_eq!(result.attempts, 4);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);

        let mut retries = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event.kind, ProgressEventKind::AgentRetrying { .. }) {
                retries += 1;
            }
        }
        assert_eq!(retries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_each_attempt() {
        let handler = Arc::new(FixtureHandler::new(
            Fixture::success(json!({}), 0.9).with_delay(Duration::from_secs(30)),
        ));
        let mut policy = policy();
        policy.max_retries = 1;
        let runner = AgentTaskRunner::new(handler, Duration::from_secs(2), policy);
        let (ctx, _tx) = context(Arc::new(crate::progress::NoopPublisher));

        let result = runner.run(task(Duration::from_secs(60)), &ctx).await;
        assert_eq!(result.error_kind(), Some(AgentErrorKind::AgentTimeout));
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_total_time() {
        let handler = Arc::new(FixtureHandler::new(
            Fixture::success(json!({}), 0.9).with_delay(Duration::from_secs(30)),
        ));
        let runner = AgentTaskRunner::new(handler, Duration::from_secs(10), policy());
        let (ctx, _tx) = context(Arc::new(crate::progress::NoopPublisher));

        let started = Instant::now();
        let result = runner.run(task(Duration::from_secs(3)), &ctx).await;
        assert_eq!(result.error_kind(), Some(AgentErrorKind::AgentTimeout));
        assert!(started.elapsed() <= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_runner() {
        let handler = Arc::new(FixtureHandler::new(
            Fixture::success(json!({}), 0.9).with_delay(Duration::from_secs(30)),
        ));
        let runner = AgentTaskRunner::new(handler, Duration::from_secs(60), policy());
        let (ctx, _tx) = context(Arc::new(crate::progress::NoopPublisher));
        let token = ctx.cancel.clone();

        let handle = tokio::spawn(async move { runner.run(task(Duration::from_secs(120)), &ctx).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        let result = handle.await.unwrap();
        assert_eq!(result.error_kind(), Some(AgentErrorKind::Cancelled));
        assert_eq!(result.attempts, 1);
    }
}
