//! Workflow orchestration: agent pool, task runner, synthesizer and supervisor.
//!
//! - [`AgentPool`]: Semaphore-based concurrency limiter for capability agents.
//! - [`AgentTaskRunner`]: Timeout, retry and backoff envelope around one handler call.
//! - [`synthesis`]: Pure aggregation of agent results into a validation result.
//! - [`SupervisorOrchestrator`]: Admits requests and drives each workflow
//!   through its phases.

pub mod manager;
pub mod pool;
pub mod runner;
pub mod synthesis;

pub use manager::{Collaborators, OrchestratorError, SupervisorOrchestrator, WorkflowTicket};
pub use pool::AgentPool;
pub use runner::{AgentTaskRunner, RetryPolicy, RunContext};
