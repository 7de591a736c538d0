//! Semaphore-based agent pool for per-workflow concurrency control.
//!
//! The [`AgentPool`] caps how many capability agents of one workflow run at
//! the same time. The cap comes from the active cost profile.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// A permit granting the right to run one agent.
///
/// When dropped, the permit is automatically returned to the pool.
#[derive(Debug)]
pub struct AgentPermit {
    _permit: OwnedSemaphorePermit,
}

/// Concurrency limiter shared by the agents of one workflow.
#[derive(Debug, Clone)]
pub struct AgentPool {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
}

impl AgentPool {
    /// Create a pool with the given limit. A zero limit is raised to one.
    pub fn new(max_concurrency: usize) -> Self {
        let limit = max_concurrency.max(1);
        debug!(max_concurrency = limit, "AgentPool created");
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            max_concurrency: limit,
        }
    }

    /// Acquire a permit, waiting until one becomes available.
    pub async fn acquire(&self) -> Result<AgentPermit, PoolError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(AgentPermit { _permit: permit })
    }

    /// Stop handing out permits; pending and future `acquire` calls fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

/// Errors from the agent pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The semaphore was closed (workflow stopped dispatching).
    #[error("Agent pool has been closed")]
    Closed,
}
