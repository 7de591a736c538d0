//! Budget admission and usage accounting.

pub mod selector;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use valor_core::{CostProfile, ModelTier};
use valor_core::config::CostConfig;

pub use selector::{ModelChoice, ModelSelector, TieredModelSelector};

/// Answer to an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Admission {
    pub const fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Gatekeeper consulted before a workflow is admitted and after each agent.
#[async_trait]
pub trait CostGuard: Send + Sync {
    async fn check(&self, estimated_cost_usd: f64) -> Admission;

    async fn record_usage(&self, actual_cost_usd: f64);

    /// Budget left for new work.
    async fn remaining_usd(&self) -> f64;
}

#[derive(Debug, Default)]
struct Ledger {
    spent_usd: f64,
    admitted: u64,
    rejected: u64,
}

/// Process-wide budget with a per-workflow ceiling from the active profile.
#[derive(Debug)]
pub struct BudgetGuard {
    budget_usd: f64,
    max_workflow_cost_usd: f64,
    ledger: Mutex<Ledger>,
}

impl BudgetGuard {
    pub fn new(budget_usd: f64, max_workflow_cost_usd: f64) -> Self {
        Self {
            budget_usd,
            max_workflow_cost_usd,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn from_profile(cost: &CostConfig, profile: &CostProfile) -> Self {
        Self::new(cost.budget_usd, profile.max_workflow_cost_usd)
    }

    pub async fn spent_usd(&self) -> f64 {
        self.ledger.lock().await.spent_usd
    }

    /// (admitted, rejected) admission counts.
    pub async fn admissions(&self) -> (u64, u64) {
        let ledger = self.ledger.lock().await;
        (ledger.admitted, ledger.rejected)
    }
}

#[async_trait]
impl CostGuard for BudgetGuard {
    async fn check(&self, estimated_cost_usd: f64) -> Admission {
        let mut ledger = self.ledger.lock().await;
        let remaining = self.budget_usd - ledger.spent_usd;
        let admission = if estimated_cost_usd > self.max_workflow_cost_usd {
            Admission::deny(format!(
                "estimated cost ${estimated_cost_usd:.2} exceeds per-workflow ceiling ${:.2}",
                self.max_workflow_cost_usd
            ))
        } else if estimated_cost_usd > remaining {
            Admission::deny(format!(
                "estimated cost ${estimated_cost_usd:.2} exceeds remaining budget ${:.2}",
                remaining.max(0.0)
            ))
        } else {
            Admission::allow()
        };

        if admission.allowed {
            ledger.admitted += 1;
        } else {
            ledger.rejected += 1;
            warn!(
                estimated_cost_usd,
                remaining_usd = remaining,
                "Workflow rejected by budget guard"
            );
        }
        admission
    }

    async fn record_usage(&self, actual_cost_usd: f64) {
        if !actual_cost_usd.is_finite() || actual_cost_usd < 0.0 {
            warn!(actual_cost_usd, "Ignoring invalid usage report");
            return;
        }
        let mut ledger = self.ledger.lock().await;
        ledger.spent_usd += actual_cost_usd;
        debug!(
            actual_cost_usd,
            spent_usd = ledger.spent_usd,
            "Usage recorded"
        );
    }

    async fn remaining_usd(&self) -> f64 {
        (self.budget_usd - self.ledger.lock().await.spent_usd).max(0.0)
    }
}

/// Admission estimate for a workflow: one task per capability on `tier`.
pub fn estimate_workflow_cost(cost: &CostConfig, tier: ModelTier, tasks: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let count = tasks as f64;
    cost.tier_cost(tier) * count
}
