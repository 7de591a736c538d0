//! Model tier selection under a per-task budget.

use valor_core::ModelTier;
use valor_core::config::{CostConfig, ModelConfig};

use crate::workflow::{Capability, Complexity};

/// Tier and concrete model picked for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChoice {
    pub tier: ModelTier,
    pub model: String,
}

pub trait ModelSelector: Send + Sync {
    /// Pick a model for `capability` whose flat cost fits `budget_usd` when possible.
    fn select(&self, capability: Capability, complexity: Complexity, budget_usd: f64) -> ModelChoice;
}

/// Selects around the active profile's default tier.
///
/// Low complexity drops to economy, high complexity steps one tier above the
/// default, and the result is downgraded until its cost fits the budget or
/// economy is reached.
#[derive(Debug, Clone)]
pub struct TieredModelSelector {
    default_tier: ModelTier,
    models: ModelConfig,
    cost: CostConfig,
}

impl TieredModelSelector {
    pub const fn new(default_tier: ModelTier, models: ModelConfig, cost: CostConfig) -> Self {
        Self {
            default_tier,
            models,
            cost,
        }
    }

    fn preferred(&self, complexity: Complexity) -> ModelTier {
        match complexity {
            Complexity::Low => ModelTier::Economy,
            Complexity::Medium => self.default_tier,
            Complexity::High => match self.default_tier {
                ModelTier::Economy => ModelTier::Standard,
                ModelTier::Standard | ModelTier::Premium => ModelTier::Premium,
            },
        }
    }
}

impl ModelSelector for TieredModelSelector {
    fn select(&self, _capability: Capability, complexity: Complexity, budget_usd: f64) -> ModelChoice {
        let mut tier = self.preferred(complexity);
        while self.cost.tier_cost(tier) > budget_usd {
            match tier.downgrade() {
                Some(cheaper) => tier = cheaper,
                None => break,
            }
        }
        ModelChoice {
            tier,
            model: self.models.model_for(tier).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(default_tier: ModelTier) -> TieredModelSelector {
        TieredModelSelector::new(default_tier, ModelConfig::default(), CostConfig::default())
    }

    #[test]
    fn medium_uses_profile_default() {
        let choice = selector(ModelTier::Standard).select(
            Capability::MarketAnalysis,
            Complexity::Medium,
            10.0,
        );
        assert_eq!(choice.tier, ModelTier::Standard);
        assert_eq!(choice.model, ModelConfig::default().standard);
    }

    #[test]
    fn high_steps_up_one_tier() {
        let s = selector(ModelTier::Economy);
        assert_eq!(
            s.select(Capability::FraudDetection, Complexity::High, 10.0).tier,
            ModelTier::Standard
        );
        let s = selector(ModelTier::Premium);
        assert_eq!(
            s.select(Capability::FraudDetection, Complexity::High, 10.0).tier,
            ModelTier::Premium
        );
    }

    #[test]
    fn tight_budget_downgrades() {
        let s = selector(ModelTier::Premium);
        // premium 0.40, standard 0.10, economy 0.02
        assert_eq!(
            s.select(Capability::RiskAssessment, Complexity::Medium, 0.2).tier,
            ModelTier::Standard
        );
        assert_eq!(
            s.select(Capability::RiskAssessment, Complexity::Medium, 0.05).tier,
            ModelTier::Economy
        );
    }

    #[test]
    fn economy_is_the_floor() {
        let s = selector(ModelTier::Standard);
        assert_eq!(
            s.select(Capability::RiskAssessment, Complexity::High, 0.0).tier,
            ModelTier::Economy
        );
    }
}
