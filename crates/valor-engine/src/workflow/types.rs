//! Request, task and result types shared by every workflow component.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::time::Instant;

use valor_core::ModelTier;

/// Longest accepted business concept, in characters.
const MAX_CONCEPT_CHARS: usize = 20_000;

/// One of the six domain analyses composing a validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    RegulatoryCompliance,
    RiskAssessment,
    MarketAnalysis,
    CustomerIntelligence,
    FraudDetection,
    KycVerification,
}

impl Capability {
    pub const ALL: [Self; 6] = [
        Self::RegulatoryCompliance,
        Self::RiskAssessment,
        Self::MarketAnalysis,
        Self::CustomerIntelligence,
        Self::FraudDetection,
        Self::KycVerification,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RegulatoryCompliance => "regulatory_compliance",
            Self::RiskAssessment => "risk_assessment",
            Self::MarketAnalysis => "market_analysis",
            Self::CustomerIntelligence => "customer_intelligence",
            Self::FraudDetection => "fraud_detection",
            Self::KycVerification => "kyc_verification",
        }
    }

    /// Whether a wrong answer from this analysis carries legal or financial exposure.
    pub const fn is_high_stakes(self) -> bool {
        matches!(
            self,
            Self::RegulatoryCompliance | Self::FraudDetection | Self::KycVerification
        )
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-assigned urgency of a validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A business/risk validation request. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub business_concept: String,
    pub target_market: String,
    pub analysis_scope: Vec<Capability>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub custom_parameters: Map<String, Value>,
}

impl ValidationRequest {
    /// Reject malformed requests before a workflow exists.
    pub fn validate(&self) -> Result<(), String> {
        if self.business_concept.trim().is_empty() {
            return Err("business_concept must not be empty".to_string());
        }
        if self.business_concept.chars().count() > MAX_CONCEPT_CHARS {
            return Err(format!(
                "business_concept exceeds {MAX_CONCEPT_CHARS} characters"
            ));
        }
        if self.target_market.trim().is_empty() {
            return Err("target_market must not be empty".to_string());
        }
        let mut seen = BTreeSet::new();
        for capability in &self.analysis_scope {
            if !seen.insert(*capability) {
                return Err(format!("analysis_scope lists {capability} more than once"));
            }
        }
        Ok(())
    }

    /// Requested capabilities in canonical order.
    pub fn scope(&self) -> BTreeSet<Capability> {
        self.analysis_scope.iter().copied().collect()
    }

    /// Parameters handed to every capability handler.
    pub fn task_parameters(&self, capability: Capability) -> Value {
        json!({
            "capability": capability,
            "business_concept": self.business_concept,
            "target_market": self.target_market,
            "priority": self.priority,
            "custom_parameters": self.custom_parameters,
        })
    }
}

/// Required analysis depth for one capability, used to pick a model tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    /// Derive the complexity of `capability` under the request's priority.
    pub const fn assess(capability: Capability, priority: Priority) -> Self {
        let stakes: i8 = if capability.is_high_stakes() { 1 } else { 0 };
        let urgency: i8 = match priority {
            Priority::Low => -1,
            Priority::Normal => 0,
            Priority::High => 1,
            Priority::Critical => 2,
        };
        match stakes + urgency {
            i8::MIN..=-1 => Self::Low,
            0 | 1 => Self::Medium,
            _ => Self::High,
        }
    }
}

/// One unit of dispatched work.
#[derive(Debug, Clone)]
pub struct AgentTask {
    pub workflow_id: String,
    pub capability: Capability,
    pub model_tier: ModelTier,
    /// Model identifier resolved for `model_tier`.
    pub model: String,
    pub parameters: Value,
    /// Absolute deadline for every attempt and backoff of this task.
    pub deadline: Instant,
    /// Retries performed so far.
    pub retry_count: u32,
}

/// Classification of a failed capability invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    AgentTimeout,
    RateLimited,
    AgentExecutionError,
    Validation,
    Authorization,
    Cancelled,
}

impl AgentErrorKind {
    /// Transient kinds are retried; permanent ones fail on the first occurrence.
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::AgentTimeout | Self::RateLimited | Self::AgentExecutionError
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AgentTimeout => "agent_timeout",
            Self::RateLimited => "rate_limited",
            Self::AgentExecutionError => "agent_execution_error",
            Self::Validation => "validation",
            Self::Authorization => "authorization",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error attached to a failed [`AgentResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub message: String,
}

/// Outcome of one capability, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub capability: Capability,
    pub success: bool,
    /// Opaque capability output.
    #[serde(default)]
    pub payload: Value,
    pub confidence_score: f64,
    #[serde(default)]
    pub error: Option<AgentError>,
    /// Handler invocations made, including the successful one.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub duration_ms: u64,
}

impl AgentResult {
    pub fn succeeded(capability: Capability, payload: Value, confidence: f64) -> Self {
        Self {
            capability,
            success: true,
            payload,
            confidence_score: clamp_unit(confidence),
            error: None,
            attempts: 1,
            cost_usd: 0.0,
            duration_ms: 0,
        }
    }

    pub fn failed(capability: Capability, kind: AgentErrorKind, message: impl Into<String>) -> Self {
        Self {
            capability,
            success: false,
            payload: Value::Null,
            confidence_score: 0.0,
            error: Some(AgentError {
                kind,
                message: message.into(),
            }),
            attempts: 0,
            cost_usd: 0.0,
            duration_ms: 0,
        }
    }

    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }

    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn error_kind(&self) -> Option<AgentErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// The capability's own score on a 0-100 scale.
    ///
    /// Read from the payload's numeric `score` field; a payload without one
    /// falls back to the confidence expressed as a percentage.
    pub fn normalized_score(&self) -> f64 {
        self.payload
            .get("score")
            .and_then(Value::as_f64)
            .filter(|s| s.is_finite())
            .map_or(self.confidence_score * 100.0, |s| s.clamp(0.0, 100.0))
    }

    /// String recommendations carried in the payload, if any.
    pub fn payload_recommendations(&self) -> impl Iterator<Item = &str> {
        self.payload
            .get("recommendations")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
    }
}

/// Finding recorded by the quality check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flag", rename_all = "snake_case")]
pub enum QualityFlag {
    /// Most requested capabilities failed.
    InsufficientCoverage { completeness: f64, minimum: f64 },
    /// Succeeded capabilities disagree strongly on confidence.
    DivergentConfidence { spread: f64 },
    /// Nothing was requested, so nothing was analysed.
    EmptyScope,
}

/// Synthesized outcome of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// 0-100.
    pub overall_score: f64,
    /// 0-1.
    pub confidence_level: f64,
    pub capability_results: BTreeMap<Capability, AgentResult>,
    pub recommendations: Vec<String>,
    pub data_quality_score: f64,
    /// `successful_count / requested_count`.
    pub analysis_completeness: f64,
    pub requested_count: usize,
    pub successful_count: usize,
    /// In scope but without a registered handler.
    #[serde(default)]
    pub skipped: Vec<Capability>,
    #[serde(default)]
    pub quality_flags: Vec<QualityFlag>,
}

pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}
