//! Capability handlers: the external analysis backends a workflow fans out to.
//!
//! Handlers are opaque to the engine. A handler receives an [`AgentTask`] and
//! either produces a payload with a confidence or a classified error; retry,
//! timeout and cost accounting happen around it in the task runner.

pub mod fixture;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::workflow::{AgentErrorKind, AgentTask, Capability};

pub use fixture::{Fixture, FixtureHandler, FixtureOutcome, load_fixture_registry};

/// Successful handler output.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityOutput {
    pub payload: Value,
    /// In [0, 1]; out-of-range values are clamped by the runner.
    pub confidence: f64,
    /// Cost reported by the backend, when it reports one.
    pub cost_usd: Option<f64>,
}

impl CapabilityOutput {
    pub const fn new(payload: Value, confidence: f64) -> Self {
        Self {
            payload,
            confidence,
            cost_usd: None,
        }
    }
}

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("Handler timed out: {0}")]
    Timeout(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl CapabilityError {
    pub const fn kind(&self) -> AgentErrorKind {
        match self {
            Self::Timeout(_) => AgentErrorKind::AgentTimeout,
            Self::RateLimited(_) => AgentErrorKind::RateLimited,
            Self::Execution(_) => AgentErrorKind::AgentExecutionError,
            Self::InvalidInput(_) => AgentErrorKind::Validation,
            Self::Unauthorized(_) => AgentErrorKind::Authorization,
        }
    }

    pub const fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Build the error a handler would report for `kind`.
    pub fn from_kind(kind: AgentErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            AgentErrorKind::AgentTimeout => Self::Timeout(message),
            AgentErrorKind::RateLimited => Self::RateLimited(message),
            AgentErrorKind::Validation => Self::InvalidInput(message),
            AgentErrorKind::Authorization => Self::Unauthorized(message),
            AgentErrorKind::AgentExecutionError | AgentErrorKind::Cancelled => {
                Self::Execution(message)
            }
        }
    }
}

/// An analysis backend for one capability.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn execute(&self, task: &AgentTask) -> Result<CapabilityOutput, CapabilityError>;
}

/// Handlers keyed by the capability they serve.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Capability, Arc<dyn CapabilityHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `capability`, replacing any previous one.
    pub fn register(&mut self, capability: Capability, handler: Arc<dyn CapabilityHandler>) {
        self.handlers.insert(capability, handler);
    }

    #[must_use]
    pub fn with(mut self, capability: Capability, handler: Arc<dyn CapabilityHandler>) -> Self {
        self.register(capability, handler);
        self
    }

    pub fn get(&self, capability: Capability) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.get(&capability).cloned()
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.handlers.contains_key(&capability)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut registered: Vec<&Capability> = self.handlers.keys().collect();
        registered.sort();
        f.debug_struct("HandlerRegistry")
            .field("registered", &registered)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_agent_kinds() {
        assert_eq!(
            CapabilityError::Timeout("t".into()).kind(),
            AgentErrorKind::AgentTimeout
        );
        assert!(CapabilityError::RateLimited("r".into()).is_transient());
        assert!(CapabilityError::Execution("e".into()).is_transient());
        assert!(!CapabilityError::InvalidInput("i".into()).is_transient());
        assert!(!CapabilityError::Unauthorized("u".into()).is_transient());
    }

    #[test]
    fn from_kind_round_trips_kind() {
        for kind in [
            AgentErrorKind::AgentTimeout,
            AgentErrorKind::RateLimited,
            AgentErrorKind::AgentExecutionError,
            AgentErrorKind::Validation,
            AgentErrorKind::Authorization,
        ] {
            assert_eq!(CapabilityError::from_kind(kind, "x").kind(), kind);
        }
    }

    #[test]
    fn registry_replaces_and_reports() {
        let handler: Arc<dyn CapabilityHandler> =
            Arc::new(FixtureHandler::new(Fixture::success(serde_json::json!({}), 0.5)));
        let mut registry = HandlerRegistry::new().with(Capability::MarketAnalysis, handler.clone());
        registry.register(Capability::MarketAnalysis, handler);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(Capability::MarketAnalysis));
        assert!(registry.get(Capability::KycVerification).is_none());
        assert!(format!("{registry:?}").contains("MarketAnalysis"));
    }
}
