//! Scripted handlers driven by JSON fixtures.
//!
//! Used by the `valor run` command and by tests to stand in for real
//! analysis backends. A fixture file maps capability names to a scripted
//! outcome:
//!
//! ```json
//! {
//!   "market_analysis": {
//!     "outcome": "success",
//!     "payload": { "score": 74, "recommendations": ["Start with one region"] },
//!     "confidence": 0.8,
//!     "delay_ms": 200
//!   },
//!   "kyc_verification": { "outcome": "failure", "kind": "authorization", "message": "no key" }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use valor_core::{Error, Result};

use super::{CapabilityError, CapabilityHandler, CapabilityOutput, HandlerRegistry};
use crate::workflow::{AgentErrorKind, AgentTask, Capability};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FixtureOutcome {
    Success {
        #[serde(default)]
        payload: Value,
        confidence: f64,
    },
    Failure {
        kind: AgentErrorKind,
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    #[serde(flatten)]
    pub outcome: FixtureOutcome,
    /// Simulated latency of every attempt.
    #[serde(default)]
    pub delay_ms: u64,
    /// Attempts that fail with a transient execution error before the outcome applies.
    #[serde(default)]
    pub fail_attempts: u32,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

impl Fixture {
    pub const fn success(payload: Value, confidence: f64) -> Self {
        Self {
            outcome: FixtureOutcome::Success {
                payload,
                confidence,
            },
            delay_ms: 0,
            fail_attempts: 0,
            cost_usd: None,
        }
    }

    pub fn failure(kind: AgentErrorKind, message: impl Into<String>) -> Self {
        Self {
            outcome: FixtureOutcome::Failure {
                kind,
                message: message.into(),
            },
            delay_ms: 0,
            fail_attempts: 0,
            cost_usd: None,
        }
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let millis = delay.as_millis() as u64;
        self.delay_ms = millis;
        self
    }

    #[must_use]
    pub const fn failing_first(mut self, attempts: u32) -> Self {
        self.fail_attempts = attempts;
        self
    }
}

/// Handler that replays one [`Fixture`].
#[derive(Debug, Clone)]
pub struct FixtureHandler {
    fixture: Fixture,
}

impl FixtureHandler {
    pub const fn new(fixture: Fixture) -> Self {
        Self { fixture }
    }
}

#[async_trait]
impl CapabilityHandler for FixtureHandler {
    async fn execute(&self, task: &AgentTask) -> std::result::Result<CapabilityOutput, CapabilityError> {
        debug!(
            workflow_id = %task.workflow_id,
            capability = %task.capability,
            attempt = task.retry_count + 1,
            "Fixture handler invoked"
        );
        if self.fixture.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.fixture.delay_ms)).await;
        }
        if task.retry_count < self.fixture.fail_attempts {
            return Err(CapabilityError::Execution(format!(
                "scripted failure on attempt {}",
                task.retry_count + 1
            )));
        }
        match &self.fixture.outcome {
            FixtureOutcome::Success {
                payload,
                confidence,
            } => Ok(CapabilityOutput {
                payload: payload.clone(),
                confidence: *confidence,
                cost_usd: self.fixture.cost_usd,
            }),
            FixtureOutcome::Failure { kind, message } => {
                Err(CapabilityError::from_kind(*kind, message.clone()))
            }
        }
    }
}

/// Parse a fixture map from JSON text.
pub fn parse_fixtures(content: &str) -> Result<HashMap<Capability, Fixture>> {
    Ok(serde_json::from_str(content)?)
}

/// Build a registry with one [`FixtureHandler`] per entry of the fixture file.
pub fn load_fixture_registry(path: &Path) -> Result<HandlerRegistry> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read fixture file {}: {}", path.display(), e))
    })?;
    let fixtures = parse_fixtures(&content)?;
    let mut registry = HandlerRegistry::new();
    for (capability, fixture) in fixtures {
        registry.register(capability, Arc::new(FixtureHandler::new(fixture)));
    }
    Ok(registry)
}
