//! Configuration resolution for Valor.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/valor/settings.json)
//! 3. Project config (.valor/settings.json)
//! 4. Environment variables (`VALOR_*`)
//! 5. CLI arguments (highest priority, applied by the binary)

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete Valor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub agents: AgentConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Workflow-level limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// A workflow whose error count exceeds this ceiling is pushed to `failed`.
    pub max_error_count: u32,
    /// Overall deadline after which a run is force-finalized (None = no deadline).
    pub workflow_deadline_secs: Option<u64>,
    /// Upper bound on workflows held in the live working set.
    pub max_live_workflows: usize,
    /// Retired workflows whose snapshot and result stay in memory; older
    /// ones are answered from the store.
    pub max_archived_workflows: usize,
    /// Capacity of the progress broadcast buffer.
    pub event_buffer: usize,
    /// Completeness below which the quality check flags insufficient coverage.
    pub min_completeness: f64,
    pub log_level: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_error_count: 6,
            workflow_deadline_secs: None,
            max_live_workflows: 256,
            max_archived_workflows: 1024,
            event_buffer: 256,
            min_completeness: 0.5,
            log_level: "info".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn workflow_deadline(&self) -> Option<Duration> {
        self.workflow_deadline_secs.map(Duration::from_secs)
    }
}

/// Per-agent execution envelope settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Timeout for a single attempt.
    pub timeout_seconds: u64,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    /// Backoff before the first retry.
    pub initial_delay_ms: u64,
    /// Backoff cap.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 120,
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl AgentConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Execution tier a capability is dispatched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Economy,
    Standard,
    Premium,
}

impl ModelTier {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Economy => "economy",
            Self::Standard => "standard",
            Self::Premium => "premium",
        }
    }

    /// The next cheaper tier, if any.
    pub const fn downgrade(self) -> Option<Self> {
        match self {
            Self::Premium => Some(Self::Standard),
            Self::Standard => Some(Self::Economy),
            Self::Economy => None,
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named cost profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostProfile {
    /// Maximum agents running simultaneously inside one workflow.
    pub max_concurrent_agents: usize,
    /// Tier used for capabilities with no special quality requirement.
    pub default_tier: ModelTier,
    /// Admission ceiling for a single workflow's estimated cost.
    pub max_workflow_cost_usd: f64,
}

/// Budget and cost-profile configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub active_profile: String,
    pub profiles: HashMap<String, CostProfile>,
    /// Total spend allowed across all workflows of one process.
    pub budget_usd: f64,
    /// Flat per-task cost by tier.
    pub tier_costs_usd: HashMap<ModelTier, f64>,
}

impl Default for CostConfig {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(
            "economy".to_string(),
            CostProfile {
                max_concurrent_agents: 2,
                default_tier: ModelTier::Economy,
                max_workflow_cost_usd: 0.5,
            },
        );
        profiles.insert(
            "balanced".to_string(),
            CostProfile {
                max_concurrent_agents: 6,
                default_tier: ModelTier::Standard,
                max_workflow_cost_usd: 2.0,
            },
        );
        profiles.insert(
            "premium".to_string(),
            CostProfile {
                max_concurrent_agents: 12,
                default_tier: ModelTier::Premium,
                max_workflow_cost_usd: 10.0,
            },
        );

        let tier_costs_usd = HashMap::from([
            (ModelTier::Economy, 0.02),
            (ModelTier::Standard, 0.10),
            (ModelTier::Premium, 0.40),
        ]);

        Self {
            active_profile: "balanced".to_string(),
            profiles,
            budget_usd: 50.0,
            tier_costs_usd,
        }
    }
}

impl CostConfig {
    /// Resolve the active profile.
    pub fn profile(&self) -> Result<&CostProfile> {
        self.profiles.get(&self.active_profile).ok_or_else(|| {
            Error::Config(format!("Unknown cost profile: {}", self.active_profile))
        })
    }

    /// Flat cost of one task on the given tier (0 when unpriced).
    pub fn tier_cost(&self, tier: ModelTier) -> f64 {
        self.tier_costs_usd.get(&tier).copied().unwrap_or(0.0)
    }
}

/// Model identifiers per tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub economy: String,
    pub standard: String,
    pub premium: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            economy: "claude-3-5-haiku-latest".to_string(),
            standard: "claude-sonnet-4-20250514".to_string(),
            premium: "claude-opus-4-20250514".to_string(),
        }
    }
}

impl ModelConfig {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Economy => &self.economy,
            ModelTier::Standard => &self.standard,
            ModelTier::Premium => &self.premium,
        }
    }
}

/// Durable storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: Option<PathBuf>,
}

impl Config {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let profile = self.cost.profile()?;
        if profile.max_concurrent_agents == 0 {
            return Err(Error::Config(format!(
                "Profile {} must allow at least one concurrent agent",
                self.cost.active_profile
            )));
        }
        if self.agents.timeout_seconds == 0 {
            return Err(Error::Config("agents.timeout_seconds must be > 0".to_string()));
        }
        if self.agents.multiplier < 1.0 {
            return Err(Error::Config("agents.multiplier must be >= 1.0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.orchestrator.min_completeness) {
            return Err(Error::Config(
                "orchestrator.min_completeness must be within [0, 1]".to_string(),
            ));
        }
        if self.orchestrator.max_live_workflows == 0 {
            return Err(Error::Config(
                "orchestrator.max_live_workflows must be > 0".to_string(),
            ));
        }
        if self.orchestrator.max_archived_workflows == 0 {
            return Err(Error::Config(
                "orchestrator.max_archived_workflows must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".valor").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".valor").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/valor/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("valor").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Read one settings file.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.orchestrator = overlay.orchestrator;
    base.agents = overlay.agents;
    base.models = overlay.models;

    // Profiles accumulate so a project file can add one without restating the rest.
    base.cost.active_profile = overlay.cost.active_profile;
    base.cost.budget_usd = overlay.cost.budget_usd;
    base.cost.profiles.extend(overlay.cost.profiles);
    base.cost.tier_costs_usd.extend(overlay.cost.tier_costs_usd);

    if overlay.storage.database_path.is_some() {
        base.storage.database_path = overlay.storage.database_path;
    }
}

/// Apply `VALOR_*` overrides; `lookup` abstracts the environment for tests.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(n) = lookup("VALOR_MAX_ERROR_COUNT").and_then(|v| v.parse().ok()) {
        config.orchestrator.max_error_count = n;
    }
    if let Some(n) = lookup("VALOR_WORKFLOW_DEADLINE_SECS").and_then(|v| v.parse().ok()) {
        config.orchestrator.workflow_deadline_secs = Some(n);
    }
    if let Some(n) = lookup("VALOR_MAX_ARCHIVED_WORKFLOWS").and_then(|v| v.parse().ok()) {
        config.orchestrator.max_archived_workflows = n;
    }
    if let Some(n) = lookup("VALOR_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
        config.agents.timeout_seconds = n;
    }
    if let Some(n) = lookup("VALOR_MAX_RETRIES").and_then(|v| v.parse().ok()) {
        config.agents.max_retries = n;
    }
    if let Some(val) = lookup("VALOR_COST_PROFILE") {
        config.cost.active_profile = val;
    }
    if let Some(n) = lookup("VALOR_BUDGET_USD").and_then(|v| v.parse().ok()) {
        config.cost.budget_usd = n;
    }
    if let Some(val) = lookup("VALOR_LOG_LEVEL") {
        config.orchestrator.log_level = val;
    }
    if let Some(val) = lookup("VALOR_DATABASE_PATH") {
        config.storage.database_path = Some(PathBuf::from(val));
    }
}
