//! Valor
//!
//! Command-line front end for the validation engine. User-facing output is
//! JSON written to stdout with `writeln!`; logs go to stderr via tracing.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use valor_core::Config;
use valor_core::config::load_config;
use valor_engine::capability::load_fixture_registry;
use valor_engine::orchestration::synthesis::{quality_flags, synthesize};
use valor_engine::orchestration::{Collaborators, SupervisorOrchestrator};
use valor_engine::progress::{BroadcastPublisher, ProgressEvent};
use valor_engine::storage::{Database, MemoryStore, WorkflowStore};
use valor_engine::workflow::{AgentResult, Capability, ValidationRequest, WorkflowStatus};

#[derive(Parser, Debug)]
#[command(name = "valor")]
#[command(version, about = "Valor - multi-agent business and risk validation")]
struct Args {
    /// Project directory holding `.valor/settings.json`
    #[arg(long, global = true, env = "VALOR_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Cost profile to run under (overrides configuration)
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Database file path (overrides configuration)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Log level for the Valor crates (e.g. "info", "debug", "warn")
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "VALOR_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one validation workflow against fixture-backed handlers.
    Run {
        /// JSON file containing the validation request
        #[arg(long)]
        request: PathBuf,
        /// JSON file mapping capabilities to scripted outcomes
        #[arg(long)]
        fixtures: PathBuf,
    },
    /// Synthesize a result from a JSON map of capability results.
    Synthesize {
        #[arg(long)]
        results: PathBuf,
    },
    /// Show the stored status of a workflow.
    Status {
        #[arg(long)]
        workflow: String,
    },
    /// List stored workflows, newest first.
    List {
        /// Only workflows with this status
        #[arg(long, value_parser = parse_status)]
        status: Option<WorkflowStatus>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = match &args.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let mut config = load_config(Some(project_dir.as_path()))?;
    if let Some(profile) = args.profile {
        config.cost.active_profile = profile;
    }
    if let Some(path) = args.db_path {
        config.storage.database_path = Some(path);
    }
    if let Some(level) = args.log_level {
        config.orchestrator.log_level = level;
    }
    config.validate()?;

    if let Err(e) =
        valor_core::tracing_init::init_tracing(&config.orchestrator.log_level, args.log_json)
    {
        warn!(error = %e, "Tracing already initialised");
    }

    match args.command {
        Command::Run { request, fixtures } => run(config, &request, &fixtures).await,
        Command::Synthesize { results } => synthesize_file(&config, &results),
        Command::Status { workflow } => status(&config, &workflow).await,
        Command::List { status, limit } => list(&config, status, limit).await,
    }
}

async fn run(config: Config, request_path: &Path, fixtures_path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(request_path)
        .with_context(|| format!("Failed to read request {}", request_path.display()))?;
    let request: ValidationRequest = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse request {}", request_path.display()))?;
    let handlers = load_fixture_registry(fixtures_path)?;

    let publisher = BroadcastPublisher::new(config.orchestrator.event_buffer);
    let mut events = publisher.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Progress log fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut collaborators = Collaborators::from_config(&config)?;
    collaborators.publisher = Arc::new(publisher);
    collaborators.store = open_store(&config).await?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        profile = %config.cost.active_profile,
        "Starting validation"
    );
    let orchestrator = Arc::new(SupervisorOrchestrator::new(config, handlers, collaborators)?);
    let ticket = orchestrator.start_workflow(request).await?;
    let workflow_id = ticket.workflow_id.clone();

    let snapshot = tokio::select! {
        snapshot = orchestrator.wait_for_terminal(&workflow_id) => snapshot?,
        _ = tokio::signal::ctrl_c() => {
            warn!(%workflow_id, "Interrupted; cancelling workflow");
            orchestrator.cancel_workflow(&workflow_id).await;
            orchestrator.wait_for_terminal(&workflow_id).await?
        }
    };
    let result = orchestrator.get_result(&workflow_id).await.ok();

    let mut out = io::stdout();
    writeln!(
        out,
        "{}",
        serde_json::to_string_pretty(&json!({
            "ticket": ticket,
            "status": snapshot,
            "result": result,
        }))?
    )?;

    if snapshot.status != WorkflowStatus::Completed {
        anyhow::bail!("Workflow {workflow_id} ended {}", snapshot.status);
    }
    Ok(())
}

fn synthesize_file(config: &Config, results_path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(results_path)
        .with_context(|| format!("Failed to read results {}", results_path.display()))?;
    let results: BTreeMap<Capability, AgentResult> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse results {}", results_path.display()))?;

    let mut result = synthesize(&results, &[]);
    result.quality_flags = quality_flags(&result, config.orchestrator.min_completeness);

    let mut out = io::stdout();
    writeln!(out, "{}", serde_json::to_string_pretty(&result)?)?;
    Ok(())
}

async fn status(config: &Config, workflow_id: &str) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    let snapshot = db
        .load_snapshot(workflow_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Workflow not found: {workflow_id}"))?;
    let result = db.load_result(workflow_id).await?;

    let mut out = io::stdout();
    writeln!(
        out,
        "{}",
        serde_json::to_string_pretty(&json!({ "status": snapshot, "result": result }))?
    )?;
    Ok(())
}

async fn list(config: &Config, status: Option<WorkflowStatus>, limit: i64) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    let rows = db
        .list_workflows(status.map(WorkflowStatus::as_str), limit)
        .await?;
    let listing: Vec<_> = rows
        .iter()
        .map(|row| {
            json!({
                "workflow_id": row.id,
                "status": row.status,
                "phase": row.phase,
                "progress": row.progress,
                "error_count": row.error_count,
                "created_at": row.created_at,
                "updated_at": row.updated_at,
            })
        })
        .collect();

    let mut out = io::stdout();
    writeln!(out, "{}", serde_json::to_string_pretty(&listing)?)?;
    Ok(())
}

async fn open_database(config: &Config) -> anyhow::Result<Database> {
    let path = match &config.storage.database_path {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    Ok(Database::open(&path).await?)
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn WorkflowStore>> {
    Ok(match &config.storage.database_path {
        Some(path) => {
            info!(path = %path.display(), "Opening database");
            Arc::new(Database::open(path).await?)
        }
        None => Arc::new(MemoryStore::new()),
    })
}

fn log_event(event: &ProgressEvent) {
    info!(
        workflow_id = %event.workflow_id,
        phase = %event.phase,
        progress = event.progress,
        "{}",
        event.message
    );
}

fn parse_status(s: &str) -> Result<WorkflowStatus, String> {
    match s {
        "pending" => Ok(WorkflowStatus::Pending),
        "in_progress" => Ok(WorkflowStatus::InProgress),
        "completed" => Ok(WorkflowStatus::Completed),
        "failed" => Ok(WorkflowStatus::Failed),
        "cancelled" => Ok(WorkflowStatus::Cancelled),
        other => Err(format!(
            "unknown status: {other} (expected pending, in_progress, completed, failed or cancelled)"
        )),
    }
}

/// Default database path: ~/.valor/valor.db
fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".valor").join("valor.db"))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_accepts_stored_names() {
        assert_eq!(parse_status("in_progress"), Ok(WorkflowStatus::InProgress));
        assert_eq!(parse_status("cancelled"), Ok(WorkflowStatus::Cancelled));
    }

    #[test]
    fn parse_status_invalid() {
        assert!(parse_status("running").is_err());
    }

    #[test]
    fn list_command_parses_filter_and_limit() {
        let args = Args::parse_from(["valor", "list", "--status", "failed", "--limit", "5"]);
        match args.command {
            Command::List { status, limit } => {
                assert_eq!(status, Some(WorkflowStatus::Failed));
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn list_limit_defaults_to_twenty() {
        let args = Args::parse_from(["valor", "list"]);
        assert!(matches!(
            args.command,
            Command::List {
                status: None,
                limit: 20
            }
        ));
    }
}
