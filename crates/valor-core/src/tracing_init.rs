//! Shared tracing/logging initialisation.
//!
//! The `valor` binary and any embedding service set up `tracing_subscriber`
//! the same way: an env-filter scoped to the Valor crates plus an optional
//! JSON formatter for log aggregation.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Crates whose spans and events the default filter enables.
const VALOR_TARGETS: [&str; 2] = ["valor_engine", "valor_core"];

/// Build the default filter directive for the given level,
/// e.g. `"valor_engine=info,valor_core=info"`.
pub fn default_filter(level: &str) -> String {
    VALOR_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global tracing subscriber.
///
/// * `level` -- level applied to the Valor crates when `RUST_LOG` is not set.
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Fails instead of panicking when a global subscriber is already installed,
/// so an embedder that owns its own subscriber can ignore the error.
pub fn init_tracing(level: &str, log_json: bool) -> Result<(), TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(level)));
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    }
}
