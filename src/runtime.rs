//! Runtime wiring for the daemon.
//!
//! Loads layered configuration, opens the work store, assembles the
//! dispatcher, and runs it until a shutdown signal arrives.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use daedalus_core::{
    BackoffConfig, BackoffCoordinator, ChaosConfig, Dispatcher, ErrorInjector, OrchestratorConfig,
};
use daedalus_exec::{AgentExecutor, ExecutorConfig, ShellExecutor};
use daedalus_store::WorkStore;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Embedded default configuration (compiled into binary)
const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub chaos: ChaosConfig,
}

/// Work database location
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/daedalus.db")
}

/// Load configuration from embedded defaults, files, and environment
pub(crate) fn load_config(config_path: Option<&Path>) -> Result<AppConfig> {
    let mut builder = Config::builder()
        // 1. Embedded defaults (always available)
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        // 2. External overrides (optional)
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name("config/local").required(false));

    // 3. Explicit --config file (must exist when given)
    if let Some(path) = config_path {
        builder = builder.add_source(File::from(path));
    }

    // 4. Environment variables (highest priority)
    // prefix_separator("_") ensures DAEDALUS_ORCHESTRATOR__X works
    // (single _ after prefix) rather than DAEDALUS__ORCHESTRATOR__X.
    let config = builder
        .add_source(
            Environment::with_prefix("DAEDALUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}

/// Run the daemon with the given command-line arguments.
pub async fn run(args: crate::Cli) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.database.path = db;
    }

    let store = WorkStore::from_path(
        &config.database.path,
        config.orchestrator.stale_lock_timeout(),
    )
    .await
    .context("Failed to open work store")?;

    let executor = Arc::new(ShellExecutor::new(config.executor.clone()));
    if !executor.is_available().await {
        warn!(
            command = %config.executor.command,
            "Agent command not found on PATH; engagements will fail until it is installed"
        );
    }

    let injector = Arc::new(ErrorInjector::new(config.chaos.clone()));
    if injector.is_enabled() {
        warn!(
            rate = injector.config().injection_rate,
            "Error injection is enabled; agent outputs will be corrupted on purpose"
        );
    }

    let dispatcher = Dispatcher::builder(store, executor as Arc<dyn AgentExecutor>)
        .with_config(config.orchestrator.clone())
        .with_injector(injector)
        .with_backoff(Arc::new(BackoffCoordinator::new(config.backoff.clone())))
        .build()
        .context("Failed to build dispatcher")?;

    if args.once {
        let report = dispatcher.run_cycle().await?;
        info!(
            recovered_locks = report.recovered_locks,
            healed_bugs = report.healed_bugs,
            available = report.available,
            dispatched = report.dispatched,
            skipped = report.skipped,
            "Single dispatch cycle complete"
        );
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let loop_token = shutdown.clone();
    let handle = tokio::spawn(async move { dispatcher.run(loop_token).await });

    wait_for_shutdown_signal().await;
    shutdown.cancel();
    handle.await.context("Dispatcher task panicked")??;

    info!("Daedalus shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_deserialize() {
        let config = load_config(None).expect("load defaults");
        assert_eq!(config.orchestrator.polling_interval_ms, 5_000);
        assert_eq!(config.orchestrator.max_concurrent_developers, 2);
        assert_eq!(config.executor.command, "claude");
        assert_eq!(config.backoff.max_retries, 3);
        assert!(!config.chaos.enabled);
    }

    #[test]
    fn missing_explicit_config_file_is_an_error() {
        let missing = Path::new("/nonexistent/daedalus.toml");
        assert!(load_config(Some(missing)).is_err());
    }

    #[test]
    fn explicit_config_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("override.toml");
        std::fs::write(
            &path,
            "[orchestrator]\npolling_interval_ms = 250\n\n[executor]\ncommand = \"codex\"\n",
        )
        .expect("write override");

        let config = load_config(Some(&path)).expect("load with override");
        assert_eq!(config.orchestrator.polling_interval_ms, 250);
        assert_eq!(config.executor.command, "codex");
        // Untouched sections keep their embedded defaults.
        assert_eq!(config.orchestrator.max_concurrent_managers, 3);
        assert_eq!(config.backoff.max_retries, 3);
    }
}
