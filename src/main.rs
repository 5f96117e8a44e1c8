//! Daedalus - autonomous work orchestration daemon
//!
//! CLI entry point for the dispatch loop.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod runtime;

/// Daedalus work orchestration daemon
#[derive(Parser, Debug)]
#[command(name = "daedalus")]
#[command(about = "Autonomous work orchestration over role agents")]
#[command(version)]
pub struct Cli {
    /// Path to an additional TOML configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the work database path
    #[arg(long, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Run a single dispatch cycle and exit
    #[arg(long)]
    pub once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "daedalus=info,daedalus_core=info,daedalus_store=info,daedalus_exec=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    info!("Starting Daedalus v{}", env!("CARGO_PKG_VERSION"));

    runtime::run(cli).await
}
