//! Kinet - Mobility-aware edge placement orchestrator
//!
//! Drives one placement scenario against an external cluster, an SDN
//! controller and the vehicular network simulation:
//! - Vehicle tracking from telemetry files (tracker.rs)
//! - SDN flow lifecycle (sdn.rs)
//! - Deployment CRUD with a local cache (orchestration.rs, deploy.rs)
//! - Placement strategies (scenario/)
//!
//! Binary: kinet

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod deploy;
mod error;
mod orchestration;
mod scenario;
mod sdn;
mod telemetry;
mod tracker;
mod viz;

/// Kinet - Mobility-aware edge placement orchestrator
#[derive(Parser)]
#[command(name = "kinet")]
#[command(about = "Edge placement scenarios for vehicles roaming between access points", long_about = None)]
struct Cli {
    /// Run configuration file
    #[arg(long, short, env = "KINET_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kinet=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let run_config = config::RunConfig::load(&cli.config)
        .with_context(|| format!("loading run config {}", cli.config.display()))?;

    info!("========================================");
    info!("Kinet starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Scenario: {:?}", run_config.scenario);
    info!("========================================");

    scenario::run(run_config).await.context("scenario run failed")?;

    info!("run finished");
    Ok(())
}
