use anyhow::Result;
use clap::Parser;
use tracing::info;

use churnguard_core::init_tracing;
use drift_orchestrator::cli::Cli;
use drift_orchestrator::commands;
use drift_orchestrator::config::{PipelineConfig, SERVICE_NAME};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(SERVICE_NAME)?;

    let cfg = PipelineConfig::load(cli.config.as_deref())?;
    info!(input = %cfg.input_dir.display(), prod = %cfg.prod_deployment_dir.display(), command = ?cli.command, "config loaded");

    commands::dispatch(cli.command, cfg, cli.format).await
}
