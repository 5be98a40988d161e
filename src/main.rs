//! Prometheus Tenant Gateway
//!
//! Authenticating reverse proxy enforcing per-client label constraints.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use prom_tenant_gateway::{
    cli::Cli,
    config::{Config, FileSnapshotSource},
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match run_server(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(&cli.config).with_context(|| {
        format!("Failed to load configuration from {}", cli.config.display())
    })?;

    // Apply CLI overrides
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        clients = config.clients.len(),
        "Starting Prometheus tenant gateway"
    );

    let source = Arc::new(FileSnapshotSource::new(cli.config));
    let gateway = Gateway::new(config, source).context("Failed to create gateway")?;
    gateway.run().await.context("Gateway error")?;

    info!("Gateway shutdown complete");
    Ok(())
}
