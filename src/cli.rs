//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Multi-tenant authenticating gateway for the Prometheus query API
#[derive(Parser, Debug)]
#[command(name = "prom-tenant-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "PROM_GATEWAY_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Tenant listener port (overrides server.port)
    #[arg(short, long, env = "PROM_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to (overrides server.host)
    #[arg(long, env = "PROM_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "PROM_GATEWAY_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "PROM_GATEWAY_LOG_FORMAT")]
    pub log_format: Option<String>,
}
