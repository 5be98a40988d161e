//! Prometheus Tenant Gateway Library
//!
//! Authenticating reverse proxy that gives every client of a shared
//! Prometheus server its own view of the data.
//!
//! # Features
//!
//! - **Identification**: trusted id header, HTTP Basic (raw base64) or Bearer token
//! - **Enforcement**: per-client label constraints injected into every selector
//!   of `query` and `match[]`
//! - **Hot reload**: SIGHUP or `POST /admin/config/reload`, all-or-nothing
//! - **Fail-closed**: unknown identities and unparsable queries never reach upstream

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod promql;
pub mod reload;
pub mod snapshot;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
