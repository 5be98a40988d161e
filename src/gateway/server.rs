//! Gateway server

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::auth::AuthManager;
use super::filter::FilterManager;
use super::proxy::{Forward, HttpForwarder};
use super::router::{AppState, create_admin_router, create_router};
use crate::config::Config;
use crate::reload::{ReloadCoordinator, SnapshotSource};
use crate::{Error, Result};

/// Tenant gateway server
pub struct Gateway {
    /// Configuration read at startup
    config: Config,
    /// Live credential table owner
    auth: Arc<AuthManager>,
    /// Live match table owner
    filter: Arc<FilterManager>,
    /// Reload coordinator shared by SIGHUP and the admin listener
    reload: Arc<ReloadCoordinator>,
    /// Upstream forwarder
    forwarder: Arc<dyn Forward>,
}

impl Gateway {
    /// Create a gateway from the startup configuration.
    ///
    /// Both tables are built here; a snapshot that does not validate is
    /// fatal. `source` is re-read on every reload.
    pub fn new(config: Config, source: Arc<dyn SnapshotSource>) -> Result<Self> {
        let snapshot = config.snapshot();
        let auth = Arc::new(AuthManager::new(AuthManager::build(&snapshot)?));
        let filter = Arc::new(FilterManager::new(FilterManager::build(&snapshot)?));
        let reload = Arc::new(ReloadCoordinator::new(
            source,
            Arc::clone(&auth),
            Arc::clone(&filter),
        ));
        let forwarder = Arc::new(HttpForwarder::new(
            config.server.upstream_url()?,
            config.server.upstream_timeout,
        )?);

        info!(clients = snapshot.clients.len(), "Client tables built");

        Ok(Self {
            config,
            auth,
            filter,
            reload,
            forwarder,
        })
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(self) -> Result<()> {
        let server = &self.config.server;
        let host: IpAddr = server
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid host: {e}")))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(AppState {
            auth: Arc::clone(&self.auth),
            filter: Arc::clone(&self.filter),
            forwarder: Arc::clone(&self.forwarder),
            authentication: server.authentication,
            api_enabled: server.api_enable,
            federate_enabled: server.federate_enable,
            timeout: server.timeout,
        });
        let app = create_router(state);

        let listener = TcpListener::bind(SocketAddr::new(host, server.port)).await?;

        info!("============================================================");
        info!("PROM TENANT GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %server.host, port = server.port, "Listening");
        info!(upstream = %server.proxy, id_header = %server.id_header, "Proxying");
        if server.api_enable {
            info!("  GET /api/v1/series       (match[])");
            info!("  GET /api/v1/query        (query)");
            info!("  GET /api/v1/query_range  (query)");
        }
        if server.federate_enable {
            info!("  GET /federate            (match[])");
        }
        if !server.api_enable && !server.federate_enable {
            warn!("All tenant routes are disabled");
        }
        if server.authentication {
            info!("AUTHENTICATION enabled");
        } else {
            warn!("AUTHENTICATION disabled - identity is taken from the id header as sent");
        }

        let admin = if server.admin_api_enable {
            let admin_listener =
                TcpListener::bind(SocketAddr::new(host, server.admin_port)).await?;
            info!(port = server.admin_port, "Admin listener");
            info!("  POST|PUT /admin/config/reload");
            info!("  GET      /health");

            let admin_app = create_admin_router(Arc::clone(&self.reload), server.timeout);
            let mut admin_shutdown = shutdown_tx.subscribe();
            Some(tokio::spawn(async move {
                let served = axum::serve(admin_listener, admin_app)
                    .with_graceful_shutdown(async move {
                        let _ = admin_shutdown.recv().await;
                    })
                    .await;
                if let Err(e) = served {
                    error!(error = %e, "Admin listener failed");
                }
            }))
        } else {
            None
        };
        info!("============================================================");

        spawn_reload_on_hangup(Arc::clone(&self.reload), shutdown_tx.subscribe());

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        // Tenant listener may also stop on its own; make sure admin follows.
        let _ = shutdown_tx.send(());
        if let Some(admin) = admin {
            if let Err(e) = admin.await {
                warn!(error = %e, "Admin listener task failed");
            }
        }

        info!("Gateway has been shut down");
        Ok(())
    }
}

/// SIGHUP triggers an asynchronous reload; the outcome is only logged.
#[cfg(unix)]
fn spawn_reload_on_hangup(reload: Arc<ReloadCoordinator>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGHUP handler, signal reload disabled");
            return;
        }
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = hangup.recv() => {
                    info!("SIGHUP received");
                    reload.trigger();
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_reload: Arc<ReloadCoordinator>, _shutdown_rx: broadcast::Receiver<()>) {}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
