//! HTTP routers and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{MethodFilter, MethodRouter, get, on, post},
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error};

use super::auth::{AuthManager, ResolvedIdentity, auth_middleware};
use super::filter::{FilterGate, FilterManager, QueryParam, filter_middleware};
use super::proxy::Forward;
use crate::reload::ReloadCoordinator;

/// Shared state of the tenant listener
pub struct AppState {
    /// Live credential table owner
    pub auth: Arc<AuthManager>,
    /// Live match table owner
    pub filter: Arc<FilterManager>,
    /// Final pipeline stage
    pub forwarder: Arc<dyn Forward>,
    /// Whether the authentication gate runs
    pub authentication: bool,
    /// Serve the `/api/v1` routes
    pub api_enabled: bool,
    /// Serve `/federate`
    pub federate_enabled: bool,
    /// Per-request timeout
    pub timeout: Duration,
}

/// Create the tenant router.
///
/// Every route runs auth (if enabled), then the filter gate for its
/// parameter, then the forwarder. Only GET is admitted.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new();
    let mut routes = 0;

    if state.api_enabled {
        router = router
            .route("/api/v1/series", tenant_route(&state, QueryParam::SeriesMatch))
            .route("/api/v1/query", tenant_route(&state, QueryParam::Expression))
            .route("/api/v1/query_range", tenant_route(&state, QueryParam::Expression));
        routes += 3;
    }
    if state.federate_enabled {
        router = router.route("/federate", tenant_route(&state, QueryParam::SeriesMatch));
        routes += 1;
    }

    // route_layer so unknown paths 404 instead of 401
    if state.authentication && routes > 0 {
        router = router.route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.auth),
            auth_middleware,
        ));
    }

    router
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            state.timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn tenant_route(state: &Arc<AppState>, param: QueryParam) -> MethodRouter<Arc<AppState>> {
    let gate = FilterGate {
        filter: Arc::clone(&state.filter),
        param,
    };
    // `get` would admit HEAD as well
    on(MethodFilter::GET, forward_handler)
        .route_layer(middleware::from_fn_with_state(gate, filter_middleware))
}

/// Hand the filtered request to the forwarder
async fn forward_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    if let Some(identity) = request.extensions().get::<ResolvedIdentity>() {
        debug!(client = %identity.client, scheme = ?identity.scheme, path = %request.uri().path(), "Forwarding");
    }
    match state.forwarder.forward(request).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Upstream forwarding failed");
            e.into_response()
        }
    }
}

/// Create the admin router
pub fn create_admin_router(reload: Arc<ReloadCoordinator>, timeout: Duration) -> Router {
    Router::new()
        .route(
            "/admin/config/reload",
            post(reload_handler).put(reload_handler),
        )
        .route("/health", get(health_handler))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(reload)
}

/// POST|PUT /admin/config/reload - reload and report the outcome
async fn reload_handler(State(reload): State<Arc<ReloadCoordinator>>) -> Response {
    debug!("Got reload config request");
    match reload.reload().await {
        Ok(_) => (StatusCode::OK, "config has been successfully reloaded\n").into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to reload config: {e}\n"),
        )
            .into_response(),
    }
}

/// GET /health
async fn health_handler(State(reload): State<Arc<ReloadCoordinator>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "generation": reload.generation(),
        "reloading": reload.is_reloading(),
    }))
}
