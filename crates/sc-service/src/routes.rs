//! HTTP routes for the Signal Coordinator.
//!
//! Defines the Axum router and application state.

use crate::accounts::{AccountStore, Authenticator, DirectoryHandle};
use crate::actors::CoordinatorHandle;
use crate::handlers;
use crate::ice::{IceConfig, IceProber};
use crate::observability::health::{health_router, HealthState};
use crate::signaling;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Coordinator actor handle. Every signaling operation goes through it.
    pub coordinator: CoordinatorHandle,

    /// Account directory consulted by handshakes and replaced on refresh.
    pub directory: DirectoryHandle,

    /// Backing store the refresh endpoint reloads from.
    pub store: Arc<AccountStore>,

    /// Handshake authenticator: limiter, directory lookup, verification.
    pub authenticator: Authenticator,

    /// ICE configuration handed to every client in the welcome frame.
    pub ice: Arc<IceConfig>,

    /// STUN/TURN prober behind the `/ice` status endpoint.
    pub prober: Arc<IceProber>,

    /// Key gating the status surface. Absent means those endpoints answer
    /// 404.
    pub status_key: Option<SecretString>,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/` - Version and feature banner - public
/// - `/ws` - WebSocket signaling endpoint (authenticates in-band)
/// - `/health` - Liveness probe - public
/// - `/ready` - Readiness probe - public
/// - `/metrics` - Prometheus metrics endpoint - public
/// - `/connections`, `/channels`, `/usage`, `/ice` - Status surface, key-gated
/// - `/accounts/refresh` - Forced directory reload, key-gated
/// - TraceLayer for request logging
/// - 30 second request timeout (the WebSocket upgrade response is immediate;
///   the upgraded stream is not subject to it)
pub fn build_routes(
    state: AppState,
    metrics_handle: PrometheusHandle,
    health_state: Arc<HealthState>,
) -> Router {
    // Public routes (no key required)
    let public_routes = Router::new()
        .route("/", get(handlers::banner))
        .route("/ws", get(signaling::ws_handler))
        .with_state(state.clone());

    // Metrics route with its own state
    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Key-gated status surface. The handlers check the key themselves so an
    // unconfigured key yields 404 rather than a middleware rejection.
    let status_routes = Router::new()
        .route("/connections", get(handlers::connections))
        .route("/channels", get(handlers::channels))
        .route("/usage", get(handlers::usage))
        .route("/ice", get(handlers::ice_status))
        .route("/accounts/refresh", post(handlers::accounts_refresh))
        .with_state(state);

    public_routes
        .merge(metrics_routes)
        .merge(status_routes)
        .merge(health_router(health_state))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
}
