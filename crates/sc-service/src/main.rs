//! Signal Coordinator
//!
//! Stateful WebSocket signaling server for WebRTC broadcasting.
//!
//! # Servers
//!
//! One HTTP listener (default: 0.0.0.0:3000) carries everything:
//! - `/ws` WebSocket signaling endpoint
//! - `/health`, `/ready`, `/metrics` operational endpoints
//! - `/`, `/connections`, `/channels`, `/usage`, `/ice`,
//!   `/accounts/refresh` status surface
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the account store (MySQL, or static token) and load the
//!    directory
//! 4. Spawn the coordinator actor
//! 5. Spawn the media stats poller when a media-server URL is configured
//! 6. Spawn the HTTP server, wait for SIGINT/SIGTERM, then drain
//!
//! The server task shuts down via a child of the coordinator's cancellation
//! token. Signaling sessions hold their WebSocket open indefinitely, so main
//! never awaits connection drain directly; cancelling the coordinator closes
//! every session's event channel and the sessions wind down from there.

use anyhow::Context;
use sc_service::accounts::{
    AccountDirectory, AccountStore, Authenticator, CredentialVerifier, DirectoryHandle,
    MySqlAccountStore, StaticAccountStore,
};
use sc_service::actors::CoordinatorActor;
use sc_service::config::Config;
use sc_service::ice::{IceConfig, IceProber};
use sc_service::observability::health::HealthState;
use sc_service::observability::metrics::init_metrics_recorder;
use sc_service::routes::{build_routes, AppState};
use sc_service::tasks::start_media_stats_poll;
use secrecy::ExposeSecret;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// How long shutdown waits for the coordinator to drain its mailbox.
const COORDINATOR_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing. SC_LOG_JSON=1 switches to JSON structured output
    // for log shippers.
    let json_logs = std::env::var("SC_LOG_JSON")
        .is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sc_service=debug,tower_http=debug".into()),
        )
        .with(fmt_layer)
        .init();

    info!("Starting Signal Coordinator");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        sc_id = %config.sc_id,
        bind_address = %config.bind_address,
        stun_url = %config.stun_url,
        turn_configured = config.turn_url.is_some(),
        channel_grace_seconds = config.channel_grace_seconds,
        sweep_interval_seconds = config.sweep_interval_seconds,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder before any metric is recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow::Error::msg(e)
    })?;

    let health_state = Arc::new(HealthState::new());

    // Account store: MySQL when a database is configured, otherwise the
    // static token accepted by config validation.
    let store = if let Some(database_url) = config.database_url.as_ref() {
        info!("Connecting to database...");
        let store = MySqlAccountStore::connect(database_url.expose_secret())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to database");
                e
            })?;
        info!("Database connection established");
        AccountStore::MySql(store)
    } else if let Some(token) = config.static_token.as_ref() {
        info!("No database configured, using the static account store");
        AccountStore::Static(StaticAccountStore::new(token.expose_secret()))
    } else {
        // Config validation rejects this combination.
        anyhow::bail!("no account store configured");
    };

    // Initial directory load
    let accounts = store.load().await.map_err(|e| {
        error!(error = %e, "Initial account directory load failed");
        e
    })?;
    info!(
        accounts = accounts.len(),
        store = store.kind(),
        "Account directory loaded"
    );
    let directory = DirectoryHandle::new(AccountDirectory::from_accounts(accounts));

    let verifier = CredentialVerifier::new(Duration::from_secs(config.verify_timeout_seconds))?;
    let authenticator = Authenticator::new(directory.clone(), verifier);

    let ice = Arc::new(IceConfig::from_config(&config));
    let prober = Arc::new(IceProber::from_config(&config));

    // Spawn the coordinator actor
    let cancel_token = CancellationToken::new();
    let (coordinator, mut coordinator_join) = CoordinatorActor::spawn(
        config.sc_id.clone(),
        directory.clone(),
        ice.as_ref().clone(),
        Duration::from_secs(config.channel_grace_seconds),
        Duration::from_secs(config.sweep_interval_seconds),
        cancel_token.clone(),
    );
    info!("Coordinator actor started");

    // Optional supplemental stats poller
    if let Some(url) = config.media_server_url.clone() {
        tokio::spawn(start_media_stats_poll(
            coordinator.clone(),
            url,
            Duration::from_secs(config.media_server_poll_seconds),
            cancel_token.child_token(),
        ));
    }

    let state = AppState {
        coordinator: coordinator.clone(),
        directory,
        store: Arc::new(store),
        authenticator,
        ice,
        prober,
        status_key: config.status_key.clone(),
    };

    let app = build_routes(state, prometheus_handle, Arc::clone(&health_state));

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.bind_address))?;

    // Bind before spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to bind");
        e
    })?;
    info!(addr = %addr, "Listener bound successfully");

    // ConnectInfo supplies the client IP to the handshake rate limiter.
    let server_shutdown_token = cancel_token.child_token();
    tokio::spawn(async move {
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            server_shutdown_token.cancelled().await;
            info!("Server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Server failed");
        }
    });

    health_state.set_ready();
    info!("Signal Coordinator listening on {}", addr);

    // The coordinator never exits on its own, so its join handle completing
    // while we wait for a signal is a crash and the process fails fast.
    tokio::select! {
        () = shutdown_signal() => {}
        join = &mut coordinator_join => {
            error!("Coordinator actor exited unexpectedly");
            if let Err(e) = join {
                error!(error = %e, "Coordinator join error");
            }
            anyhow::bail!("coordinator actor exited unexpectedly");
        }
    }

    // Drain: stop taking traffic, then stop the coordinator. Cancelling also
    // closes every session's event channel, which ends the sessions.
    health_state.set_not_ready();
    cancel_token.cancel();
    if tokio::time::timeout(COORDINATOR_DRAIN_TIMEOUT, coordinator_join)
        .await
        .is_err()
    {
        warn!("Coordinator did not stop within the drain timeout");
    }

    info!("Signal Coordinator shutdown complete");
    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
