//! Test server harness for E2E testing
//!
//! Provides `TestScServer` for spawning real Signal Coordinator instances in
//! tests.

use metrics_exporter_prometheus::PrometheusHandle;
use sc_service::accounts::{
    Account, AccountDirectory, AccountStore, Authenticator, CredentialVerifier, DirectoryHandle,
    StaticAccountStore,
};
use sc_service::actors::{CoordinatorActor, CoordinatorHandle};
use sc_service::config::Config;
use sc_service::ice::{IceConfig, IceProber};
use sc_service::observability::health::HealthState;
use sc_service::observability::metrics::init_metrics_recorder;
use sc_service::routes::{self, AppState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Token held by the harness's static store. `/accounts/refresh` replaces the
/// seeded directory with one account carrying this token.
pub const STATIC_STORE_TOKEN: &str = "harness-static-token";

/// A Prometheus recorder installs once per process; every harness after the
/// first reuses the same handle.
fn metrics_handle() -> PrometheusHandle {
    static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
    HANDLE
        .get_or_init(|| {
            init_metrics_recorder().expect("Prometheus recorder should install once per process")
        })
        .clone()
}

/// Test harness for spawning a Signal Coordinator server in E2E tests.
///
/// The STUN URL points at localhost so probe-touching tests never depend on
/// outside network access.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_signaling_flow_e2e() -> Result<(), anyhow::Error> {
///     let server = TestScServer::spawn(vec![account("acme", "tok-a")]).await?;
///
///     let (mut client, welcome) =
///         WsClient::connect_peer(&server.ws_url(), "tok-a", "alice").await?;
///     assert_eq!(welcome["type"], "welcome");
///     Ok(())
/// }
/// ```
pub struct TestScServer {
    addr: SocketAddr,
    coordinator: CoordinatorHandle,
    cancel_token: CancellationToken,
    _handle: JoinHandle<()>,
}

impl TestScServer {
    /// Spawn a test server seeded with `accounts`, status surface disabled.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Start the HTTP server in the background
    ///
    /// # Returns
    /// * `Ok(TestScServer)` - Running server instance
    /// * `Err(anyhow::Error)` - If server spawn fails
    pub async fn spawn(accounts: Vec<Account>) -> Result<Self, anyhow::Error> {
        Self::spawn_inner(accounts, None).await
    }

    /// Spawn with the status surface gated behind `status_key`.
    pub async fn spawn_with_status_key(
        accounts: Vec<Account>,
        status_key: &str,
    ) -> Result<Self, anyhow::Error> {
        Self::spawn_inner(accounts, Some(status_key)).await
    }

    async fn spawn_inner(
        accounts: Vec<Account>,
        status_key: Option<&str>,
    ) -> Result<Self, anyhow::Error> {
        // Build configuration for test environment
        let mut vars = HashMap::from([
            ("SC_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("SC_STATIC_TOKEN".to_string(), STATIC_STORE_TOKEN.to_string()),
            ("SC_STUN_URL".to_string(), "stun:127.0.0.1:3478".to_string()),
            ("SC_ID".to_string(), "sc-test".to_string()),
        ]);
        if let Some(key) = status_key {
            vars.insert("SC_STATUS_KEY".to_string(), key.to_string());
        }

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        // Seed the directory from the supplied accounts rather than the
        // store; the store only matters to refresh tests.
        let directory = DirectoryHandle::new(AccountDirectory::from_accounts(accounts));
        let store = AccountStore::Static(StaticAccountStore::new(STATIC_STORE_TOKEN));

        let verifier = CredentialVerifier::new(Duration::from_secs(config.verify_timeout_seconds))
            .map_err(|e| anyhow::anyhow!("Failed to build verifier: {}", e))?;
        let authenticator = Authenticator::new(directory.clone(), verifier);

        let ice = Arc::new(IceConfig::from_config(&config));
        let prober = Arc::new(IceProber::from_config(&config));

        let cancel_token = CancellationToken::new();
        let (coordinator, _join) = CoordinatorActor::spawn(
            config.sc_id.clone(),
            directory.clone(),
            ice.as_ref().clone(),
            Duration::from_secs(config.channel_grace_seconds),
            Duration::from_secs(config.sweep_interval_seconds),
            cancel_token.clone(),
        );

        let health_state = Arc::new(HealthState::new());
        health_state.set_ready();

        let state = AppState {
            coordinator: coordinator.clone(),
            directory,
            store: Arc::new(store),
            authenticator,
            ice,
            prober,
            status_key: config.status_key.clone(),
        };

        let app = routes::build_routes(state, metrics_handle(), health_state);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        // Spawn server in background
        let handle = tokio::spawn(async move {
            // Use into_make_service_with_connect_info to support SocketAddr extraction
            let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, make_service).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            coordinator,
            cancel_token,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the WebSocket signaling URL of the test server.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get a handle to the running coordinator for direct state assertions.
    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }
}

impl Drop for TestScServer {
    fn drop(&mut self) {
        // Stop the coordinator actor and the HTTP server task to ensure
        // immediate cleanup when the test completes.
        self.cancel_token.cancel();
        self._handle.abort();
    }
}
