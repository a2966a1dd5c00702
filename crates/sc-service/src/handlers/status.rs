//! Status surface handlers.
//!
//! Read-only views over the coordinator plus the forced directory refresh.
//! All of them except the banner are gated on the configured status key:
//! a wrong or missing `?key=` answers 401 with a generic body, and with no
//! key configured at all the endpoints answer 404.
//!
//! # Security
//!
//! Error bodies are generic; actual failures are logged server-side.

use crate::accounts::AccountDirectory;
use crate::errors::ScError;
use crate::registry::{ChannelStatus, PeerInfo};
use crate::routes::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

/// Query parameters accepted by the status endpoints.
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    /// Status key; compared against the configured one.
    #[serde(default)]
    key: Option<String>,

    /// Restrict `/usage` to one account.
    #[serde(default)]
    account: Option<String>,
}

/// Check the presented key against the configured one.
///
/// No configured key disables the surface entirely (404, as if the routes
/// did not exist). A configured key turns a mismatch into 401.
fn authorize(state: &AppState, presented: Option<&str>) -> Result<(), Response> {
    let Some(expected) = state.status_key.as_ref() else {
        return Err(StatusCode::NOT_FOUND.into_response());
    };

    if presented == Some(expected.expose_secret()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Unauthorized" })),
        )
            .into_response())
    }
}

/// Generic 500 for coordinator failures; the cause goes to the log only.
fn internal_error(error: &ScError) -> Response {
    warn!(target: "sc.status", error = %error, "Status query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Status unavailable" })),
    )
        .into_response()
}

/// Handler for GET /
///
/// Public version and feature banner.
pub async fn banner() -> Json<serde_json::Value> {
    Json(json!({
        "server": "Signal Coordinator",
        "version": env!("CARGO_PKG_VERSION"),
        "features": ["signaling", "channels", "rooms", "admission", "usage"],
    }))
}

/// Handler for GET /connections
///
/// The live connection table grouped by channel.
#[instrument(skip_all, name = "sc.status.connections")]
pub async fn connections(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    if let Err(refusal) = authorize(&state, query.key.as_deref()) {
        return refusal;
    }

    match state.coordinator.connections().await {
        Ok(rows) => {
            let by_channel: BTreeMap<String, Vec<PeerInfo>> = rows.into_iter().collect();
            Json(by_channel).into_response()
        }
        Err(e) => internal_error(&e),
    }
}

/// Handler for GET /channels
///
/// The channel table with declared params and derived peer counts, keyed by
/// channel name.
#[instrument(skip_all, name = "sc.status.channels")]
pub async fn channels(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    if let Err(refusal) = authorize(&state, query.key.as_deref()) {
        return refusal;
    }

    match state.coordinator.channels().await {
        Ok(rows) => {
            let by_name: BTreeMap<String, ChannelStatus> = rows
                .into_iter()
                .map(|status| (status.name.clone(), status))
                .collect();
            Json(by_name).into_response()
        }
        Err(e) => internal_error(&e),
    }
}

/// Handler for GET /usage
///
/// Global usage snapshot, or one account's figures with `?account=`.
#[instrument(skip_all, name = "sc.status.usage")]
pub async fn usage(State(state): State<AppState>, Query(query): Query<StatusQuery>) -> Response {
    if let Err(refusal) = authorize(&state, query.key.as_deref()) {
        return refusal;
    }

    match state.coordinator.usage().await {
        Ok(snapshot) => match query.account.as_deref() {
            Some(name) => Json(json!({
                "account": name,
                "usage": snapshot.account(name),
                "generatedAt": snapshot.generated_at,
            }))
            .into_response(),
            None => Json(snapshot).into_response(),
        },
        Err(e) => internal_error(&e),
    }
}

/// Handler for GET /ice
///
/// The client ICE configuration plus a (possibly cached) STUN/TURN probe
/// report. The probe runs on demand; within the cache window this answers
/// without touching the network.
#[instrument(skip_all, name = "sc.status.ice")]
pub async fn ice_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    if let Err(refusal) = authorize(&state, query.key.as_deref()) {
        return refusal;
    }

    let report = state.prober.probe().await;
    Json(json!({
        "peerConfig": state.ice.as_ref(),
        "probe": report,
    }))
    .into_response()
}

/// Handler for POST /accounts/refresh
///
/// Reload the account directory from the backing store and swap it in
/// wholesale. Reports the new account count.
#[instrument(skip_all, name = "sc.accounts.refresh")]
pub async fn accounts_refresh(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    if let Err(refusal) = authorize(&state, query.key.as_deref()) {
        return refusal;
    }

    match state.store.load().await {
        Ok(accounts) => {
            let count = state
                .directory
                .replace(AccountDirectory::from_accounts(accounts))
                .await;
            info!(
                target: "sc.accounts",
                accounts = count,
                store = state.store.kind(),
                "Directory refreshed on demand"
            );
            Json(json!({ "accounts": count })).into_response()
        }
        Err(e) => {
            warn!(target: "sc.accounts", error = %e, "Directory refresh failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Account reload failed" })),
            )
                .into_response()
        }
    }
}

/// Handler for GET /metrics
///
/// Returns Prometheus-formatted metrics for scraping. Unauthenticated; only
/// operational data with bounded cardinality labels is exposed.
#[instrument(skip_all, name = "sc.metrics.scrape")]
pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.render()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    // The gated handlers need a full AppState (coordinator, stores, prober);
    // status_api_tests.rs exercises them end to end through the router. Only
    // the state-free banner is unit tested here.
    use super::*;

    #[tokio::test]
    async fn test_banner_names_server_and_version() {
        let Json(body) = banner().await;
        assert_eq!(body["server"], "Signal Coordinator");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert!(body["features"]
            .as_array()
            .unwrap()
            .iter()
            .any(|f| f == "signaling"));
    }
}
