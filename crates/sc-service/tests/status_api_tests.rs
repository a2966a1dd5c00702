//! End-to-end tests for the HTTP status surface.
//!
//! Covers:
//! - Key gating: 404 when no key is configured, 401 on a bad key
//! - `/connections`, `/channels`, `/usage` views over live signaling state
//! - `/ice` probe reporting and its cache
//! - `POST /accounts/refresh` swapping the directory wholesale
//! - Public endpoints: banner, health probes, Prometheus metrics
//!
//! # Test Setup
//!
//! Most tests spawn a server with a status key and drive real WebSocket
//! clients to populate the registry before reading it back over HTTP. The
//! banner is additionally exercised straight through the router with
//! `tower::ServiceExt::oneshot`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use axum::body::Body;
use axum::http::Request;
use axum::routing::get;
use axum::Router;
use http_body_util::BodyExt;
use sc_test_utils::{account, TestScServer, WsClient, STATIC_STORE_TOKEN};
use serde_json::json;
use tower::util::ServiceExt;

const TOKEN: &str = "tok-a";
const KEY: &str = "sekrit";

fn stream_params() -> serde_json::Value {
    json!({"bitrate": 500, "audioBitrate": 64, "width": 640, "height": 480, "frameRate": 30})
}

async fn spawn_gated() -> Result<TestScServer> {
    TestScServer::spawn_with_status_key(vec![account("acme", TOKEN)], KEY).await
}

/// Publish `peer` into `channel` and drain the roster reply.
async fn broadcaster(server: &TestScServer, peer: &str, channel: &str) -> Result<WsClient> {
    let (mut client, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, peer).await?;
    client
        .send(json!({
            "type": "publish",
            "peerID": peer,
            "channel": channel,
            "params": stream_params(),
        }))
        .await?;
    let frame = client.recv().await?;
    anyhow::ensure!(
        frame["message"]["type"] == "peers",
        "expected roster after publish, got {frame}"
    );
    Ok(client)
}

// ============================================================================
// Key gating
// ============================================================================

#[tokio::test]
async fn test_status_surface_absent_without_key() -> Result<()> {
    let server = TestScServer::spawn(vec![account("acme", TOKEN)]).await?;
    let client = reqwest::Client::new();

    for path in ["/connections", "/channels", "/usage", "/ice"] {
        let response = client
            .get(format!("{}{path}?key=anything", server.url()))
            .send()
            .await?;
        assert_eq!(response.status(), 404, "unconfigured surface must 404 for {path}");
    }

    let response = client
        .post(format!("{}/accounts/refresh?key=anything", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    Ok(())
}

#[tokio::test]
async fn test_status_surface_requires_matching_key() -> Result<()> {
    let server = spawn_gated().await?;
    let client = reqwest::Client::new();

    // Missing key.
    let response = client
        .get(format!("{}/connections", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["error"], "Unauthorized");

    // Wrong key.
    let response = client
        .get(format!("{}/usage?key=wrong", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), 401);

    let response = client
        .post(format!("{}/accounts/refresh?key=wrong", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), 401);

    Ok(())
}

// ============================================================================
// Registry views
// ============================================================================

#[tokio::test]
async fn test_connections_grouped_by_channel() -> Result<()> {
    let server = spawn_gated().await?;
    let mut alice = broadcaster(&server, "alice", "show").await?;

    let (mut bob, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "bob").await?;
    bob.send(json!({"type": "subscribe", "peerID": "bob", "channel": "show"}))
        .await?;
    // The publisher notice confirms the subscriber is in the registry.
    let frame = alice.recv().await?;
    assert_eq!(frame["message"]["peerID"], "bob");

    let body: serde_json::Value = reqwest::Client::new()
        .get(format!("{}/connections?key={KEY}", server.url()))
        .send()
        .await?
        .json()
        .await?;

    assert_eq!(
        body["show"].as_array().map(|peers| peers.len()),
        Some(2),
        "both peers belong to the channel row, got {body}"
    );
    // Rows are sorted by peer ID.
    assert_eq!(body["show"][0]["peerID"], "alice");
    assert_eq!(body["show"][0]["type"], "broadcaster");
    assert_eq!(body["show"][0]["account"], "acme");
    assert_eq!(body["show"][1]["peerID"], "bob");
    assert_eq!(body["show"][1]["type"], "player");

    Ok(())
}

#[tokio::test]
async fn test_channels_table_carries_declared_params() -> Result<()> {
    let server = spawn_gated().await?;
    let _alice = broadcaster(&server, "alice", "show").await?;

    let body: serde_json::Value = reqwest::Client::new()
        .get(format!("{}/channels?key={KEY}", server.url()))
        .send()
        .await?
        .json()
        .await?;

    let show = &body["show"];
    assert_eq!(show["name"], "show");
    assert_eq!(show["bitrate"], 500);
    assert_eq!(show["audioBitrate"], 64);
    assert_eq!(show["width"], 640);
    assert_eq!(show["height"], 480);
    assert_eq!(show["frameRate"], 30);
    assert_eq!(show["publisher"], "alice");
    assert_eq!(show["peers"], 1);
    assert!(show["createdAt"].as_i64().unwrap_or(0) > 0);
    assert!(show["time"].as_i64().is_some());

    Ok(())
}

#[tokio::test]
async fn test_usage_snapshot_and_account_filter() -> Result<()> {
    let server = spawn_gated().await?;
    let _alice = broadcaster(&server, "alice", "show").await?;
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .get(format!("{}/usage?key={KEY}", server.url()))
        .send()
        .await?
        .json()
        .await?;
    let acme = &body["accounts"]["acme"];
    assert_eq!(acme["connections"], 1);
    assert_eq!(acme["bitrate"], 500);
    assert_eq!(acme["audioBitrate"], 64);
    assert_eq!(acme["broadcasters"], 1);
    assert_eq!(acme["players"], 0);
    assert!(body["generatedAt"].as_i64().is_some());

    // Single-account view.
    let body: serde_json::Value = client
        .get(format!("{}/usage?key={KEY}&account=acme", server.url()))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["account"], "acme");
    assert_eq!(body["usage"]["connections"], 1);

    // Unknown accounts read as zero usage rather than an error.
    let body: serde_json::Value = client
        .get(format!("{}/usage?key={KEY}&account=ghost", server.url()))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["usage"]["connections"], 0);

    Ok(())
}

// ============================================================================
// ICE probe
// ============================================================================

#[tokio::test]
async fn test_ice_status_reports_probe_and_caches_it() -> Result<()> {
    let server = spawn_gated().await?;
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .get(format!("{}/ice?key={KEY}", server.url()))
        .send()
        .await?
        .json()
        .await?;

    assert_eq!(body["peerConfig"]["iceServers"][0]["urls"], "stun:127.0.0.1:3478");
    // Nothing listens on the harness STUN port, so the probe must report
    // the server unreachable rather than hang.
    assert_eq!(body["probe"]["stun"], false);
    assert_eq!(body["probe"]["servers"][0]["url"], "stun:127.0.0.1:3478");
    assert_eq!(body["probe"]["servers"][0]["kind"], "stun");
    assert_eq!(body["probe"]["servers"][0]["reachable"], false);
    assert!(body["probe"]["testedAt"].as_i64().is_some());
    assert!(
        body["probe"]["secondsSinceTested"].is_null(),
        "a fresh probe carries no age, got {body}"
    );

    // A second read within the cache window reports the age instead of
    // probing again.
    let body: serde_json::Value = client
        .get(format!("{}/ice?key={KEY}", server.url()))
        .send()
        .await?
        .json()
        .await?;
    assert!(body["probe"]["secondsSinceTested"].as_i64().is_some());

    Ok(())
}

// ============================================================================
// Directory refresh
// ============================================================================

#[tokio::test]
async fn test_accounts_refresh_swaps_directory() -> Result<()> {
    let server = spawn_gated().await?;

    // Seeded token works before the refresh.
    let (_client, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "alice").await?;

    let response = reqwest::Client::new()
        .post(format!("{}/accounts/refresh?key={KEY}", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["accounts"], 1);

    // The swap is wholesale: the seeded token is gone, the store's is live.
    let mut stale = WsClient::connect(&server.ws_url()).await?;
    stale.send(json!({"type": "connect", "token": TOKEN})).await?;
    let refusal = stale.recv().await?;
    assert_eq!(refusal["type"], "error");
    assert_eq!(refusal["message"], "Invalid token");

    let (_client, welcome) =
        WsClient::connect_peer(&server.ws_url(), STATIC_STORE_TOKEN, "bob").await?;
    assert_eq!(welcome["type"], "welcome");

    Ok(())
}

// ============================================================================
// Public endpoints
// ============================================================================

#[tokio::test]
async fn test_public_endpoints_respond() -> Result<()> {
    let server = TestScServer::spawn(vec![account("acme", TOKEN)]).await?;

    let body: serde_json::Value = reqwest::get(format!("{}/", server.url())).await?.json().await?;
    assert_eq!(body["server"], "Signal Coordinator");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert!(body["features"]
        .as_array()
        .unwrap()
        .iter()
        .any(|f| f == "signaling"));

    let response = reqwest::get(format!("{}/health", server.url())).await?;
    assert_eq!(response.status(), 200);
    let response = reqwest::get(format!("{}/ready", server.url())).await?;
    assert_eq!(response.status(), 200);

    Ok(())
}

#[tokio::test]
async fn test_metrics_exposes_handshake_counter() -> Result<()> {
    let server = TestScServer::spawn(vec![account("acme", TOKEN)]).await?;

    // One successful handshake so the counter exists.
    let (_client, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "alice").await?;

    let response = reqwest::get(format!("{}/metrics", server.url())).await?;
    assert_eq!(response.status(), 200);
    let text = response.text().await?;
    assert!(
        text.contains("sc_handshakes_total"),
        "metrics output missing handshake counter: {text}"
    );

    Ok(())
}

#[tokio::test]
async fn test_banner_through_router() -> Result<()> {
    let app = Router::new().route("/", get(sc_service::handlers::banner));

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), 200);

    let bytes = response.into_body().collect().await?.to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes)?;
    assert_eq!(body["server"], "Signal Coordinator");
    assert!(body["features"].as_array().is_some_and(|f| !f.is_empty()));

    Ok(())
}
