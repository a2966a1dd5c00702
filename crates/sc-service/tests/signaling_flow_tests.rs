//! End-to-end signaling flow tests over real WebSocket connections.
//!
//! Covers:
//! - The connect handshake: welcome frame, refusals, socket closure
//! - Publish and subscribe against the channel registry
//! - Identity pinning for externally verified logins
//! - Peer ID uniqueness across connections
//! - Verbatim broadcast and peer-to-peer relay
//! - Plan admission refusals on both publish and subscribe
//! - Disconnect teardown notices
//!
//! # Test Setup
//!
//! Each test spawns its own server on a random port via `TestScServer` and
//! drives the wire protocol through `WsClient` exactly as a browser peer
//! would. The login verification tests mock the account's `loginUrl` with
//! wiremock.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use sc_service::accounts::Plan;
use sc_service::admission::IssueCode;
use sc_test_utils::{account, account_with_plan, account_with_properties, TestScServer, WsClient};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "tok-a";

/// Window in which an unwanted frame would have shown up.
const QUIET: Duration = Duration::from_millis(300);

fn stream_params() -> serde_json::Value {
    json!({"bitrate": 500, "audioBitrate": 64, "width": 640, "height": 480, "frameRate": 30})
}

async fn spawn_basic() -> Result<TestScServer> {
    TestScServer::spawn(vec![account("acme", TOKEN)]).await
}

/// Connect a client and publish `channel`, draining the roster reply.
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
// Handshake
// ============================================================================

#[tokio::test]
async fn test_welcome_carries_connection_id_and_ice_config() -> Result<()> {
    let server = spawn_basic().await?;

    let (_client, welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "alice").await?;

    let connection = welcome["connection"].as_str().expect("connection id");
    assert!(
        uuid::Uuid::parse_str(connection).is_ok(),
        "connection must be a UUID, got {connection}"
    );
    assert_eq!(
        welcome["peerConfig"]["iceServers"][0]["urls"],
        "stun:127.0.0.1:3478"
    );
    Ok(())
}

#[tokio::test]
async fn test_first_frame_must_be_connect() -> Result<()> {
    let server = spawn_basic().await?;

    // A well-formed frame of the wrong type is refused.
    let mut client = WsClient::connect(&server.ws_url()).await?;
    client
        .send(json!({"type": "subscribe", "peerID": "alice"}))
        .await?;
    let refusal = client.recv().await?;
    assert_eq!(refusal["type"], "error");
    assert_eq!(refusal["message"], "Connect operation required");
    client.expect_closed().await?;

    // So is a frame that does not parse at all.
    let mut client = WsClient::connect(&server.ws_url()).await?;
    client.send(json!({"hello": "world"})).await?;
    let refusal = client.recv().await?;
    assert_eq!(refusal["message"], "Connect operation required");
    client.expect_closed().await?;

    Ok(())
}

#[tokio::test]
async fn test_unknown_token_is_refused() -> Result<()> {
    let server = spawn_basic().await?;

    let mut client = WsClient::connect(&server.ws_url()).await?;
    client
        .send(json!({"type": "connect", "token": "tok-wrong"}))
        .await?;
    let refusal = client.recv().await?;
    assert_eq!(refusal["type"], "error");
    assert_eq!(refusal["message"], "Invalid token");
    client.expect_closed().await?;

    Ok(())
}

#[tokio::test]
async fn test_suspended_account_is_refused() -> Result<()> {
    let server = TestScServer::spawn(vec![account_with_properties(
        "acme",
        TOKEN,
        json!({"suspended": true}),
    )])
    .await?;

    let mut client = WsClient::connect(&server.ws_url()).await?;
    client.send(json!({"type": "connect", "token": TOKEN})).await?;
    let refusal = client.recv().await?;
    assert_eq!(refusal["message"], "Account suspended");
    client.expect_closed().await?;

    Ok(())
}

// ============================================================================
// Publish and subscribe
// ============================================================================

#[tokio::test]
async fn test_publish_answers_with_roster_including_self() -> Result<()> {
    let server = spawn_basic().await?;
    let (mut alice, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "alice").await?;

    alice
        .send(json!({
            "type": "publish",
            "peerID": "alice",
            "channel": "show",
            "params": stream_params(),
        }))
        .await?;

    let frame = alice.recv().await?;
    assert_eq!(frame["type"], "message");
    let roster = &frame["message"];
    assert_eq!(roster["type"], "peers");
    assert_eq!(roster["from"], "_channel_");
    assert_eq!(roster["target"], "alice");
    assert_eq!(
        roster["peers"].as_array().map(|peers| peers.len()),
        Some(1),
        "roster must list the broadcaster itself"
    );
    assert_eq!(roster["peers"][0]["peerID"], "alice");
    assert_eq!(roster["peers"][0]["type"], "broadcaster");
    assert_eq!(roster["peers"][0]["account"], "acme");
    assert_eq!(
        roster["peerConfig"]["iceServers"][0]["urls"],
        "stun:127.0.0.1:3478"
    );

    Ok(())
}

#[tokio::test]
async fn test_subscribe_notifies_publisher_not_subscriber() -> Result<()> {
    let server = spawn_basic().await?;
    let mut alice = broadcaster(&server, "alice", "show").await?;

    let (mut bob, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "bob").await?;
    bob.send(json!({"type": "subscribe", "peerID": "bob", "channel": "show"}))
        .await?;

    // The publisher initiates the offer, so it hears about the new peer.
    let frame = alice.recv().await?;
    assert_eq!(frame["message"]["type"], "peer");
    assert_eq!(frame["message"]["from"], "_server_");
    assert_eq!(frame["message"]["target"], "alice");
    assert_eq!(frame["message"]["peerID"], "bob");

    // The subscriber gets no acknowledgment.
    bob.expect_silence(QUIET).await?;

    Ok(())
}

#[tokio::test]
async fn test_subscribe_without_channel_uses_default() -> Result<()> {
    let server = spawn_basic().await?;
    let mut alice = broadcaster(&server, "alice", "VideoWhisper").await?;

    let (mut bob, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "bob").await?;
    bob.send(json!({"type": "subscribe", "peerID": "bob"})).await?;

    let frame = alice.recv().await?;
    assert_eq!(frame["message"]["peerID"], "bob");

    Ok(())
}

#[tokio::test]
async fn test_repeat_subscribe_is_idempotent() -> Result<()> {
    let server = spawn_basic().await?;
    let mut alice = broadcaster(&server, "alice", "show").await?;

    let (mut bob, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "bob").await?;
    bob.send(json!({"type": "subscribe", "peerID": "bob", "channel": "show"}))
        .await?;
    bob.send(json!({"type": "subscribe", "peerID": "bob", "channel": "show"}))
        .await?;

    // Exactly one notification; the repeat only refreshes bindings.
    let frame = alice.recv().await?;
    assert_eq!(frame["message"]["peerID"], "bob");
    alice.expect_silence(QUIET).await?;

    Ok(())
}

// ============================================================================
// Identity pinning
// ============================================================================

#[tokio::test]
async fn test_verified_login_pins_peer_identity() -> Result<()> {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"login": true})))
        .mount(&mock_server)
        .await;

    let login_url = format!("{}/login", mock_server.uri());
    let server = TestScServer::spawn(vec![account_with_properties(
        "acme",
        TOKEN,
        json!({"loginUrl": login_url}),
    )])
    .await?;

    let (mut alice, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "alice").await?;

    // A subscribe under a foreign peer ID is refused.
    alice
        .send(json!({"type": "subscribe", "peerID": "bob", "channel": "show"}))
        .await?;
    let refusal = alice.recv().await?;
    assert_eq!(refusal["type"], "subscribeError");
    assert_eq!(refusal["from"], "_server_");
    assert_eq!(refusal["to"], "bob");
    assert_eq!(
        refusal["message"],
        "You can not subscribe with different username than you are authenticated with: alice != bob"
    );

    // So is a publish.
    alice
        .send(json!({
            "type": "publish",
            "peerID": "bob",
            "channel": "show",
            "params": stream_params(),
        }))
        .await?;
    let refusal = alice.recv().await?;
    assert_eq!(refusal["type"], "publishError");
    assert_eq!(refusal["message"], "Authentication mismatch: alice != bob");

    // The authenticated name itself passes and the session keeps working.
    alice
        .send(json!({
            "type": "publish",
            "peerID": "alice",
            "channel": "show",
            "params": stream_params(),
        }))
        .await?;
    let frame = alice.recv().await?;
    assert_eq!(frame["message"]["type"], "peers");

    Ok(())
}

// ============================================================================
// Peer ID uniqueness
// ============================================================================

#[tokio::test]
async fn test_peer_id_collision_across_connections() -> Result<()> {
    let server = spawn_basic().await?;
    let _alice = broadcaster(&server, "alice", "show").await?;

    let (mut intruder, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "alice").await?;

    intruder
        .send(json!({"type": "subscribe", "peerID": "alice", "channel": "show"}))
        .await?;
    let refusal = intruder.recv().await?;
    assert_eq!(refusal["type"], "uniquenessError");
    assert_eq!(refusal["from"], "_channel_");
    assert_eq!(refusal["to"], "alice");
    assert_eq!(refusal["message"], "alice is already connected to @show.");

    intruder
        .send(json!({
            "type": "publish",
            "peerID": "alice",
            "channel": "show",
            "params": stream_params(),
        }))
        .await?;
    let refusal = intruder.recv().await?;
    assert_eq!(refusal["type"], "uniquenessError");
    assert_eq!(refusal["message"], "alice is already connected to @show.");

    Ok(())
}

#[tokio::test]
async fn test_peer_id_released_after_disconnect() -> Result<()> {
    let server = spawn_basic().await?;

    let first = broadcaster(&server, "alice", "show").await?;
    first.close().await;

    // Disconnect handling is asynchronous; wait for the registry to drop
    // the record before reclaiming the peer ID.
    let mut released = false;
    for _ in 0..50 {
        if server.coordinator().status().await?.connections == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "registry must release the peer ID after disconnect");

    let mut second = broadcaster(&server, "alice", "show").await?;
    second.expect_silence(QUIET).await?;

    Ok(())
}

// ============================================================================
// Message relay
// ============================================================================

#[tokio::test]
async fn test_channel_broadcast_excludes_sender_and_other_channels() -> Result<()> {
    let server = spawn_basic().await?;
    let mut alice = broadcaster(&server, "alice", "show").await?;

    let (mut bob, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "bob").await?;
    bob.send(json!({"type": "subscribe", "peerID": "bob", "channel": "show"}))
        .await?;
    let frame = alice.recv().await?;
    assert_eq!(frame["message"]["peerID"], "bob");

    let (mut carol, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "carol").await?;
    carol
        .send(json!({"type": "subscribe", "peerID": "carol", "channel": "aside"}))
        .await?;

    bob.send(json!({
        "type": "message",
        "message": {"kind": "offer", "sdp": "v=0 demo", "nested": {"n": 1}},
    }))
    .await?;

    // The payload reaches the other channel member verbatim.
    let frame = alice.recv().await?;
    assert_eq!(frame["type"], "message");
    assert_eq!(
        frame["message"],
        json!({"kind": "offer", "sdp": "v=0 demo", "nested": {"n": 1}})
    );

    // Never the sender, never another channel.
    bob.expect_silence(QUIET).await?;
    carol.expect_silence(QUIET).await?;

    Ok(())
}

#[tokio::test]
async fn test_peer_message_relays_to_target_only() -> Result<()> {
    let server = spawn_basic().await?;
    let mut alice = broadcaster(&server, "alice", "show").await?;

    let (mut bob, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "bob").await?;
    bob.send(json!({"type": "subscribe", "peerID": "bob", "channel": "show"}))
        .await?;
    let frame = alice.recv().await?;
    assert_eq!(frame["message"]["peerID"], "bob");

    alice
        .send(json!({
            "type": "messagePeer",
            "message": {"target": "bob", "sdp": "answer-sdp", "seq": 7},
        }))
        .await?;

    let frame = bob.recv().await?;
    assert_eq!(
        frame["message"],
        json!({"target": "bob", "sdp": "answer-sdp", "seq": 7})
    );

    // An unresolvable target is dropped, never bounced.
    alice
        .send(json!({
            "type": "messagePeer",
            "message": {"target": "ghost", "sdp": "lost"},
        }))
        .await?;
    alice.expect_silence(QUIET).await?;
    bob.expect_silence(QUIET).await?;

    Ok(())
}

#[tokio::test]
async fn test_message_without_channel_binding_is_dropped() -> Result<()> {
    let server = spawn_basic().await?;
    let mut alice = broadcaster(&server, "alice", "show").await?;

    // A connected but unsubscribed session has no channel to broadcast to.
    let (mut drifter, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "drifter").await?;
    drifter
        .send(json!({"type": "message", "message": {"kind": "offer"}}))
        .await?;

    alice.expect_silence(QUIET).await?;
    drifter.expect_silence(QUIET).await?;

    Ok(())
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_publish_over_plan_bitrate_is_refused() -> Result<()> {
    let server = TestScServer::spawn(vec![account_with_plan(
        "acme",
        TOKEN,
        Plan {
            bitrate: Some(300),
            ..Plan::default()
        },
    )])
    .await?;

    let (mut alice, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "alice").await?;
    alice
        .send(json!({
            "type": "publish",
            "peerID": "alice",
            "channel": "show",
            "params": stream_params(),
        }))
        .await?;

    let refusal = alice.recv().await?;
    assert_eq!(refusal["type"], "publishError");
    assert_eq!(refusal["from"], "_server_");
    assert_eq!(refusal["to"], "alice");
    assert_eq!(refusal["message"], "Unfit: bitrate.");

    // The rejection is tallied against the account and nothing attached.
    let usage = server.coordinator().usage().await?;
    let acme = usage.account("acme");
    assert_eq!(acme.issues.get(&IssueCode::Bitrate), Some(&1));
    assert_eq!(acme.connections, 0);

    Ok(())
}

#[tokio::test]
async fn test_subscribe_over_connection_limit_is_refused() -> Result<()> {
    let server = TestScServer::spawn(vec![account_with_plan(
        "acme",
        TOKEN,
        Plan {
            max_connections: Some(1),
            ..Plan::default()
        },
    )])
    .await?;

    // The broadcaster takes the account's only connection slot.
    let mut alice = broadcaster(&server, "alice", "show").await?;

    let (mut bob, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "bob").await?;
    bob.send(json!({"type": "subscribe", "peerID": "bob", "channel": "show"}))
        .await?;

    let refusal = bob.recv().await?;
    assert_eq!(refusal["type"], "subscribeError");
    assert_eq!(refusal["to"], "bob");
    assert_eq!(refusal["message"], "Unfit: connections.");

    // The publisher never hears about the refused peer.
    alice.expect_silence(QUIET).await?;

    Ok(())
}

// ============================================================================
// Disconnect teardown
// ============================================================================

#[tokio::test]
async fn test_disconnect_broadcasts_close_notice() -> Result<()> {
    let server = spawn_basic().await?;
    let mut alice = broadcaster(&server, "alice", "show").await?;

    let (mut bob, _welcome) = WsClient::connect_peer(&server.ws_url(), TOKEN, "bob").await?;
    bob.send(json!({"type": "subscribe", "peerID": "bob", "channel": "show"}))
        .await?;
    let frame = alice.recv().await?;
    assert_eq!(frame["message"]["peerID"], "bob");

    alice.close().await;

    let frame = bob.recv_until("message").await?;
    assert_eq!(frame["message"]["from"], "alice");
    assert_eq!(frame["message"]["target"], "all");
    assert_eq!(frame["message"]["payload"]["action"], "close");
    assert_eq!(
        frame["message"]["payload"]["message"],
        "Peer has left the signaling server"
    );

    Ok(())
}
