//! # SC Test Utilities
//!
//! Shared test utilities for the Signal Coordinator (SC) service.
//!
//! This crate provides:
//! - Account fixtures (`account`, `account_with_plan`, `account_with_properties`)
//! - Server test harness (`TestScServer` for E2E tests)
//! - WebSocket test client (`WsClient` for driving signaling flows)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> anyhow::Result<()> {
//!     let server = TestScServer::spawn(vec![account("acme", "tok-a")]).await?;
//!
//!     let (mut alice, _welcome) =
//!         WsClient::connect_peer(&server.ws_url(), "tok-a", "alice").await?;
//!     alice
//!         .send(serde_json::json!({"type": "publish", "peerID": "alice", "channel": "alice"}))
//!         .await?;
//!     let roster = alice.recv().await?;
//!     assert_eq!(roster["message"]["type"], "peers");
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod server_harness;
pub mod ws_client;

// Re-export commonly used items
pub use fixtures::*;
pub use server_harness::*;
pub use ws_client::*;
