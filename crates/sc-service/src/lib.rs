//! Signal Coordinator (SC) Service Library
//!
//! This library provides the core functionality of the Signal Coordinator,
//! a stateful WebSocket signaling server for WebRTC broadcasting:
//!
//! - Channel/connection registry for publisher and player coordination
//! - Per-account admission control against plan limits
//! - Multi-party rooms layered over the channel registry
//! - Usage aggregation, including supplemental media-server figures
//! - Verbatim relay of offers, answers, and ICE candidates between peers
//! - Key-gated status surface with a STUN/TURN connectivity probe
//!
//! # Architecture
//!
//! All mutable signaling state lives in a single coordinator actor:
//!
//! ```text
//! WebSocket session tasks (one per connection)
//! └── CoordinatorHandle (mpsc)
//!     └── CoordinatorActor (singleton)
//!         ├── ConnectionRegistry (channels and attached records)
//!         ├── RoomDirectory (rooms over counted channel references)
//!         └── UsageLedger (per-account usage and issue tallies)
//! ```
//!
//! Sessions authenticate against the account directory, register an event
//! queue with the coordinator, and from then on every inbound frame becomes
//! one coordinator message. Outcomes travel back through the per-session
//! queue, never through shared state.
//!
//! # Modules
//!
//! - [`accounts`] - Account directory, stores, handshake authentication
//! - [`actors`] - The coordinator actor and its message types
//! - [`admission`] - Plan evaluation for publish and subscribe
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with wire error codes
//! - [`handlers`] - HTTP handlers for the status surface
//! - [`ice`] - ICE configuration and STUN/TURN probing
//! - [`observability`] - Health probes and Prometheus metrics
//! - [`registry`] - Channel/connection registry
//! - [`rooms`] - Room layer over the registry
//! - [`routes`] - Axum router and application state
//! - [`signaling`] - Wire protocol and WebSocket session lifecycle
//! - [`stats`] - Usage aggregation
//! - [`tasks`] - Background tasks (media-server stats poller)

pub mod accounts;
pub mod actors;
pub mod admission;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod ice;
pub mod observability;
pub mod registry;
pub mod rooms;
pub mod routes;
pub mod signaling;
pub mod stats;
pub mod tasks;
