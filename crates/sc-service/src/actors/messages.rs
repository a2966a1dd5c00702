//! Message types for the coordinator actor.
//!
//! Signaling operations are fire-and-forget: outcomes reach the client
//! through its session event queue, mirroring the one-way socket protocol.
//! Status queries and registration carry a `respond_to` oneshot.

use crate::accounts::Account;
use crate::registry::{ChannelStatus, PeerInfo, PeerSender, StreamParams};
use crate::stats::{SupplementalUsage, UsageSnapshot};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Aggregate counters reported by the coordinator.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CoordinatorStatus {
    /// Live channel records across all channels.
    pub connections: usize,
    /// Channels currently known to the registry.
    pub channels: usize,
    /// Rooms currently alive.
    pub rooms: usize,
    /// Authenticated sessions.
    pub sessions: usize,
}

/// Messages handled by the coordinator actor.
pub enum CoordinatorMessage {
    /// Register an authenticated session and its outbound event queue.
    Register {
        connection_id: Uuid,
        account: Arc<Account>,
        user: Option<String>,
        ip: IpAddr,
        sender: PeerSender,
        respond_to: oneshot::Sender<()>,
    },

    /// Tear down a session: channel records, room memberships, broadcasts.
    /// Idempotent; the session task fires it exactly once but a racing
    /// duplicate is harmless.
    Disconnect { connection_id: Uuid },

    /// Join a channel as a player.
    Subscribe {
        connection_id: Uuid,
        peer_id: String,
        channel: Option<String>,
    },

    /// Declare a channel's stream as its broadcaster.
    Publish {
        connection_id: Uuid,
        peer_id: String,
        channel: String,
        params: Option<StreamParams>,
    },

    /// Broadcast a signaling payload to the session's current channel.
    ChannelMessage {
        connection_id: Uuid,
        message: serde_json::Value,
    },

    /// Relay a signaling payload to one peer in the session's channel.
    PeerMessage {
        connection_id: Uuid,
        message: serde_json::Value,
    },

    /// Join (and possibly create) a room.
    RoomJoin {
        connection_id: Uuid,
        room: String,
        params: Option<serde_json::Value>,
    },

    /// Leave a room.
    RoomLeave { connection_id: Uuid, room: String },

    /// Publish a stream into a room.
    RoomPublish {
        connection_id: Uuid,
        room: String,
        stream_id: String,
        params: serde_json::Value,
    },

    /// Withdraw an owned stream from a room.
    RoomUnpublish {
        connection_id: Uuid,
        room: String,
        stream_id: String,
    },

    /// Send a chat message to a room.
    RoomMessage {
        connection_id: Uuid,
        room: String,
        message: serde_json::Value,
    },

    /// Aggregate counters.
    GetStatus {
        respond_to: oneshot::Sender<CoordinatorStatus>,
    },

    /// Connection table grouped by channel.
    GetConnections {
        respond_to: oneshot::Sender<Vec<(String, Vec<PeerInfo>)>>,
    },

    /// Channel table with declared params and derived peer counts.
    GetChannels {
        respond_to: oneshot::Sender<Vec<ChannelStatus>>,
    },

    /// Fresh usage snapshot.
    GetUsage {
        respond_to: oneshot::Sender<UsageSnapshot>,
    },

    /// Replace the supplemental media-server usage table.
    SetSupplemental {
        table: HashMap<String, SupplementalUsage>,
    },
}
