//! Wire protocol for the WebSocket signaling surface.
//!
//! Every frame is a JSON object discriminated by its `type` field. Client
//! frames parse into [`ClientCommand`]; server frames serialize from
//! [`ServerEvent`]. Peer-to-peer signaling payloads (offers, answers,
//! candidates) pass through untyped under the `message` relay events.

use crate::errors::ScError;
use crate::ice::IceConfig;
use crate::registry::StreamParams;
use crate::rooms::RoomSnapshot;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sender tag for server-originated events.
pub const FROM_SERVER: &str = "_server_";

/// Sender tag for channel-originated events (peer lists, uniqueness).
pub const FROM_CHANNEL: &str = "_channel_";

/// Broadcast target tag.
pub const TARGET_ALL: &str = "all";

/// Channel used when a subscribe names none.
pub const DEFAULT_CHANNEL: &str = "VideoWhisper";

/// Frames accepted from clients. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientCommand {
    /// Handshake; must be the first frame on every connection.
    Connect {
        token: String,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        pin: Option<String>,
    },

    /// Join a channel as a player.
    Subscribe {
        #[serde(rename = "peerID")]
        peer_id: String,
        #[serde(default)]
        channel: Option<String>,
    },

    /// Declare a channel's stream as its broadcaster.
    Publish {
        #[serde(rename = "peerID")]
        peer_id: String,
        channel: String,
        #[serde(default)]
        params: Option<StreamParams>,
    },

    /// Broadcast a signaling payload to the current channel.
    Message { message: serde_json::Value },

    /// Relay a signaling payload to one peer (`message.target`).
    MessagePeer { message: serde_json::Value },

    /// Join (and possibly create) a room.
    #[serde(rename_all = "camelCase")]
    RoomJoin {
        room: String,
        #[serde(default)]
        params: Option<serde_json::Value>,
    },

    /// Leave a room.
    RoomLeave { room: String },

    /// Publish a stream into a room.
    #[serde(rename_all = "camelCase")]
    RoomPublish {
        room: String,
        stream_id: String,
        params: serde_json::Value,
    },

    /// Withdraw an owned stream from a room.
    #[serde(rename_all = "camelCase")]
    RoomUnpublish { room: String, stream_id: String },

    /// Send a chat message to a room.
    RoomMessage {
        room: String,
        message: serde_json::Value,
    },

    /// Explicit goodbye; equivalent to closing the socket.
    Disconnect,
}

impl ClientCommand {
    /// Parse one text frame.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Protocol` for anything that is not a known frame.
    pub fn parse(text: &str) -> Result<Self, ScError> {
        serde_json::from_str(text).map_err(|e| ScError::Protocol(format!("malformed frame: {e}")))
    }

    /// Operation name for logs and metrics.
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Subscribe { .. } => "subscribe",
            Self::Publish { .. } => "publish",
            Self::Message { .. } => "message",
            Self::MessagePeer { .. } => "messagePeer",
            Self::RoomJoin { .. } => "roomJoin",
            Self::RoomLeave { .. } => "roomLeave",
            Self::RoomPublish { .. } => "roomPublish",
            Self::RoomUnpublish { .. } => "roomUnpublish",
            Self::RoomMessage { .. } => "roomMessage",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Frames sent to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Handshake acknowledgement with the client's ICE configuration.
    #[serde(rename_all = "camelCase")]
    Welcome {
        connection: Uuid,
        peer_config: IceConfig,
    },

    /// Relayed signaling payload (offers, answers, candidates, peer lists).
    Message { message: serde_json::Value },

    /// Subscribe refusal.
    SubscribeError {
        from: String,
        to: String,
        message: String,
    },

    /// Publish refusal.
    PublishError {
        from: String,
        to: String,
        message: String,
    },

    /// A peer id already held by another live connection.
    UniquenessError {
        from: String,
        to: String,
        message: String,
    },

    /// Registry-level stream teardown notice to the publisher.
    #[serde(rename_all = "camelCase")]
    Unpublish {
        #[serde(rename = "peerID")]
        peer_id: String,
        channel: String,
    },

    /// Room snapshot for a new participant.
    RoomJoin {
        room: String,
        #[serde(flatten)]
        snapshot: RoomSnapshot,
    },

    /// Room state change broadcast, or a direct room error reply.
    RoomUpdate {
        room: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
        #[serde(flatten)]
        data: serde_json::Value,
    },

    /// Session-level refusal, sent before the connection closes.
    Error { message: String },
}

impl ServerEvent {
    #[must_use]
    pub fn subscribe_error(peer_id: &str, message: String) -> Self {
        Self::SubscribeError {
            from: FROM_SERVER.to_string(),
            to: peer_id.to_string(),
            message,
        }
    }

    #[must_use]
    pub fn publish_error(peer_id: &str, message: String) -> Self {
        Self::PublishError {
            from: FROM_SERVER.to_string(),
            to: peer_id.to_string(),
            message,
        }
    }

    #[must_use]
    pub fn uniqueness_error(peer_id: &str, channel: &str) -> Self {
        Self::UniquenessError {
            from: FROM_CHANNEL.to_string(),
            to: peer_id.to_string(),
            message: format!("{peer_id} is already connected to @{channel}."),
        }
    }

    /// Direct error reply on the room surface (unstamped).
    #[must_use]
    pub fn room_error(room: &str, message: String) -> Self {
        Self::RoomUpdate {
            room: room.to_string(),
            timestamp: None,
            data: serde_json::json!({ "error": message }),
        }
    }

    /// Stamped room broadcast carrying one update key.
    #[must_use]
    pub fn room_update(room: &str, timestamp: i64, data: serde_json::Value) -> Self {
        Self::RoomUpdate {
            room: room.to_string(),
            timestamp: Some(timestamp),
            data,
        }
    }

    /// Serialize to one text frame. Infallible shapes only reach this point;
    /// a failure is reported as a protocol error frame.
    #[must_use]
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"encode failed: {e}"}}"#)
        })
    }
}
