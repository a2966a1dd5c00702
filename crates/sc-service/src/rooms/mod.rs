//! Room layer: multi-party grouping on top of raw channels.
//!
//! Rooms add membership, chat history, and stream lifecycle scoped to a
//! named room. The room layer never touches transports or the registry
//! directly: every operation returns an outcome describing the events to
//! deliver and, where a stream teardown crossed the last room reference,
//! which channel the caller must unpublish at the registry level.
//!
//! Channel ownership across rooms is explicit: `channel_refs` maps each
//! channel name to the set of rooms referencing it, and a registry-level
//! unpublish is requested only when that set becomes empty.

use crate::errors::RoomError;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

/// Chat messages kept per room; the oldest message is evicted past this.
pub const MAX_MESSAGE_HISTORY: usize = 100;

/// Most recent messages replayed to a new participant.
pub const JOIN_MESSAGE_COUNT: usize = 10;

/// Stream kind the room layer can delegate to the channel registry.
const STREAM_KIND_WEBRTC: &str = "webrtc";

/// Client-facing participant info.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub name: String,
    pub joined_at: i64,
}

/// Client-facing stream descriptor. `params` carries the publisher's
/// declared parameters verbatim (including its `type`).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub stream_id: String,
    pub user: String,
    pub channel: String,
    pub published_at: i64,
    #[serde(skip)]
    pub owner: Uuid,
    #[serde(flatten)]
    pub params: serde_json::Value,
}

/// One room: membership, streams, bounded chat history.
#[derive(Debug)]
pub struct Room {
    participants: HashMap<Uuid, Participant>,
    streams: HashMap<String, StreamInfo>,
    messages: VecDeque<serde_json::Value>,
    created_at: i64,
    /// Server-side configuration, not exposed to clients.
    params: serde_json::Value,
    /// Client-visible configuration subset, sent with every join snapshot.
    meta: serde_json::Value,
}

impl Room {
    /// Create a room from creation params. `meta` plus the `allowUsers`,
    /// `allowBroadcasters` and `view` keys become client-visible; everything
    /// else stays server-side.
    fn new(mut params: serde_json::Value) -> Self {
        let mut meta = params
            .as_object_mut()
            .and_then(|o| o.remove("meta"))
            .unwrap_or_else(empty_object);
        if let (Some(meta_map), Some(params_map)) = (meta.as_object_mut(), params.as_object()) {
            for key in ["allowUsers", "allowBroadcasters", "view"] {
                if let Some(value) = params_map.get(key) {
                    meta_map.insert(key.to_string(), value.clone());
                }
            }
        }

        Self {
            participants: HashMap::new(),
            streams: HashMap::new(),
            messages: VecDeque::new(),
            created_at: Utc::now().timestamp_millis(),
            params,
            meta,
        }
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    #[must_use]
    pub fn meta(&self) -> &serde_json::Value {
        &self.meta
    }

    #[must_use]
    pub fn server_params(&self) -> &serde_json::Value {
        &self.params
    }

    /// Snapshot delivered to a joining participant.
    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            participants: self
                .participants
                .iter()
                .map(|(id, p)| (id.to_string(), p.clone()))
                .collect(),
            streams: self
                .streams
                .iter()
                .map(|(id, s)| (id.clone(), s.clone()))
                .collect(),
            messages: self
                .messages
                .iter()
                .rev()
                .take(JOIN_MESSAGE_COUNT)
                .rev()
                .cloned()
                .collect(),
            meta: self.meta.clone(),
        }
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Room state visible to a new joiner.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub participants: BTreeMap<String, Participant>,
    pub streams: BTreeMap<String, StreamInfo>,
    pub messages: Vec<serde_json::Value>,
    pub meta: serde_json::Value,
}

/// Result of a join.
#[derive(Debug)]
pub struct JoinOutcome {
    /// True when the join created the room.
    pub created: bool,
    /// Snapshot for the joiner.
    pub snapshot: RoomSnapshot,
    /// The joiner's own participant record, broadcast to the others.
    pub participant: Participant,
    /// Members to notify (everyone but the joiner).
    pub others: Vec<Uuid>,
    /// Channels of streams the joiner should be subscribed to.
    pub subscribe_channels: Vec<String>,
}

/// One stream removed during a leave.
#[derive(Debug)]
pub struct StreamRemoval {
    pub stream_id: String,
    /// Set when this removal dropped the channel's last room reference and
    /// the caller must unpublish it at the registry level.
    pub unpublish_channel: Option<String>,
}

/// Result of a leave (explicit or disconnect-driven).
#[derive(Debug)]
pub struct LeaveOutcome {
    pub participant: Participant,
    pub removed_streams: Vec<StreamRemoval>,
    /// Members remaining after the leave.
    pub remaining: Vec<Uuid>,
    /// True when the room was destroyed because it emptied.
    pub destroyed: bool,
}

/// Result of a committed publish.
#[derive(Debug)]
pub struct PublishOutcome {
    pub stream: StreamInfo,
    /// Full membership to notify.
    pub members: Vec<Uuid>,
}

/// Result of an unpublish.
#[derive(Debug)]
pub struct UnpublishOutcome {
    pub stream_id: String,
    pub unpublish_channel: Option<String>,
    pub members: Vec<Uuid>,
}

/// Result of a chat message.
#[derive(Debug)]
pub struct MessageOutcome {
    /// The stamped message as stored in history.
    pub message: serde_json::Value,
    pub members: Vec<Uuid>,
}

/// All rooms plus the channel ownership table.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: HashMap<String, Room>,
    /// Channel name to the set of rooms currently referencing it.
    channel_refs: HashMap<String, HashSet<String>>,
}

impl RoomDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    #[must_use]
    pub fn room(&self, name: &str) -> Option<&Room> {
        self.rooms.get(name)
    }

    /// Rooms this connection currently participates in.
    #[must_use]
    pub fn rooms_of(&self, conn: Uuid) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|(_, room)| room.participants.contains_key(&conn))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Whether any room still references this channel.
    #[must_use]
    pub fn channel_referenced(&self, channel: &str) -> bool {
        self.channel_refs.contains_key(channel)
    }

    /// Join a room, creating it if absent. Returns `None` when the
    /// connection is already a participant (idempotent, no events).
    pub fn join(
        &mut self,
        name: &str,
        conn: Uuid,
        identity: &str,
        params: Option<serde_json::Value>,
    ) -> Option<JoinOutcome> {
        let created = !self.rooms.contains_key(name);
        let room = self
            .rooms
            .entry(name.to_string())
            .or_insert_with(|| Room::new(params.unwrap_or_else(empty_object)));

        if room.participants.contains_key(&conn) {
            return None;
        }

        let snapshot = room.snapshot();
        let others: Vec<Uuid> = room.participants.keys().copied().collect();
        let subscribe_channels = room
            .streams
            .values()
            .filter(|s| s.owner != conn)
            .map(|s| s.channel.clone())
            .collect();

        let participant = Participant {
            name: identity.to_string(),
            joined_at: Utc::now().timestamp_millis(),
        };
        room.participants.insert(conn, participant.clone());

        debug!(
            target: "sc.rooms",
            room = %name,
            identity = %identity,
            created = created,
            participants = room.participants.len(),
            "Participant joined room"
        );

        Some(JoinOutcome {
            created,
            snapshot,
            participant,
            others,
            subscribe_channels,
        })
    }

    /// Leave a room, tearing down the leaver's streams first.
    ///
    /// # Errors
    ///
    /// Returns `RoomError::NotParticipant` when the room is absent or the
    /// connection is not a member.
    pub fn leave(&mut self, name: &str, conn: Uuid) -> Result<LeaveOutcome, RoomError> {
        let room = self.rooms.get_mut(name).ok_or(RoomError::NotParticipant)?;
        if !room.participants.contains_key(&conn) {
            return Err(RoomError::NotParticipant);
        }

        let owned: Vec<String> = room
            .streams
            .values()
            .filter(|s| s.owner == conn)
            .map(|s| s.stream_id.clone())
            .collect();

        let mut removed_streams = Vec::with_capacity(owned.len());
        for stream_id in owned {
            if let Some(stream) = self.rooms.get_mut(name).and_then(|r| r.streams.remove(&stream_id))
            {
                let unpublish_channel = self.release_channel(name, &stream.channel);
                removed_streams.push(StreamRemoval {
                    stream_id,
                    unpublish_channel,
                });
            }
        }

        // Reborrow: release_channel needed `&mut self` above.
        let room = self.rooms.get_mut(name).ok_or(RoomError::NotParticipant)?;
        let participant = room
            .participants
            .remove(&conn)
            .ok_or(RoomError::NotParticipant)?;
        let remaining: Vec<Uuid> = room.participants.keys().copied().collect();

        let destroyed = room.participants.is_empty();
        if destroyed {
            self.rooms.remove(name);
            debug!(target: "sc.rooms", room = %name, "Removed empty room");
        }

        debug!(
            target: "sc.rooms",
            room = %name,
            identity = %participant.name,
            streams_removed = removed_streams.len(),
            destroyed = destroyed,
            "Participant left room"
        );

        Ok(LeaveOutcome {
            participant,
            removed_streams,
            remaining,
            destroyed,
        })
    }

    /// Validate a publish before the channel-level admission runs.
    ///
    /// # Errors
    ///
    /// `NotParticipant`, `DuplicateStream`, or `InvalidParams` (params must
    /// be an object declaring a `webrtc` type).
    pub fn prepare_publish(
        &self,
        name: &str,
        conn: Uuid,
        stream_id: &str,
        params: &serde_json::Value,
    ) -> Result<(), RoomError> {
        let room = self.rooms.get(name).ok_or(RoomError::NotParticipant)?;
        if !room.participants.contains_key(&conn) {
            return Err(RoomError::NotParticipant);
        }
        if room.streams.contains_key(stream_id) {
            return Err(RoomError::DuplicateStream);
        }
        let kind = params.get("type").and_then(|v| v.as_str());
        if !params.is_object() || kind != Some(STREAM_KIND_WEBRTC) {
            return Err(RoomError::InvalidParams);
        }
        Ok(())
    }

    /// Register a stream after the channel-level publish succeeded. The
    /// channel name is the stream id.
    pub fn commit_publish(
        &mut self,
        name: &str,
        conn: Uuid,
        identity: &str,
        stream_id: &str,
        params: serde_json::Value,
    ) -> Result<PublishOutcome, RoomError> {
        let room = self.rooms.get_mut(name).ok_or(RoomError::NotParticipant)?;
        if !room.participants.contains_key(&conn) {
            return Err(RoomError::NotParticipant);
        }

        let stream = StreamInfo {
            stream_id: stream_id.to_string(),
            user: identity.to_string(),
            channel: stream_id.to_string(),
            published_at: Utc::now().timestamp_millis(),
            owner: conn,
            params,
        };
        room.streams.insert(stream_id.to_string(), stream.clone());
        let members: Vec<Uuid> = room.participants.keys().copied().collect();

        self.channel_refs
            .entry(stream_id.to_string())
            .or_default()
            .insert(name.to_string());

        debug!(
            target: "sc.rooms",
            room = %name,
            stream = %stream_id,
            identity = %identity,
            "Stream published to room"
        );

        Ok(PublishOutcome { stream, members })
    }

    /// Remove a stream the connection owns.
    ///
    /// # Errors
    ///
    /// `NotParticipant` when not a member; `NotOwner` when the stream is
    /// absent or owned by someone else.
    pub fn unpublish(
        &mut self,
        name: &str,
        conn: Uuid,
        stream_id: &str,
    ) -> Result<UnpublishOutcome, RoomError> {
        let room = self.rooms.get_mut(name).ok_or(RoomError::NotParticipant)?;
        if !room.participants.contains_key(&conn) {
            return Err(RoomError::NotParticipant);
        }
        match room.streams.get(stream_id) {
            Some(stream) if stream.owner == conn => {}
            _ => return Err(RoomError::NotOwner),
        }

        let stream = room
            .streams
            .remove(stream_id)
            .ok_or(RoomError::NotOwner)?;
        let members: Vec<Uuid> = room.participants.keys().copied().collect();
        let unpublish_channel = self.release_channel(name, &stream.channel);

        debug!(
            target: "sc.rooms",
            room = %name,
            stream = %stream_id,
            "Stream unpublished from room"
        );

        Ok(UnpublishOutcome {
            stream_id: stream_id.to_string(),
            unpublish_channel,
            members,
        })
    }

    /// Append a chat message, stamping author and timestamp server-side.
    ///
    /// # Errors
    ///
    /// `NotParticipant` when not a member; `InvalidParams` when the message
    /// is not a JSON object.
    pub fn message(
        &mut self,
        name: &str,
        conn: Uuid,
        identity: &str,
        mut message: serde_json::Value,
    ) -> Result<MessageOutcome, RoomError> {
        let room = self.rooms.get_mut(name).ok_or(RoomError::NotParticipant)?;
        if !room.participants.contains_key(&conn) {
            return Err(RoomError::NotParticipant);
        }

        let Some(map) = message.as_object_mut() else {
            return Err(RoomError::InvalidParams);
        };
        map.insert(
            "user".to_string(),
            serde_json::Value::String(identity.to_string()),
        );
        map.insert(
            "timestamp".to_string(),
            serde_json::Value::from(Utc::now().timestamp_millis()),
        );

        room.messages.push_back(message.clone());
        if room.messages.len() > MAX_MESSAGE_HISTORY {
            room.messages.pop_front();
        }

        let members: Vec<Uuid> = room.participants.keys().copied().collect();
        Ok(MessageOutcome { message, members })
    }

    /// Current membership of a room.
    #[must_use]
    pub fn members(&self, name: &str) -> Vec<Uuid> {
        self.rooms
            .get(name)
            .map(|room| room.participants.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Drop one room's reference on a channel. Returns the channel name
    /// when that was the last reference anywhere.
    fn release_channel(&mut self, room: &str, channel: &str) -> Option<String> {
        let Some(refs) = self.channel_refs.get_mut(channel) else {
            warn!(
                target: "sc.rooms",
                room = %room,
                channel = %channel,
                "Channel reference missing during release"
            );
            return None;
        };
        refs.remove(room);
        if refs.is_empty() {
            self.channel_refs.remove(channel);
            Some(channel.to_string())
        } else {
            None
        }
    }
}
