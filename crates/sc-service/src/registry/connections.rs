//! Connection registry: the authoritative channel/participant state.
//!
//! One map of channel name to [`Channel`], each channel owning its attached
//! connection records keyed by peer ID. Records reference the session's
//! outbound event queue; the transport side owns the socket itself.

use crate::registry::channel::{Channel, ChannelStatus, StreamParams};
use crate::signaling::ServerEvent;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Outbound handle for one live connection. Delivery is best-effort: a
/// dropped receiver means the session is gone and the event is discarded.
pub type PeerSender = mpsc::UnboundedSender<ServerEvent>;

/// Participant role within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Player,
    Broadcaster,
}

impl PeerRole {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Player => "player",
            PeerRole::Broadcaster => "broadcaster",
        }
    }
}

/// One attached participant within a channel.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    /// Session identifier of the owning transport connection.
    pub connection_id: Uuid,
    /// Logical peer identity, unique within the channel.
    pub peer_id: String,
    /// player or broadcaster.
    pub role: PeerRole,
    /// Account the connection authenticated under.
    pub account: String,
    /// Outbound event queue of the owning session.
    pub sender: PeerSender,
}

/// Public row describing one attached participant.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    #[serde(rename = "peerID")]
    pub peer_id: String,
    #[serde(rename = "type")]
    pub role: PeerRole,
    pub account: String,
}

impl ConnectionRecord {
    /// Public view of this record, as sent in `peers` messages and the
    /// status surface.
    #[must_use]
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            role: self.role,
            account: self.account.clone(),
        }
    }
}

/// The channel/connection registry.
///
/// Mutations never perform I/O; the owning coordinator serializes access.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    channels: HashMap<String, Channel>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Attach a record under `(channel, peer_id)`, creating the channel
    /// entry when absent.
    ///
    /// Returns `true` when a record already existed and was updated in
    /// place (idempotent re-publish/re-subscribe), `false` for a fresh
    /// attach.
    pub fn attach(
        &mut self,
        channel: &str,
        peer_id: &str,
        role: PeerRole,
        account: &str,
        connection_id: Uuid,
        sender: PeerSender,
    ) -> bool {
        let entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(Channel::new);
        entry.empty_since = None;
        let record = ConnectionRecord {
            connection_id,
            peer_id: peer_id.to_string(),
            role,
            account: account.to_string(),
            sender,
        };
        entry.records.insert(peer_id.to_string(), record).is_some()
    }

    /// Remove the record under `(channel, peer_id)`.
    ///
    /// An emptied channel is kept; the sweep removes it after the grace
    /// window.
    pub fn detach(&mut self, channel: &str, peer_id: &str) -> Option<ConnectionRecord> {
        self.channels
            .get_mut(channel)
            .and_then(|entry| entry.records.remove(peer_id))
    }

    /// Remove every record owned by `connection_id`, across all channels.
    ///
    /// Returns the removed `(channel, record)` pairs. Used by disconnect
    /// teardown, where one session may hold records in several channels.
    pub fn detach_connection(&mut self, connection_id: Uuid) -> Vec<(String, ConnectionRecord)> {
        let mut removed = Vec::new();
        for (name, entry) in &mut self.channels {
            let peer_ids: Vec<String> = entry
                .records
                .iter()
                .filter(|(_, r)| r.connection_id == connection_id)
                .map(|(peer_id, _)| peer_id.clone())
                .collect();
            for peer_id in peer_ids {
                if let Some(record) = entry.records.remove(&peer_id) {
                    removed.push((name.clone(), record));
                }
            }
        }
        removed
    }

    /// Resolve `(channel, peer_id)` to the session's outbound queue.
    #[must_use]
    pub fn resolve(&self, channel: &str, peer_id: &str) -> Option<PeerSender> {
        self.channels
            .get(channel)
            .and_then(|entry| entry.records.get(peer_id))
            .map(|record| record.sender.clone())
    }

    /// Look up the record under `(channel, peer_id)`.
    #[must_use]
    pub fn record(&self, channel: &str, peer_id: &str) -> Option<&ConnectionRecord> {
        self.channels
            .get(channel)
            .and_then(|entry| entry.records.get(peer_id))
    }

    /// Replace a channel's declared footprint, stamping the server-side
    /// timestamp. Creates the channel entry when absent.
    pub fn set_channel_params(&mut self, channel: &str, params: StreamParams, publisher: &str) {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(Channel::new)
            .declare(params, publisher);
    }

    /// Look up a channel.
    #[must_use]
    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    /// Iterate all channels.
    pub fn channels(&self) -> impl Iterator<Item = (&String, &Channel)> {
        self.channels.iter()
    }

    /// Iterate the records attached to `channel`.
    pub fn peers_of(&self, channel: &str) -> impl Iterator<Item = &ConnectionRecord> {
        self.channels
            .get(channel)
            .into_iter()
            .flat_map(|entry| entry.records.values())
    }

    /// Total number of live records across all channels.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.channels.values().map(|entry| entry.records.len()).sum()
    }

    /// Refresh each channel's derived peer count and sweep channels that
    /// have been empty for at least `grace`.
    ///
    /// Returns the names of swept channels.
    pub fn refresh_and_sweep(&mut self, grace: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut swept = Vec::new();

        for (name, entry) in &mut self.channels {
            entry.peers = entry.records.len();
            if entry.records.is_empty() {
                let since = *entry.empty_since.get_or_insert(now);
                if now.duration_since(since) >= grace {
                    swept.push(name.clone());
                }
            } else {
                entry.empty_since = None;
            }
        }

        for name in &swept {
            self.channels.remove(name);
        }
        swept
    }

    /// Channel-table rows for the status surface, sorted by name.
    #[must_use]
    pub fn channel_table(&self) -> Vec<ChannelStatus> {
        let mut rows: Vec<ChannelStatus> = self
            .channels
            .iter()
            .map(|(name, entry)| entry.status(name))
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Connection-table rows grouped by channel, sorted by channel name.
    #[must_use]
    pub fn connection_table(&self) -> Vec<(String, Vec<PeerInfo>)> {
        let mut rows: Vec<(String, Vec<PeerInfo>)> = self
            .channels
            .iter()
            .map(|(name, entry)| {
                let mut peers: Vec<PeerInfo> =
                    entry.records.values().map(ConnectionRecord::info).collect();
                peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
                (name.clone(), peers)
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}
