//! `CoordinatorActor` - single writer over the signaling state.
//!
//! The coordinator owns the channel/connection registry, the room
//! directory, and the usage ledger. Every mutation arrives as a message
//! and executes as one non-preemptible step, so admission checks always
//! see a consistent snapshot:
//!
//! - Session lifecycle (register on handshake, teardown on disconnect)
//! - Channel subscribe/publish with plan admission
//! - Peer-to-peer and channel-wide message routing
//! - Room membership, streams, and chat
//! - Usage recompute after each mutation and on the sweep tick
//!
//! Signaling operations are fire-and-forget; their outcomes reach the
//! client through its session event queue. Status queries respond over a
//! oneshot.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::messages::{CoordinatorMessage, CoordinatorStatus};
use crate::accounts::{Account, DirectoryHandle};
use crate::admission::{evaluate_publish, evaluate_subscribe, rejection_message};
use crate::errors::{RoomError, ScError};
use crate::ice::IceConfig;
use crate::observability::metrics;
use crate::registry::{
    ChannelStatus, ConnectionRecord, ConnectionRegistry, PeerInfo, PeerRole, PeerSender,
    StreamParams,
};
use crate::rooms::{LeaveOutcome, RoomDirectory};
use crate::signaling::protocol::{
    ServerEvent, DEFAULT_CHANNEL, FROM_CHANNEL, FROM_SERVER, TARGET_ALL,
};
use crate::stats::{SupplementalUsage, UsageLedger, UsageSnapshot};

/// Default channel buffer size for the coordinator mailbox.
const COORDINATOR_CHANNEL_BUFFER: usize = 1000;

/// Handle to the `CoordinatorActor`.
///
/// Cheap to clone; every session task and HTTP handler holds one.
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
    cancel_token: CancellationToken,
}

impl CoordinatorHandle {
    /// Register an authenticated session. Resolves once the coordinator
    /// has stored the session, so events routed to this connection from
    /// that point on are deliverable.
    pub async fn register(
        &self,
        connection_id: Uuid,
        account: Arc<Account>,
        user: Option<String>,
        ip: IpAddr,
        sender: PeerSender,
    ) -> Result<(), ScError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::Register {
                connection_id,
                account,
                user,
                ip,
                sender,
                respond_to: tx,
            })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))
    }

    /// Tear down one session and everything it holds.
    pub async fn disconnect(&self, connection_id: Uuid) -> Result<(), ScError> {
        self.sender
            .send(CoordinatorMessage::Disconnect { connection_id })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))
    }

    /// Join a channel as a player.
    pub async fn subscribe(
        &self,
        connection_id: Uuid,
        peer_id: String,
        channel: Option<String>,
    ) -> Result<(), ScError> {
        self.sender
            .send(CoordinatorMessage::Subscribe {
                connection_id,
                peer_id,
                channel,
            })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))
    }

    /// Declare a channel's stream as its broadcaster.
    pub async fn publish(
        &self,
        connection_id: Uuid,
        peer_id: String,
        channel: String,
        params: Option<StreamParams>,
    ) -> Result<(), ScError> {
        self.sender
            .send(CoordinatorMessage::Publish {
                connection_id,
                peer_id,
                channel,
                params,
            })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))
    }

    /// Relay a payload to every other peer in the sender's channel.
    pub async fn channel_message(
        &self,
        connection_id: Uuid,
        message: serde_json::Value,
    ) -> Result<(), ScError> {
        self.sender
            .send(CoordinatorMessage::ChannelMessage {
                connection_id,
                message,
            })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))
    }

    /// Relay a payload to the peer named in its `target` field.
    pub async fn peer_message(
        &self,
        connection_id: Uuid,
        message: serde_json::Value,
    ) -> Result<(), ScError> {
        self.sender
            .send(CoordinatorMessage::PeerMessage {
                connection_id,
                message,
            })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))
    }

    /// Join a room, creating it on first join.
    pub async fn room_join(
        &self,
        connection_id: Uuid,
        room: String,
        params: Option<serde_json::Value>,
    ) -> Result<(), ScError> {
        self.sender
            .send(CoordinatorMessage::RoomJoin {
                connection_id,
                room,
                params,
            })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))
    }

    /// Leave a room, tearing down owned streams first.
    pub async fn room_leave(&self, connection_id: Uuid, room: String) -> Result<(), ScError> {
        self.sender
            .send(CoordinatorMessage::RoomLeave {
                connection_id,
                room,
            })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))
    }

    /// Publish a stream into a room.
    pub async fn room_publish(
        &self,
        connection_id: Uuid,
        room: String,
        stream_id: String,
        params: serde_json::Value,
    ) -> Result<(), ScError> {
        self.sender
            .send(CoordinatorMessage::RoomPublish {
                connection_id,
                room,
                stream_id,
                params,
            })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))
    }

    /// Withdraw an owned stream from a room.
    pub async fn room_unpublish(
        &self,
        connection_id: Uuid,
        room: String,
        stream_id: String,
    ) -> Result<(), ScError> {
        self.sender
            .send(CoordinatorMessage::RoomUnpublish {
                connection_id,
                room,
                stream_id,
            })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))
    }

    /// Post a chat message to a room.
    pub async fn room_message(
        &self,
        connection_id: Uuid,
        room: String,
        message: serde_json::Value,
    ) -> Result<(), ScError> {
        self.sender
            .send(CoordinatorMessage::RoomMessage {
                connection_id,
                room,
                message,
            })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))
    }

    /// Aggregate counters for the status surface.
    pub async fn status(&self) -> Result<CoordinatorStatus, ScError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))
    }

    /// Per-channel connection table for the status surface.
    pub async fn connections(&self) -> Result<Vec<(String, Vec<PeerInfo>)>, ScError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::GetConnections { respond_to: tx })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))
    }

    /// Channel table for the status surface.
    pub async fn channels(&self) -> Result<Vec<ChannelStatus>, ScError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::GetChannels { respond_to: tx })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))
    }

    /// Current per-account usage snapshot.
    pub async fn usage(&self) -> Result<UsageSnapshot, ScError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::GetUsage { respond_to: tx })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))
    }

    /// Replace the supplemental usage table pulled from the media server.
    pub async fn set_supplemental(
        &self,
        table: HashMap<String, SupplementalUsage>,
    ) -> Result<(), ScError> {
        self.sender
            .send(CoordinatorMessage::SetSupplemental { table })
            .await
            .map_err(|e| ScError::Internal(format!("channel send failed: {e}")))
    }

    /// Signal the actor to stop.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// One authenticated signaling session.
struct Session {
    /// Outbound event queue, drained by the session's send task.
    sender: PeerSender,
    /// Account resolved during the handshake.
    account: Arc<Account>,
    /// Authenticated username, when the token carried one.
    user: Option<String>,
    /// Peer identity bound by the last subscribe/publish.
    peer_id: Option<String>,
    /// Channel bound by the last subscribe/publish.
    channel: Option<String>,
}

/// The `CoordinatorActor` implementation.
pub struct CoordinatorActor {
    /// Coordinator instance ID.
    sc_id: String,
    /// Message receiver.
    receiver: mpsc::Receiver<CoordinatorMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    /// Account directory, refreshed outside the actor.
    directory: DirectoryHandle,
    /// The `peerConfig` document sent in channel rosters.
    ice: IceConfig,
    /// Channel/connection registry.
    registry: ConnectionRegistry,
    /// Room directory with the channel reference table.
    rooms: RoomDirectory,
    /// Non-derived aggregation state.
    ledger: UsageLedger,
    /// Latest usage snapshot, the one admission reads.
    snapshot: UsageSnapshot,
    /// Live sessions by connection ID.
    sessions: HashMap<Uuid, Session>,
    /// How long an emptied channel survives before the sweep removes it.
    channel_grace: Duration,
    /// Sweep/recompute cadence.
    sweep_interval: Duration,
    /// Messages processed since start.
    messages_processed: u64,
}

impl CoordinatorActor {
    /// Spawn the actor and return a handle plus its join handle.
    #[must_use]
    pub fn spawn(
        sc_id: String,
        directory: DirectoryHandle,
        ice: IceConfig,
        channel_grace: Duration,
        sweep_interval: Duration,
        cancel_token: CancellationToken,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(COORDINATOR_CHANNEL_BUFFER);

        let actor = CoordinatorActor {
            sc_id,
            receiver,
            cancel_token: cancel_token.clone(),
            directory,
            ice,
            registry: ConnectionRegistry::new(),
            rooms: RoomDirectory::new(),
            ledger: UsageLedger::new(),
            snapshot: UsageSnapshot::default(),
            sessions: HashMap::new(),
            channel_grace,
            sweep_interval,
            messages_processed: 0,
        };

        let task = tokio::spawn(actor.run());

        (
            CoordinatorHandle {
                sender,
                cancel_token,
            },
            task,
        )
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sc.actor.coordinator", fields(sc_id = %self.sc_id))]
    async fn run(mut self) {
        info!(
            target: "sc.actor.coordinator",
            sc_id = %self.sc_id,
            "Coordinator started"
        );

        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sc.actor.coordinator",
                        sc_id = %self.sc_id,
                        "Coordinator received cancellation signal"
                    );
                    break;
                }

                _ = sweep.tick() => {
                    self.recompute();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            self.messages_processed += 1;
                        }
                        None => {
                            info!(
                                target: "sc.actor.coordinator",
                                sc_id = %self.sc_id,
                                "Coordinator channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sc.actor.coordinator",
            sc_id = %self.sc_id,
            sessions_remaining = self.sessions.len(),
            messages_processed = self.messages_processed,
            "Coordinator stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::Register {
                connection_id,
                account,
                user,
                ip,
                sender,
                respond_to,
            } => {
                self.handle_register(connection_id, account, user, ip, sender);
                let _ = respond_to.send(());
            }
            CoordinatorMessage::Disconnect { connection_id } => {
                self.handle_disconnect(connection_id);
            }
            CoordinatorMessage::Subscribe {
                connection_id,
                peer_id,
                channel,
            } => {
                let channel = channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_string());
                let _ = self.channel_subscribe(connection_id, &peer_id, &channel).await;
                self.recompute();
            }
            CoordinatorMessage::Publish {
                connection_id,
                peer_id,
                channel,
                params,
            } => {
                if channel.is_empty() {
                    return;
                }
                let _ = self
                    .channel_publish(connection_id, &peer_id, &channel, params)
                    .await;
                self.recompute();
            }
            CoordinatorMessage::ChannelMessage {
                connection_id,
                message,
            } => {
                self.handle_channel_message(connection_id, message);
            }
            CoordinatorMessage::PeerMessage {
                connection_id,
                message,
            } => {
                self.handle_peer_message(connection_id, &message);
            }
            CoordinatorMessage::RoomJoin {
                connection_id,
                room,
                params,
            } => {
                self.handle_room_join(connection_id, &room, params).await;
            }
            CoordinatorMessage::RoomLeave {
                connection_id,
                room,
            } => {
                self.handle_room_leave(connection_id, &room);
            }
            CoordinatorMessage::RoomPublish {
                connection_id,
                room,
                stream_id,
                params,
            } => {
                self.handle_room_publish(connection_id, &room, &stream_id, params)
                    .await;
            }
            CoordinatorMessage::RoomUnpublish {
                connection_id,
                room,
                stream_id,
            } => {
                self.handle_room_unpublish(connection_id, &room, &stream_id);
            }
            CoordinatorMessage::RoomMessage {
                connection_id,
                room,
                message,
            } => {
                self.handle_room_message(connection_id, &room, message);
            }
            CoordinatorMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            CoordinatorMessage::GetConnections { respond_to } => {
                let _ = respond_to.send(self.registry.connection_table());
            }
            CoordinatorMessage::GetChannels { respond_to } => {
                let _ = respond_to.send(self.registry.channel_table());
            }
            CoordinatorMessage::GetUsage { respond_to } => {
                let _ = respond_to.send(self.snapshot.clone());
            }
            CoordinatorMessage::SetSupplemental { table } => {
                self.ledger.set_supplemental(table);
                self.recompute();
            }
        }
    }

    fn handle_register(
        &mut self,
        connection_id: Uuid,
        account: Arc<Account>,
        user: Option<String>,
        ip: IpAddr,
        sender: PeerSender,
    ) {
        debug!(
            target: "sc.actor.coordinator",
            connection = %connection_id,
            account = %account.name,
            user = user.as_deref().unwrap_or("-"),
            ip = %ip,
            "Session registered"
        );
        self.sessions.insert(
            connection_id,
            Session {
                sender,
                account,
                user,
                peer_id: None,
                channel: None,
            },
        );
        metrics::set_sessions_active(self.sessions.len());
    }

    fn handle_disconnect(&mut self, connection_id: Uuid) {
        let Some(session) = self.sessions.remove(&connection_id) else {
            return;
        };
        debug!(
            target: "sc.actor.coordinator",
            connection = %connection_id,
            account = %session.account.name,
            "Session disconnected"
        );
        metrics::set_sessions_active(self.sessions.len());

        // Channel teardown first: remaining peers close their transports.
        for (channel, record) in self.registry.detach_connection(connection_id) {
            let notice = ServerEvent::Message {
                message: json!({
                    "from": record.peer_id,
                    "target": TARGET_ALL,
                    "payload": {
                        "action": "close",
                        "message": "Peer has left the signaling server",
                    },
                }),
            };
            let recipients: Vec<PeerSender> = self
                .registry
                .peers_of(&channel)
                .map(|r| r.sender.clone())
                .collect();
            for recipient in recipients {
                let _ = recipient.send(notice.clone());
            }
        }

        // Room teardown mirrors an explicit leave per joined room.
        for room in self.rooms.rooms_of(connection_id) {
            if let Ok(outcome) = self.rooms.leave(&room, connection_id) {
                self.broadcast_leave(&room, connection_id, &outcome);
            }
        }

        self.recompute();
    }

    /// Registry-level subscribe, shared by the subscribe operation and the
    /// room auto-subscribe. Returns `true` when the peer ends up attached.
    async fn channel_subscribe(
        &mut self,
        connection_id: Uuid,
        peer_id: &str,
        channel: &str,
    ) -> bool {
        let Some(session) = self.sessions.get(&connection_id) else {
            warn!(
                target: "sc.actor.coordinator",
                connection = %connection_id,
                "Subscribe from unknown session"
            );
            return false;
        };
        let sender = session.sender.clone();
        let session_account = Arc::clone(&session.account);
        let user = session.user.clone();

        // An authenticated username pins the peer identity.
        if let Some(user) = user.as_deref() {
            if user != peer_id {
                debug!(
                    target: "sc.actor.coordinator",
                    user,
                    peer_id,
                    "Subscribe identity mismatch"
                );
                let _ = sender.send(ServerEvent::subscribe_error(
                    peer_id,
                    format!(
                        "You can not subscribe with different username than you are \
                         authenticated with: {user} != {peer_id}"
                    ),
                ));
                return false;
            }
        }

        // A record under another live connection keeps the peer ID reserved.
        if let Some(record) = self.registry.record(channel, peer_id) {
            if record.connection_id != connection_id {
                debug!(
                    target: "sc.actor.coordinator",
                    peer_id,
                    channel,
                    "Peer ID already held by another connection"
                );
                let _ = sender.send(ServerEvent::uniqueness_error(peer_id, channel));
                return false;
            }
            // Same connection re-subscribing: refresh the bindings only.
            if let Some(session) = self.sessions.get_mut(&connection_id) {
                session.peer_id = Some(peer_id.to_string());
                session.channel = Some(channel.to_string());
            }
            return true;
        }

        let account = self.plan_account(&session_account).await;

        // Admission applies once a publisher has declared the footprint.
        let declared = self
            .registry
            .channel(channel)
            .filter(|c| c.publisher.is_some())
            .map(|c| c.params);
        if let Some(params) = declared {
            let usage = self.snapshot.account(&account.name);
            let issues = evaluate_subscribe(&account.plan, &usage, &params, None);
            if !issues.is_empty() {
                warn!(
                    target: "sc.actor.coordinator",
                    account = %account.name,
                    channel,
                    issues = ?issues,
                    "Subscribe rejected"
                );
                self.ledger.record_issues(&account.name, &issues);
                metrics::record_admission("subscribe", false);
                for issue in &issues {
                    metrics::record_admission_issue("subscribe", issue.as_str());
                }
                let _ =
                    sender.send(ServerEvent::subscribe_error(peer_id, rejection_message(&issues)));
                return false;
            }
            metrics::record_admission("subscribe", true);
        }

        self.registry.attach(
            channel,
            peer_id,
            PeerRole::Player,
            &account.name,
            connection_id,
            sender,
        );
        if let Some(session) = self.sessions.get_mut(&connection_id) {
            session.peer_id = Some(peer_id.to_string());
            session.channel = Some(channel.to_string());
        }

        // The publisher initiates the offer toward the new peer.
        let publisher = self
            .registry
            .channel(channel)
            .and_then(|c| c.publisher.clone());
        if let Some(publisher) = publisher {
            if let Some(target) = self.registry.resolve(channel, &publisher) {
                let notice = ServerEvent::Message {
                    message: json!({
                        "type": "peer",
                        "from": FROM_SERVER,
                        "target": publisher,
                        "peerID": peer_id,
                    }),
                };
                let delivered = target.send(notice).is_ok();
                metrics::record_message_routed("peer", delivered);
            }
        }

        debug!(
            target: "sc.actor.coordinator",
            connection = %connection_id,
            peer_id,
            channel,
            "Peer subscribed"
        );
        true
    }

    /// Registry-level publish, shared by the publish operation and room
    /// stream publishing. Returns `true` when the broadcaster ends up
    /// attached with the channel declared.
    async fn channel_publish(
        &mut self,
        connection_id: Uuid,
        peer_id: &str,
        channel: &str,
        params: Option<StreamParams>,
    ) -> bool {
        let Some(session) = self.sessions.get(&connection_id) else {
            warn!(
                target: "sc.actor.coordinator",
                connection = %connection_id,
                "Publish from unknown session"
            );
            return false;
        };
        let sender = session.sender.clone();
        let session_account = Arc::clone(&session.account);
        let user = session.user.clone();

        if let Some(user) = user.as_deref() {
            if user != peer_id {
                debug!(
                    target: "sc.actor.coordinator",
                    user,
                    peer_id,
                    "Publish identity mismatch"
                );
                let _ = sender.send(ServerEvent::publish_error(
                    peer_id,
                    format!("Authentication mismatch: {user} != {peer_id}"),
                ));
                return false;
            }
        }

        let held_here = match self.registry.record(channel, peer_id) {
            Some(record) if record.connection_id != connection_id => {
                debug!(
                    target: "sc.actor.coordinator",
                    peer_id,
                    channel,
                    "Peer ID already held by another connection"
                );
                let _ = sender.send(ServerEvent::uniqueness_error(peer_id, channel));
                return false;
            }
            Some(_) => true,
            None => false,
        };

        let account = self.plan_account(&session_account).await;
        let identity = user.as_deref().unwrap_or(peer_id);

        if let Some(proposed) = params.as_ref() {
            // A re-publish replaces the declared footprint, so the prior
            // one comes off the cumulative totals first.
            let prior = self
                .registry
                .channel(channel)
                .filter(|c| c.publisher.as_deref() == Some(peer_id))
                .map(|c| c.params);
            let usage = self.snapshot.account(&account.name);
            let issues = evaluate_publish(
                &account.plan,
                &usage,
                proposed,
                prior.as_ref(),
                channel,
                identity,
                account.name_restriction(),
            );
            if !issues.is_empty() {
                warn!(
                    target: "sc.actor.coordinator",
                    account = %account.name,
                    channel,
                    issues = ?issues,
                    "Publish rejected"
                );
                self.ledger.record_issues(&account.name, &issues);
                metrics::record_admission("publish", false);
                for issue in &issues {
                    metrics::record_admission_issue("publish", issue.as_str());
                }
                let _ =
                    sender.send(ServerEvent::publish_error(peer_id, rejection_message(&issues)));
                // A rejected re-publish tears down the prior attachment.
                if held_here {
                    self.registry.detach(channel, peer_id);
                    if let Some(session) = self.sessions.get_mut(&connection_id) {
                        if session.channel.as_deref() == Some(channel) {
                            session.channel = None;
                        }
                    }
                }
                return false;
            }
            metrics::record_admission("publish", true);
        }

        self.registry.attach(
            channel,
            peer_id,
            PeerRole::Broadcaster,
            &account.name,
            connection_id,
            sender.clone(),
        );
        self.registry
            .set_channel_params(channel, params.unwrap_or_default(), peer_id);
        if let Some(session) = self.sessions.get_mut(&connection_id) {
            session.peer_id = Some(peer_id.to_string());
            session.channel = Some(channel.to_string());
        }

        // Current roster back to the broadcaster, so it can send offers.
        let peers: Vec<PeerInfo> = self
            .registry
            .peers_of(channel)
            .map(ConnectionRecord::info)
            .collect();
        let roster = ServerEvent::Message {
            message: json!({
                "type": "peers",
                "from": FROM_CHANNEL,
                "target": peer_id,
                "peers": peers,
                "peerConfig": self.ice,
            }),
        };
        let _ = sender.send(roster);

        debug!(
            target: "sc.actor.coordinator",
            connection = %connection_id,
            peer_id,
            channel,
            "Publisher attached"
        );
        true
    }

    /// Relay a payload verbatim to every other peer in the sender's channel.
    fn handle_channel_message(&self, connection_id: Uuid, message: serde_json::Value) {
        let Some(session) = self.sessions.get(&connection_id) else {
            return;
        };
        let Some(channel) = session.channel.as_deref() else {
            debug!(
                target: "sc.actor.coordinator",
                connection = %connection_id,
                "Channel message without a channel binding"
            );
            return;
        };

        let recipients: Vec<PeerSender> = self
            .registry
            .peers_of(channel)
            .filter(|record| record.connection_id != connection_id)
            .map(|record| record.sender.clone())
            .collect();
        let delivered = !recipients.is_empty();
        for recipient in recipients {
            let _ = recipient.send(ServerEvent::Message {
                message: message.clone(),
            });
        }
        metrics::record_message_routed("broadcast", delivered);
    }

    /// Relay a payload verbatim to the peer named in its `target` field.
    /// Unresolvable targets are logged and dropped, never bounced.
    fn handle_peer_message(&self, connection_id: Uuid, message: &serde_json::Value) {
        let Some(session) = self.sessions.get(&connection_id) else {
            return;
        };
        let Some(channel) = session.channel.as_deref() else {
            debug!(
                target: "sc.actor.coordinator",
                connection = %connection_id,
                "Peer message without a channel binding"
            );
            return;
        };
        let Some(target) = message.get("target").and_then(|v| v.as_str()) else {
            debug!(
                target: "sc.actor.coordinator",
                connection = %connection_id,
                channel,
                "Peer message without a target"
            );
            return;
        };

        match self.registry.resolve(channel, target) {
            Some(peer) => {
                let delivered = peer
                    .send(ServerEvent::Message {
                        message: message.clone(),
                    })
                    .is_ok();
                metrics::record_message_routed("peer", delivered);
            }
            None => {
                debug!(
                    target: "sc.actor.coordinator",
                    peer = target,
                    channel,
                    "Target not found in channel"
                );
                metrics::record_message_routed("peer", false);
            }
        }
    }

    async fn handle_room_join(
        &mut self,
        connection_id: Uuid,
        room: &str,
        params: Option<serde_json::Value>,
    ) {
        let Some(session) = self.sessions.get(&connection_id) else {
            return;
        };
        let sender = session.sender.clone();
        let Some(identity) = Self::room_identity(session) else {
            let _ = sender.send(ServerEvent::room_error(
                room,
                "Authentication required for rooms".to_string(),
            ));
            return;
        };

        let Some(outcome) = self.rooms.join(room, connection_id, &identity, params) else {
            debug!(
                target: "sc.actor.coordinator",
                connection = %connection_id,
                room,
                "Duplicate room join ignored"
            );
            return;
        };

        let _ = sender.send(ServerEvent::RoomJoin {
            room: room.to_string(),
            snapshot: outcome.snapshot,
        });

        let update = ServerEvent::room_update(
            room,
            Utc::now().timestamp_millis(),
            json!({ "participantJoin": outcome.participant }),
        );
        self.send_to_members(&outcome.others, &update);

        // Subscribe the joiner to every pre-existing stream's channel so
        // the publishers send it offers.
        for channel in outcome.subscribe_channels {
            let _ = self.channel_subscribe(connection_id, &identity, &channel).await;
        }

        self.recompute();
    }

    fn handle_room_leave(&mut self, connection_id: Uuid, room: &str) {
        let Some(session) = self.sessions.get(&connection_id) else {
            return;
        };
        let sender = session.sender.clone();

        match self.rooms.leave(room, connection_id) {
            Ok(outcome) => {
                self.broadcast_leave(room, connection_id, &outcome);
                self.recompute();
            }
            Err(e) => {
                let _ = sender.send(ServerEvent::room_error(room, room_client_text(&e)));
            }
        }
    }

    async fn handle_room_publish(
        &mut self,
        connection_id: Uuid,
        room: &str,
        stream_id: &str,
        params: serde_json::Value,
    ) {
        let Some(session) = self.sessions.get(&connection_id) else {
            return;
        };
        let sender = session.sender.clone();
        let Some(identity) = Self::room_identity(session) else {
            let _ = sender.send(ServerEvent::room_error(
                room,
                "Authentication required for rooms".to_string(),
            ));
            return;
        };

        if let Err(e) = self.rooms.prepare_publish(room, connection_id, stream_id, &params) {
            let _ = sender.send(ServerEvent::room_error(room, room_client_text(&e)));
            return;
        }

        let stream_params: StreamParams = match serde_json::from_value(params.clone()) {
            Ok(parsed) => parsed,
            Err(_) => {
                let _ = sender.send(ServerEvent::room_error(
                    room,
                    room_client_text(&RoomError::InvalidParams),
                ));
                return;
            }
        };

        // The stream ID doubles as the channel name; admission runs on the
        // regular channel publish path.
        if !self
            .channel_publish(connection_id, &identity, stream_id, Some(stream_params))
            .await
        {
            self.recompute();
            return;
        }

        match self
            .rooms
            .commit_publish(room, connection_id, &identity, stream_id, params)
        {
            Ok(outcome) => {
                let update = ServerEvent::room_update(
                    room,
                    Utc::now().timestamp_millis(),
                    json!({ "streamNew": outcome.stream }),
                );
                self.send_to_members(&outcome.members, &update);
            }
            Err(e) => {
                // Unreachable after a clean prepare; back out the attach.
                self.registry_unpublish(stream_id);
                let _ = sender.send(ServerEvent::room_error(room, room_client_text(&e)));
            }
        }

        self.recompute();
    }

    fn handle_room_unpublish(&mut self, connection_id: Uuid, room: &str, stream_id: &str) {
        let Some(session) = self.sessions.get(&connection_id) else {
            return;
        };
        let sender = session.sender.clone();

        match self.rooms.unpublish(room, connection_id, stream_id) {
            Ok(outcome) => {
                let update = ServerEvent::room_update(
                    room,
                    Utc::now().timestamp_millis(),
                    json!({ "streamRemove": outcome.stream_id }),
                );
                self.send_to_members(&outcome.members, &update);
                if let Some(channel) = &outcome.unpublish_channel {
                    self.registry_unpublish(channel);
                }
                self.recompute();
            }
            Err(e) => {
                let _ = sender.send(ServerEvent::room_error(room, room_client_text(&e)));
            }
        }
    }

    fn handle_room_message(&mut self, connection_id: Uuid, room: &str, message: serde_json::Value) {
        let Some(session) = self.sessions.get(&connection_id) else {
            return;
        };
        let sender = session.sender.clone();
        let Some(identity) = Self::room_identity(session) else {
            let _ = sender.send(ServerEvent::room_error(
                room,
                "Authentication required for rooms".to_string(),
            ));
            return;
        };

        match self.rooms.message(room, connection_id, &identity, message) {
            Ok(outcome) => {
                let update = ServerEvent::room_update(
                    room,
                    Utc::now().timestamp_millis(),
                    json!({ "messageNew": outcome.message }),
                );
                self.send_to_members(&outcome.members, &update);
            }
            Err(e) => {
                let _ = sender.send(ServerEvent::room_error(room, room_client_text(&e)));
            }
        }
    }

    /// Stream teardown broadcasts reach the leaver too; `participantLeft`
    /// goes to the remaining members only.
    fn broadcast_leave(&mut self, room: &str, leaver: Uuid, outcome: &LeaveOutcome) {
        let now = Utc::now().timestamp_millis();

        let mut audience = outcome.remaining.clone();
        audience.push(leaver);
        for removal in &outcome.removed_streams {
            let update = ServerEvent::room_update(
                room,
                now,
                json!({ "streamRemove": removal.stream_id }),
            );
            self.send_to_members(&audience, &update);
            if let Some(channel) = &removal.unpublish_channel {
                self.registry_unpublish(channel);
            }
        }

        let update = ServerEvent::room_update(
            room,
            now,
            json!({ "participantLeft": outcome.participant }),
        );
        self.send_to_members(&outcome.remaining, &update);

        if outcome.destroyed {
            debug!(target: "sc.actor.coordinator", room, "Room destroyed");
        }
    }

    /// Detach a channel's publisher record and notify the owner. Called
    /// when the last room reference on the channel drops; the emptied
    /// channel itself falls to the sweep.
    fn registry_unpublish(&mut self, channel: &str) {
        let Some(publisher) = self
            .registry
            .channel(channel)
            .and_then(|c| c.publisher.clone())
        else {
            return;
        };
        if let Some(record) = self.registry.detach(channel, &publisher) {
            debug!(
                target: "sc.actor.coordinator",
                channel,
                publisher = %record.peer_id,
                "Channel unpublished"
            );
            let _ = record.sender.send(ServerEvent::Unpublish {
                peer_id: record.peer_id.clone(),
                channel: channel.to_string(),
            });
        }
    }

    /// Deliver one event to each listed member with a live session.
    fn send_to_members(&self, members: &[Uuid], event: &ServerEvent) {
        let mut delivered = false;
        for conn in members {
            if let Some(session) = self.sessions.get(conn) {
                if session.sender.send(event.clone()).is_ok() {
                    delivered = true;
                }
            }
        }
        metrics::record_message_routed("room", delivered);
    }

    /// Re-resolve the account so admission sees refreshed plan limits;
    /// falls back to the handshake-time account if it has vanished.
    async fn plan_account(&self, session_account: &Arc<Account>) -> Arc<Account> {
        self.directory
            .snapshot()
            .await
            .by_name(&session_account.name)
            .unwrap_or_else(|| Arc::clone(session_account))
    }

    /// Room identity: the authenticated username, else the bound peer ID.
    fn room_identity(session: &Session) -> Option<String> {
        session.user.clone().or_else(|| session.peer_id.clone())
    }

    fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            connections: self.registry.connection_count(),
            channels: self.registry.channels().count(),
            rooms: self.rooms.len(),
            sessions: self.sessions.len(),
        }
    }

    /// Recompute the usage snapshot and refresh the registry gauges.
    fn recompute(&mut self) {
        let started = Instant::now();
        self.snapshot = self.ledger.recompute(&mut self.registry, self.channel_grace);
        metrics::record_recompute(started.elapsed());
        metrics::set_registry_gauges(
            self.registry.connection_count(),
            self.registry.channels().count(),
            self.rooms.len(),
        );
    }
}

/// Client-facing text for room errors, carried in `roomUpdate` error
/// replies.
fn room_client_text(err: &RoomError) -> String {
    match err {
        RoomError::NotParticipant => "You are not a participant in this room".to_string(),
        RoomError::DuplicateStream => "Stream already published in this room".to_string(),
        RoomError::InvalidParams => "Invalid stream parameters".to_string(),
        RoomError::NotOwner => "You do not own this stream".to_string(),
    }
}
