//! WebSocket session lifecycle.
//!
//! Each connection runs through three phases: a handshake (the first text
//! frame must be a `connect` carrying credentials), registration with the
//! coordinator, and a pump loop that forwards inbound frames to the
//! coordinator and drains the session's event queue back to the socket.
//! Whatever ends the loop, the coordinator hears exactly one disconnect.

use crate::actors::CoordinatorHandle;
use crate::routes::AppState;
use crate::signaling::protocol::{ClientCommand, ServerEvent};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a fresh connection has to complete the `connect` handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upgrade `GET /ws` into a signaling session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, state, addr.ip()))
}

async fn run_session(socket: WebSocket, state: AppState, ip: IpAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Some(grant) = handshake(&mut ws_tx, &mut ws_rx, &state, ip).await else {
        return;
    };

    let connection_id = Uuid::new_v4();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    if let Err(e) = state
        .coordinator
        .register(connection_id, grant.account, grant.user, ip, event_tx)
        .await
    {
        warn!(
            target: "sc.signaling",
            connection = %connection_id,
            error = %e,
            "Registration failed, dropping connection"
        );
        return;
    }

    let welcome = ServerEvent::Welcome {
        connection: connection_id,
        peer_config: state.ice.as_ref().clone(),
    };
    if ws_tx
        .send(Message::Text(welcome.to_frame()))
        .await
        .is_err()
    {
        finish(&state.coordinator, connection_id).await;
        return;
    }

    info!(
        target: "sc.signaling",
        connection = %connection_id,
        ip = %ip,
        "Session established"
    );

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if ws_tx.send(Message::Text(event.to_frame())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn({
        let coordinator = state.coordinator.clone();
        async move {
            while let Some(Ok(msg)) = ws_rx.next().await {
                match msg {
                    Message::Text(text) => {
                        if !dispatch(&coordinator, connection_id, &text).await {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    finish(&state.coordinator, connection_id).await;
    info!(target: "sc.signaling", connection = %connection_id, "Session closed");
}

/// Read frames until the `connect` handshake succeeds or fails.
///
/// Non-text frames before the handshake are tolerated (browsers ping).
/// A missing, malformed, or non-`connect` first text frame is refused, as
/// is any credential the authenticator rejects.
async fn handshake(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    ws_rx: &mut SplitStream<WebSocket>,
    state: &AppState,
    ip: IpAddr,
) -> Option<crate::accounts::AuthGrant> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

    loop {
        let frame = match timeout_at(deadline, ws_rx.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(_) => return None,
            Err(_) => {
                debug!(target: "sc.signaling", ip = %ip, "Handshake timed out");
                let _ = ws_tx.close().await;
                return None;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => return None,
            _ => continue,
        };

        let Ok(ClientCommand::Connect { token, user, pin }) = ClientCommand::parse(&text)
        else {
            refuse(ws_tx, "Connect operation required").await;
            return None;
        };

        match state
            .authenticator
            .authenticate(ip, &token, user.as_deref(), pin.as_deref())
            .await
        {
            Ok(grant) => return Some(grant),
            Err(e) => {
                debug!(target: "sc.signaling", ip = %ip, error = %e, "Handshake refused");
                refuse(ws_tx, &e.client_message()).await;
                return None;
            }
        }
    }
}

/// Send a refusal frame and close the socket.
async fn refuse(ws_tx: &mut SplitSink<WebSocket, Message>, message: &str) {
    let event = ServerEvent::Error {
        message: message.to_string(),
    };
    let _ = ws_tx.send(Message::Text(event.to_frame())).await;
    let _ = ws_tx.close().await;
}

/// Tell the coordinator the session is gone.
async fn finish(coordinator: &CoordinatorHandle, connection_id: Uuid) {
    if let Err(e) = coordinator.disconnect(connection_id).await {
        warn!(
            target: "sc.signaling",
            connection = %connection_id,
            error = %e,
            "Disconnect not delivered"
        );
    }
}

/// Forward one inbound frame to the coordinator.
///
/// Malformed frames are dropped without ending the session; an explicit
/// `disconnect` or a dead coordinator mailbox ends it. Returns whether
/// the session should continue.
async fn dispatch(coordinator: &CoordinatorHandle, connection_id: Uuid, text: &str) -> bool {
    let command = match ClientCommand::parse(text) {
        Ok(command) => command,
        Err(e) => {
            debug!(
                target: "sc.signaling",
                connection = %connection_id,
                error = %e,
                "Dropping malformed frame"
            );
            return true;
        }
    };

    debug!(
        target: "sc.signaling",
        connection = %connection_id,
        op = command.op(),
        "Frame received"
    );

    let result = match command {
        // The handshake already ran; a repeat carries nothing new.
        ClientCommand::Connect { .. } => {
            debug!(
                target: "sc.signaling",
                connection = %connection_id,
                "Duplicate connect ignored"
            );
            Ok(())
        }
        ClientCommand::Subscribe { peer_id, channel } => {
            coordinator.subscribe(connection_id, peer_id, channel).await
        }
        ClientCommand::Publish {
            peer_id,
            channel,
            params,
        } => {
            coordinator
                .publish(connection_id, peer_id, channel, params)
                .await
        }
        ClientCommand::Message { message } => {
            coordinator.channel_message(connection_id, message).await
        }
        ClientCommand::MessagePeer { message } => {
            coordinator.peer_message(connection_id, message).await
        }
        ClientCommand::RoomJoin { room, params } => {
            coordinator.room_join(connection_id, room, params).await
        }
        ClientCommand::RoomLeave { room } => coordinator.room_leave(connection_id, room).await,
        ClientCommand::RoomPublish {
            room,
            stream_id,
            params,
        } => {
            coordinator
                .room_publish(connection_id, room, stream_id, params)
                .await
        }
        ClientCommand::RoomUnpublish { room, stream_id } => {
            coordinator.room_unpublish(connection_id, room, stream_id).await
        }
        ClientCommand::RoomMessage { room, message } => {
            coordinator.room_message(connection_id, room, message).await
        }
        // Teardown runs when the pump loop ends, same as a socket close.
        ClientCommand::Disconnect => {
            debug!(
                target: "sc.signaling",
                connection = %connection_id,
                "Client requested disconnect"
            );
            return false;
        }
    };

    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(
                target: "sc.signaling",
                connection = %connection_id,
                error = %e,
                "Coordinator unreachable, ending session"
            );
            false
        }
    }
}
