//! WebSocket test client for driving signaling flows.

use anyhow::{anyhow, bail};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Wait ceiling for a single expected frame.
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Frames `recv_until` will skip before giving up.
const MAX_SKIPPED_FRAMES: usize = 25;

/// One WebSocket signaling client.
///
/// Every receive is bounded by [`RECV_TIMEOUT`] so a missing frame fails the
/// test instead of hanging it.
pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    /// Connect the socket without handshaking.
    pub async fn connect(ws_url: &str) -> Result<Self, anyhow::Error> {
        let (stream, _response) = connect_async(ws_url).await?;
        Ok(Self { stream })
    }

    /// Connect and run the `connect` handshake, returning the welcome frame.
    pub async fn connect_peer(
        ws_url: &str,
        token: &str,
        user: &str,
    ) -> Result<(Self, serde_json::Value), anyhow::Error> {
        let mut client = Self::connect(ws_url).await?;
        client
            .send(json!({"type": "connect", "token": token, "user": user}))
            .await?;
        let welcome = client.recv().await?;
        if welcome["type"] != "welcome" {
            bail!("handshake refused: {welcome}");
        }
        Ok((client, welcome))
    }

    /// Send one JSON frame.
    pub async fn send(&mut self, frame: serde_json::Value) -> Result<(), anyhow::Error> {
        self.stream.send(Message::Text(frame.to_string())).await?;
        Ok(())
    }

    /// Receive the next text frame as JSON.
    pub async fn recv(&mut self) -> Result<serde_json::Value, anyhow::Error> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                bail!("timed out waiting for a frame");
            }
            match tokio::time::timeout(remaining, self.stream.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| anyhow!("unparseable frame {text}: {e}"));
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => bail!("connection closed"),
                Ok(Some(Ok(_))) => {} // Ignore ping/pong
                Ok(Some(Err(e))) => bail!("connection error: {e}"),
                Err(_) => bail!("timed out waiting for a frame"),
            }
        }
    }

    /// Receive frames until one carries `type == event_type`, skipping others.
    pub async fn recv_until(&mut self, event_type: &str) -> Result<serde_json::Value, anyhow::Error> {
        for _ in 0..MAX_SKIPPED_FRAMES {
            let frame = self.recv().await?;
            if frame["type"] == event_type {
                return Ok(frame);
            }
        }
        bail!("no {event_type} frame within {MAX_SKIPPED_FRAMES} frames")
    }

    /// Assert that no text frame arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) -> Result<(), anyhow::Error> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match tokio::time::timeout(remaining, self.stream.next()).await {
                Err(_) => return Ok(()),
                Ok(Some(Ok(Message::Text(text)))) => bail!("unexpected frame: {text}"),
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => bail!("connection error: {e}"),
                Ok(None) => bail!("connection closed before the window elapsed"),
            }
        }
    }

    /// Wait for the server to close the connection.
    pub async fn expect_closed(&mut self) -> Result<(), anyhow::Error> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                bail!("connection still open");
            }
            match tokio::time::timeout(remaining, self.stream.next()).await {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Ok(()),
                // A reset counts as closed; drain anything still queued.
                Ok(Some(Err(_))) => return Ok(()),
                Ok(Some(Ok(_))) => {}
                Err(_) => bail!("connection still open"),
            }
        }
    }

    /// Close from the client side.
    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
