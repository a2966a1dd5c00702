//! ICE server configuration and STUN/TURN connectivity probing.
//!
//! Builds the `peerConfig` document handed to every signaling client and
//! probes the configured servers with a STUN binding request so the status
//! surface can report reachability. Probe results never gate signaling.

use crate::config::Config;
use crate::observability::metrics;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// STUN magic cookie (RFC 5389).
const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;

/// Binding request / success response message types.
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;

/// Attribute types carrying the reflexive address.
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN message header size in bytes.
const STUN_HEADER_SIZE: usize = 20;

/// Default STUN/TURN port when the server URL names none.
const DEFAULT_SERVER_PORT: u16 = 3478;

/// Per-server wait before declaring a target unreachable.
const PER_SERVER_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// Client-facing ICE configuration
// ============================================================================

/// `urls` may be a single URL or a list, matching what browsers accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

/// One entry of the `iceServers` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    pub urls: IceUrls,
}

/// The `peerConfig` document delivered to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfig {
    pub ice_servers: Vec<IceServer>,
}

impl IceConfig {
    /// Assemble the client ICE configuration.
    ///
    /// With a TURN server configured the list carries a STUN entry for the
    /// TURN host plus a credentialed TURN entry with UDP and TCP transports.
    /// Without one, the configured STUN URL stands alone.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        if let (Some(turn_url), Some(username), Some(password)) = (
            config.turn_url.as_deref(),
            config.turn_username.as_deref(),
            config.turn_password.as_ref(),
        ) {
            let host = host_port_of(turn_url)
                .map_or_else(|| turn_url.to_string(), |(host, port)| format!("{host}:{port}"));
            Self {
                ice_servers: vec![
                    IceServer {
                        username: None,
                        credential: None,
                        urls: IceUrls::Many(vec![format!("stun:{host}")]),
                    },
                    IceServer {
                        username: Some(username.to_string()),
                        credential: Some(password.expose_secret().to_string()),
                        urls: IceUrls::Many(vec![
                            format!("turn:{host}?transport=udp"),
                            format!("turn:{host}?transport=tcp"),
                        ]),
                    },
                ],
            }
        } else {
            Self {
                ice_servers: vec![IceServer {
                    username: None,
                    credential: None,
                    urls: IceUrls::One(config.stun_url.clone()),
                }],
            }
        }
    }
}

/// Extract `(host, port)` from an ICE URL such as
/// `turn:turn.example.com:3478?transport=udp`.
fn host_port_of(url: &str) -> Option<(String, u16)> {
    let rest = url
        .strip_prefix("stun:")
        .or_else(|| url.strip_prefix("stuns:"))
        .or_else(|| url.strip_prefix("turn:"))
        .or_else(|| url.strip_prefix("turns:"))
        .unwrap_or(url);
    let rest = rest.split('?').next().unwrap_or(rest);
    if rest.is_empty() {
        return None;
    }
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            Some((host.to_string(), port))
        }
        None => Some((rest.to_string(), DEFAULT_SERVER_PORT)),
    }
}

// ============================================================================
// STUN binding codec
// ============================================================================

/// Error type for STUN decode failures.
#[derive(Debug, thiserror::Error)]
pub enum StunError {
    /// Response shorter than a STUN header or truncated attribute.
    #[error("Insufficient data")]
    InsufficientData,

    /// Magic cookie mismatch.
    #[error("Invalid magic cookie: {0:#x}")]
    InvalidMagic(u32),

    /// Response does not echo the request transaction id.
    #[error("Transaction id mismatch")]
    TransactionMismatch,

    /// Message type other than a binding success.
    #[error("Unexpected message type: {0:#06x}")]
    UnexpectedType(u16),

    /// Address family other than IPv4/IPv6.
    #[error("Unsupported address family: {0}")]
    UnsupportedFamily(u8),
}

/// Encode a binding request with the given transaction id.
fn encode_binding_request(transaction_id: &[u8; 12]) -> Bytes {
    let mut buf = BytesMut::with_capacity(STUN_HEADER_SIZE);

    // Message type (2 bytes)
    buf.put_u16(BINDING_REQUEST);

    // Message length (2 bytes, no attributes)
    buf.put_u16(0);

    // Magic cookie (4 bytes)
    buf.put_u32(STUN_MAGIC_COOKIE);

    // Transaction id (12 bytes)
    buf.put_slice(transaction_id);

    buf.freeze()
}

/// Decode a binding success response, returning the reflexive address when
/// the server included one.
///
/// # Errors
///
/// Returns an error for truncated data, a foreign transaction id, or a
/// message that is not a binding success.
fn decode_binding_response(
    data: &mut impl Buf,
    transaction_id: &[u8; 12],
) -> Result<Option<SocketAddr>, StunError> {
    if data.remaining() < STUN_HEADER_SIZE {
        return Err(StunError::InsufficientData);
    }

    // Message type (2 bytes)
    let message_type = data.get_u16();
    if message_type != BINDING_SUCCESS {
        return Err(StunError::UnexpectedType(message_type));
    }

    // Message length (2 bytes)
    let message_length = data.get_u16() as usize;

    // Magic cookie (4 bytes)
    let cookie = data.get_u32();
    if cookie != STUN_MAGIC_COOKIE {
        return Err(StunError::InvalidMagic(cookie));
    }

    // Transaction id (12 bytes)
    let mut echoed = [0u8; 12];
    data.copy_to_slice(&mut echoed);
    if &echoed != transaction_id {
        return Err(StunError::TransactionMismatch);
    }

    if data.remaining() < message_length {
        return Err(StunError::InsufficientData);
    }

    // Walk attributes; prefer XOR-MAPPED-ADDRESS over MAPPED-ADDRESS.
    let mut mapped = None;
    let mut consumed = 0;
    while consumed + 4 <= message_length {
        let attr_type = data.get_u16();
        let attr_len = data.get_u16() as usize;
        consumed += 4;

        let padded = attr_len + ((4 - attr_len % 4) % 4);
        if data.remaining() < padded || consumed + padded > message_length {
            return Err(StunError::InsufficientData);
        }

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                let addr = decode_address(data, attr_len, Some(transaction_id))?;
                data.advance(padded - attr_len);
                consumed += padded;
                return Ok(Some(addr));
            }
            ATTR_MAPPED_ADDRESS if mapped.is_none() => {
                mapped = Some(decode_address(data, attr_len, None)?);
                data.advance(padded - attr_len);
                consumed += padded;
            }
            _ => {
                data.advance(padded);
                consumed += padded;
            }
        }
    }

    Ok(mapped)
}

/// Decode a (XOR-)MAPPED-ADDRESS attribute value. `transaction_id` is given
/// for the XOR variant only.
fn decode_address(
    data: &mut impl Buf,
    attr_len: usize,
    transaction_id: Option<&[u8; 12]>,
) -> Result<SocketAddr, StunError> {
    if attr_len < 8 || data.remaining() < attr_len {
        return Err(StunError::InsufficientData);
    }

    // Reserved (1 byte), family (1 byte), port (2 bytes)
    data.advance(1);
    let family = data.get_u8();
    let raw_port = data.get_u16();

    match (family, transaction_id) {
        // IPv4, plain
        (0x01, None) => {
            let addr = Ipv4Addr::from(data.get_u32());
            Ok(SocketAddr::new(IpAddr::V4(addr), raw_port))
        }
        // IPv4, XOR'd with the magic cookie
        (0x01, Some(_)) => {
            #[allow(clippy::cast_possible_truncation)]
            let port = raw_port ^ (STUN_MAGIC_COOKIE >> 16) as u16;
            let addr = Ipv4Addr::from(data.get_u32() ^ STUN_MAGIC_COOKIE);
            Ok(SocketAddr::new(IpAddr::V4(addr), port))
        }
        // IPv6, plain
        (0x02, None) => {
            if attr_len < 20 {
                return Err(StunError::InsufficientData);
            }
            let mut octets = [0u8; 16];
            data.copy_to_slice(&mut octets);
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), raw_port))
        }
        // IPv6, XOR'd with cookie plus transaction id
        (0x02, Some(transaction)) => {
            if attr_len < 20 {
                return Err(StunError::InsufficientData);
            }
            #[allow(clippy::cast_possible_truncation)]
            let port = raw_port ^ (STUN_MAGIC_COOKIE >> 16) as u16;
            let mut octets = [0u8; 16];
            data.copy_to_slice(&mut octets);
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(transaction);
            for (octet, m) in octets.iter_mut().zip(mask.iter()) {
                *octet ^= m;
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        (other, _) => Err(StunError::UnsupportedFamily(other)),
    }
}

// ============================================================================
// Prober
// ============================================================================

/// Server kind, for the aggregate `stun` / `turn` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Stun,
    Turn,
}

impl ServerKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stun => "stun",
            Self::Turn => "turn",
        }
    }
}

/// One probe target derived from configuration.
#[derive(Debug, Clone)]
struct ProbeTarget {
    url: String,
    host: String,
    port: u16,
    kind: ServerKind,
}

/// Per-server probe result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerProbe {
    pub url: String,
    pub kind: ServerKind,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapped_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub rtt_ms: u64,
}

/// Aggregate probe report served on the status surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub stun: bool,
    pub turn: bool,
    pub servers: Vec<ServerProbe>,
    pub tested_at: i64,
    /// Present when the report was answered from cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_since_tested: Option<u64>,
}

/// Probes the configured ICE servers, caching results between status queries.
pub struct IceProber {
    targets: Vec<ProbeTarget>,
    timeout: Duration,
    cache_window: Duration,
    cached: Mutex<Option<(Instant, ProbeReport)>>,
}

impl IceProber {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let mut targets = Vec::new();
        if let Some((host, port)) = host_port_of(&config.stun_url) {
            targets.push(ProbeTarget {
                url: config.stun_url.clone(),
                host,
                port,
                kind: ServerKind::Stun,
            });
        }
        if let Some(turn_url) = config.turn_url.as_deref() {
            if let Some((host, port)) = host_port_of(turn_url) {
                targets.push(ProbeTarget {
                    url: turn_url.to_string(),
                    host,
                    port,
                    kind: ServerKind::Turn,
                });
            }
        }

        Self::new(
            targets,
            Duration::from_secs(config.probe_timeout_seconds),
            Duration::from_secs(config.probe_cache_seconds),
        )
    }

    fn new(targets: Vec<ProbeTarget>, timeout: Duration, cache_window: Duration) -> Self {
        Self {
            targets,
            timeout,
            cache_window,
            cached: Mutex::new(None),
        }
    }

    /// Probe all targets, or answer from the cache within its window.
    pub async fn probe(&self) -> ProbeReport {
        let mut cached = self.cached.lock().await;
        if let Some((tested, report)) = cached.as_ref() {
            let age = tested.elapsed();
            if age < self.cache_window {
                debug!(
                    target: "sc.ice",
                    age_seconds = age.as_secs(),
                    "Returning cached probe report"
                );
                let mut report = report.clone();
                report.seconds_since_tested = Some(age.as_secs());
                return report;
            }
        }

        let report = self.run_probes().await;
        *cached = Some((Instant::now(), report.clone()));
        report
    }

    async fn run_probes(&self) -> ProbeReport {
        let per_server = PER_SERVER_TIMEOUT.min(self.timeout);
        let probes = self
            .targets
            .iter()
            .map(|target| probe_server(target, per_server));
        let results = match tokio::time::timeout(self.timeout, futures::future::join_all(probes))
            .await
        {
            Ok(results) => results,
            Err(_) => {
                warn!(target: "sc.ice", "Probe ceiling reached before all servers answered");
                self.targets
                    .iter()
                    .map(|target| ServerProbe {
                        url: target.url.clone(),
                        kind: target.kind,
                        reachable: false,
                        mapped_address: None,
                        error: Some("probe timeout".to_string()),
                        rtt_ms: self.timeout.as_millis() as u64,
                    })
                    .collect()
            }
        };

        let stun = results
            .iter()
            .any(|p| p.kind == ServerKind::Stun && p.reachable);
        let turn = results
            .iter()
            .any(|p| p.kind == ServerKind::Turn && p.reachable);

        ProbeReport {
            stun,
            turn,
            servers: results,
            tested_at: chrono::Utc::now().timestamp_millis(),
            seconds_since_tested: None,
        }
    }
}

/// Send one binding request and wait for the response.
async fn probe_server(target: &ProbeTarget, timeout: Duration) -> ServerProbe {
    let started = Instant::now();
    let result = binding_roundtrip(&target.host, target.port, timeout).await;
    let rtt = started.elapsed();

    let probe = match result {
        Ok(mapped) => ServerProbe {
            url: target.url.clone(),
            kind: target.kind,
            reachable: true,
            mapped_address: mapped.map(|a| a.to_string()),
            error: None,
            rtt_ms: rtt.as_millis() as u64,
        },
        Err(error) => {
            debug!(
                target: "sc.ice",
                url = %target.url,
                error = %error,
                "Probe failed"
            );
            ServerProbe {
                url: target.url.clone(),
                kind: target.kind,
                reachable: false,
                mapped_address: None,
                error: Some(error),
                rtt_ms: rtt.as_millis() as u64,
            }
        }
    };

    metrics::record_ice_probe(probe.kind.as_str(), probe.reachable, rtt);
    probe
}

async fn binding_roundtrip(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<Option<SocketAddr>, String> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    socket
        .connect((host, port))
        .await
        .map_err(|e| format!("resolve failed: {e}"))?;

    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);
    let request = encode_binding_request(&transaction_id);

    socket
        .send(&request)
        .await
        .map_err(|e| format!("send failed: {e}"))?;

    let mut buf = [0u8; 512];
    let len = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| "response timeout".to_string())?
        .map_err(|e| format!("recv failed: {e}"))?;

    let mut data = buf.get(..len).unwrap_or_default();
    decode_binding_response(&mut data, &transaction_id).map_err(|e| e.to_string())
}
