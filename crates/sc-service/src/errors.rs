//! Signal Coordinator error types.
//!
//! Error types map to numeric codes for client responses. Internal details
//! are logged server-side but not exposed to clients.

use crate::admission::{rejection_message, IssueCode};
use thiserror::Error;

/// Signal Coordinator error type.
///
/// Maps to wire error codes:
/// - `Protocol`, `Room(InvalidParams)`: `BAD_REQUEST` (1)
/// - `Authentication`: `UNAUTHORIZED` (2)
/// - `AdmissionRejected`, `Room(NotOwner)`: `FORBIDDEN` (3)
/// - `ChannelNotFound`, `PeerNotFound`, `RoomNotFound`, `Room(NotParticipant)`: `NOT_FOUND` (4)
/// - `Uniqueness`, `Room(DuplicateStream)`: `CONFLICT` (5)
/// - `Database`, `Verification`, `Internal`: `INTERNAL_ERROR` (6)
#[derive(Debug, Error)]
pub enum ScError {
    /// Handshake authentication failed.
    #[error("Authentication error: {0}")]
    Authentication(AuthError),

    /// Admission control rejected the operation.
    #[error("Admission rejected: {}", rejection_message(.0))]
    AdmissionRejected(Vec<IssueCode>),

    /// A `(channel, peerID)` pair is held by a different live connection.
    #[error("Peer identity already connected: {0}")]
    Uniqueness(String),

    /// Room-layer operation failure.
    #[error("Room error: {0}")]
    Room(RoomError),

    /// Malformed or incomplete inbound operation.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Channel not found.
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Target peer not found in the channel.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Room not found.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Account directory load failed.
    #[error("Database error: {0}")]
    Database(String),

    /// External credential verification failed or timed out.
    #[error("Verification error: {0}")]
    Verification(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Handshake authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Credential token not present in the directory.
    #[error("Invalid token")]
    InvalidToken,

    /// Account carries a truthy suspension flag.
    #[error("Account suspended")]
    Suspended,

    /// Too many failed handshakes from this address.
    #[error("Too many attempts")]
    RateLimited,

    /// External verification rejected the user/pin pair.
    #[error("Login failed: {0}")]
    LoginRejected(String),
}

/// Room-layer operation failures; wire codes match the event payloads.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Caller is not a participant of the room.
    #[error("Not a participant")]
    NotParticipant,

    /// Stream ID already published in the room.
    #[error("Duplicate stream")]
    DuplicateStream,

    /// Stream params were missing or malformed.
    #[error("Invalid params")]
    InvalidParams,

    /// Stream exists but is owned by another participant.
    #[error("Not the stream owner")]
    NotOwner,
}

impl RoomError {
    /// Wire code carried in room error events.
    #[must_use]
    pub const fn wire_code(&self) -> &'static str {
        match self {
            RoomError::NotParticipant => "notParticipant",
            RoomError::DuplicateStream => "duplicateStream",
            RoomError::InvalidParams => "invalidParams",
            RoomError::NotOwner => "notOwner",
        }
    }
}

impl ScError {
    /// Returns the numeric wire error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            ScError::Protocol(_) | ScError::Room(RoomError::InvalidParams) => 1, // BAD_REQUEST
            ScError::Authentication(_) => 2,                                     // UNAUTHORIZED
            ScError::AdmissionRejected(_) | ScError::Room(RoomError::NotOwner) => 3, // FORBIDDEN
            ScError::ChannelNotFound(_)
            | ScError::PeerNotFound(_)
            | ScError::RoomNotFound(_)
            | ScError::Room(RoomError::NotParticipant) => 4, // NOT_FOUND
            ScError::Uniqueness(_) | ScError::Room(RoomError::DuplicateStream) => 5, // CONFLICT
            ScError::Database(_) | ScError::Verification(_) | ScError::Internal(_) => 6, // INTERNAL_ERROR
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            ScError::Database(_) | ScError::Verification(_) | ScError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            ScError::Authentication(e) => e.client_message(),
            ScError::AdmissionRejected(issues) => rejection_message(issues),
            ScError::Uniqueness(peer_id) => {
                format!("Peer '{peer_id}' is already connected")
            }
            ScError::Room(e) => e.to_string(),
            ScError::Protocol(msg) => msg.clone(),
            ScError::ChannelNotFound(_) => "Channel not found".to_string(),
            ScError::PeerNotFound(_) => "Peer not found".to_string(),
            ScError::RoomNotFound(_) => "Room not found".to_string(),
        }
    }
}

impl AuthError {
    /// Returns a client-safe message for the refused handshake.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            AuthError::InvalidToken => "Invalid token".to_string(),
            AuthError::Suspended => "Account suspended".to_string(),
            AuthError::RateLimited => "Too many attempts, try again later".to_string(),
            AuthError::LoginRejected(msg) => msg.clone(),
        }
    }
}

impl From<AuthError> for ScError {
    fn from(err: AuthError) -> Self {
        ScError::Authentication(err)
    }
}

impl From<RoomError> for ScError {
    fn from(err: RoomError) -> Self {
        ScError::Room(err)
    }
}

impl From<sqlx::Error> for ScError {
    fn from(err: sqlx::Error) -> Self {
        ScError::Database(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        // Bad request -> 1
        assert_eq!(ScError::Protocol("no channel".to_string()).error_code(), 1);
        assert_eq!(ScError::Room(RoomError::InvalidParams).error_code(), 1);

        // Auth errors -> 2
        assert_eq!(
            ScError::Authentication(AuthError::InvalidToken).error_code(),
            2
        );
        assert_eq!(ScError::Authentication(AuthError::Suspended).error_code(), 2);

        // Admission / forbidden -> 3
        assert_eq!(
            ScError::AdmissionRejected(vec![IssueCode::Bitrate]).error_code(),
            3
        );
        assert_eq!(ScError::Room(RoomError::NotOwner).error_code(), 3);

        // Not found -> 4
        assert_eq!(ScError::ChannelNotFound("cam1".to_string()).error_code(), 4);
        assert_eq!(ScError::PeerNotFound("alice".to_string()).error_code(), 4);
        assert_eq!(ScError::RoomNotFound("demo".to_string()).error_code(), 4);
        assert_eq!(ScError::Room(RoomError::NotParticipant).error_code(), 4);

        // Conflict -> 5
        assert_eq!(ScError::Uniqueness("alice".to_string()).error_code(), 5);
        assert_eq!(ScError::Room(RoomError::DuplicateStream).error_code(), 5);

        // Internal errors -> 6
        assert_eq!(ScError::Database("conn failed".to_string()).error_code(), 6);
        assert_eq!(ScError::Verification("timeout".to_string()).error_code(), 6);
        assert_eq!(
            ScError::Internal("send failed".to_string()).error_code(),
            6
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let db_err = ScError::Database("access denied for sc@10.0.0.5".to_string());
        assert!(!db_err.client_message().contains("10.0.0.5"));
        assert_eq!(db_err.client_message(), "An internal error occurred");

        let verify_err = ScError::Verification("dns lookup failed for login.example.com".to_string());
        assert!(!verify_err.client_message().contains("example.com"));
        assert_eq!(verify_err.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_admission_message_joins_issue_codes() {
        let err = ScError::AdmissionRejected(vec![
            IssueCode::TotalBitrate,
            IssueCode::Connections,
        ]);
        assert_eq!(err.client_message(), "Unfit: totalBitrate, connections.");
    }

    #[test]
    fn test_room_error_wire_codes() {
        assert_eq!(RoomError::NotParticipant.wire_code(), "notParticipant");
        assert_eq!(RoomError::DuplicateStream.wire_code(), "duplicateStream");
        assert_eq!(RoomError::InvalidParams.wire_code(), "invalidParams");
        assert_eq!(RoomError::NotOwner.wire_code(), "notOwner");
    }

    #[test]
    fn test_auth_error_conversion() {
        let auth_err = AuthError::RateLimited;
        let sc_err: ScError = auth_err.into();

        assert!(matches!(sc_err, ScError::Authentication(_)));
        assert_eq!(sc_err.error_code(), 2);
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", ScError::ChannelNotFound("cam1".to_string())),
            "Channel not found: cam1"
        );

        assert_eq!(
            format!("{}", ScError::Room(RoomError::DuplicateStream)),
            "Room error: Duplicate stream"
        );

        assert_eq!(
            format!(
                "{}",
                ScError::AdmissionRejected(vec![IssueCode::Width, IssueCode::Portrait])
            ),
            "Admission rejected: Unfit: width, portrait."
        );
    }
}
