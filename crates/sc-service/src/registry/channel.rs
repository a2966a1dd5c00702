//! Channel state: the named stream namespace and its declared footprint.

use crate::registry::connections::ConnectionRecord;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::Instant;

/// Declared footprint of a published stream.
///
/// Absent fields deserialize to zero, which every check treats as
/// "not declared".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamParams {
    #[serde(default)]
    pub bitrate: u32,
    #[serde(default)]
    pub audio_bitrate: u32,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub frame_rate: u32,
}

/// A named channel: declared params, current publisher, attached records.
///
/// `peers` is derived during aggregator recomputes. `empty_since` tracks how
/// long the channel has had zero records; the sweep removes it only after
/// the grace window so a reconnecting publisher finds its channel intact.
#[derive(Debug)]
pub struct Channel {
    /// Declared stream footprint; zeros until a publish declares one.
    pub params: StreamParams,
    /// Identifier of the broadcasting participant, if any.
    pub publisher: Option<String>,
    /// Creation stamp, milliseconds since the epoch.
    pub created_at: i64,
    /// Server-side stamp of the last params declaration, ms since epoch.
    pub time: i64,
    /// Derived participant count, refreshed on recompute.
    pub peers: usize,
    /// Attached connection records, keyed by peer ID.
    pub(crate) records: HashMap<String, ConnectionRecord>,
    /// When the channel last became empty; cleared while records exist.
    pub(crate) empty_since: Option<Instant>,
}

impl Channel {
    pub(crate) fn new() -> Self {
        Self {
            params: StreamParams::default(),
            publisher: None,
            created_at: Utc::now().timestamp_millis(),
            time: 0,
            peers: 0,
            records: HashMap::new(),
            empty_since: None,
        }
    }

    /// Number of records currently attached.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Replace the declared footprint, stamping the server-side timestamp.
    pub(crate) fn declare(&mut self, params: StreamParams, publisher: &str) {
        self.params = params;
        self.publisher = Some(publisher.to_string());
        self.time = Utc::now().timestamp_millis();
    }
}

/// Serializable channel-table row for the status surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub name: String,
    #[serde(flatten)]
    pub params: StreamParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    pub time: i64,
    pub peers: usize,
    pub created_at: i64,
}

impl Channel {
    /// Build the status row for this channel.
    #[must_use]
    pub fn status(&self, name: &str) -> ChannelStatus {
        ChannelStatus {
            name: name.to_string(),
            params: self.params,
            publisher: self.publisher.clone(),
            time: self.time,
            peers: self.peers,
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_params_deserialize_with_defaults() {
        let params: StreamParams = serde_json::from_str(r#"{"bitrate": 500}"#).unwrap();
        assert_eq!(params.bitrate, 500);
        assert_eq!(params.audio_bitrate, 0);
        assert_eq!(params.width, 0);
        assert_eq!(params.frame_rate, 0);
    }

    #[test]
    fn test_stream_params_camel_case_wire_names() {
        let params: StreamParams = serde_json::from_str(
            r#"{"bitrate":750,"audioBitrate":64,"width":640,"height":480,"frameRate":30}"#,
        )
        .unwrap();
        assert_eq!(params.audio_bitrate, 64);
        assert_eq!(params.frame_rate, 30);

        let out = serde_json::to_value(params).unwrap();
        assert_eq!(out["audioBitrate"], 64);
        assert_eq!(out["frameRate"], 30);
    }

    #[test]
    fn test_declare_stamps_time_and_publisher() {
        let mut channel = Channel::new();
        assert_eq!(channel.time, 0);
        assert!(channel.publisher.is_none());

        let params = StreamParams {
            bitrate: 500,
            ..StreamParams::default()
        };
        channel.declare(params, "alice");

        assert_eq!(channel.params.bitrate, 500);
        assert_eq!(channel.publisher.as_deref(), Some("alice"));
        assert!(channel.time > 0);
    }

    #[test]
    fn test_channel_status_flattens_params() {
        let mut channel = Channel::new();
        channel.declare(
            StreamParams {
                bitrate: 500,
                audio_bitrate: 64,
                width: 640,
                height: 480,
                frame_rate: 30,
            },
            "alice",
        );
        channel.peers = 3;

        let status = serde_json::to_value(channel.status("cam1")).unwrap();
        assert_eq!(status["name"], "cam1");
        assert_eq!(status["bitrate"], 500);
        assert_eq!(status["audioBitrate"], 64);
        assert_eq!(status["publisher"], "alice");
        assert_eq!(status["peers"], 3);
    }
}
