//! Admission control.
//!
//! Pure decision functions that compare a proposed publish/subscribe against
//! the account's plan limits and the current usage snapshot. Evaluation never
//! mutates state; callers commit the registry attach only on an empty issue
//! list and tally the returned codes on rejection.

use crate::accounts::Plan;
use crate::registry::StreamParams;
use crate::stats::AccountUsage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason codes returned by admission evaluation.
///
/// Serialized forms match the wire vocabulary exposed in
/// `publishError`/`subscribeError` messages and the usage status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IssueCode {
    #[serde(rename = "width")]
    Width,
    #[serde(rename = "height")]
    Height,
    #[serde(rename = "portrait")]
    Portrait,
    #[serde(rename = "bitrate")]
    Bitrate,
    #[serde(rename = "frameRate")]
    FrameRate,
    #[serde(rename = "audioBitrate")]
    AudioBitrate,
    #[serde(rename = "totalBitrate")]
    TotalBitrate,
    #[serde(rename = "connections")]
    Connections,
    #[serde(rename = "nameRestricted")]
    NameRestricted,
}

impl IssueCode {
    /// Wire name of the code, as joined into rejection messages.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            IssueCode::Width => "width",
            IssueCode::Height => "height",
            IssueCode::Portrait => "portrait",
            IssueCode::Bitrate => "bitrate",
            IssueCode::FrameRate => "frameRate",
            IssueCode::AudioBitrate => "audioBitrate",
            IssueCode::TotalBitrate => "totalBitrate",
            IssueCode::Connections => "connections",
            IssueCode::NameRestricted => "nameRestricted",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Joins issue codes into the client-facing rejection message.
///
/// Format: `Unfit: totalBitrate, connections.`
#[must_use]
pub fn rejection_message(issues: &[IssueCode]) -> String {
    let list: Vec<&str> = issues.iter().map(IssueCode::as_str).collect();
    format!("Unfit: {}.", list.join(", "))
}

/// Publish name-restriction policy, read from account properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameRestriction {
    /// No restriction.
    #[default]
    None,
    /// Channel name must equal the identity.
    Username,
    /// Channel name must start with the identity.
    Prefix,
    /// Channel name must end with the identity.
    Suffix,
    /// Channel name must contain the identity.
    Contain,
}

impl NameRestriction {
    /// Parse the policy from an account property value. Unknown values fall
    /// back to no restriction.
    #[must_use]
    pub fn from_property(value: Option<&str>) -> Self {
        match value {
            Some("username") => NameRestriction::Username,
            Some("prefix") => NameRestriction::Prefix,
            Some("suffix") => NameRestriction::Suffix,
            Some("contain") => NameRestriction::Contain,
            _ => NameRestriction::None,
        }
    }

    /// Whether `channel` satisfies this policy for the given identity.
    #[must_use]
    pub fn permits(&self, channel: &str, identity: &str) -> bool {
        match self {
            NameRestriction::None => true,
            NameRestriction::Username => channel == identity,
            NameRestriction::Prefix => channel.starts_with(identity),
            NameRestriction::Suffix => channel.ends_with(identity),
            NameRestriction::Contain => channel.contains(identity),
        }
    }
}

/// Snapshot figures for one account with a prior footprint subtracted.
///
/// Re-evaluation of an already-attached record (re-publish, re-subscribe)
/// removes that record's own contribution first so the cumulative checks see
/// a hypothetical snapshot without it.
fn adjusted_usage(usage: &AccountUsage, prior: Option<&StreamParams>) -> (u64, u64, u64) {
    match prior {
        None => (usage.connections, usage.bitrate, usage.audio_bitrate),
        Some(p) => (
            usage.connections.saturating_sub(1),
            usage.bitrate.saturating_sub(u64::from(p.bitrate)),
            usage.audio_bitrate.saturating_sub(u64::from(p.audio_bitrate)),
        ),
    }
}

/// Treats absent and zero plan limits as unlimited.
fn limit(value: Option<u32>) -> Option<u32> {
    value.filter(|&v| v > 0)
}

/// Evaluate a publish against the plan and the current snapshot.
///
/// `prior` carries the declared footprint of the same `(channel, peerID)`
/// record when this is a re-publish. Returns the complete list of failed
/// checks; empty means admit.
#[must_use]
pub fn evaluate_publish(
    plan: &Plan,
    usage: &AccountUsage,
    proposed: &StreamParams,
    prior: Option<&StreamParams>,
    channel: &str,
    identity: &str,
    restriction: NameRestriction,
) -> Vec<IssueCode> {
    let mut issues = Vec::new();

    // Orientation-aware resolution check. Plans are defined in landscape
    // terms; a portrait stream is compared against the swapped axes and
    // additionally marked `portrait` when either axis fails.
    let plan_width = limit(plan.width);
    let plan_height = limit(plan.height);
    if plan_width.is_some() || plan_height.is_some() {
        if proposed.width >= proposed.height {
            if let Some(w) = plan_width {
                if proposed.width > w {
                    issues.push(IssueCode::Width);
                }
            }
            if let Some(h) = plan_height {
                if proposed.height > h {
                    issues.push(IssueCode::Height);
                }
            }
        } else {
            let mut rotated = false;
            if let Some(w) = plan_width {
                if proposed.height > w {
                    issues.push(IssueCode::Height);
                    rotated = true;
                }
            }
            if let Some(h) = plan_height {
                if proposed.width > h {
                    issues.push(IssueCode::Width);
                    rotated = true;
                }
            }
            if rotated {
                issues.push(IssueCode::Portrait);
            }
        }
    }

    if let Some(b) = limit(plan.bitrate) {
        if proposed.bitrate > b {
            issues.push(IssueCode::Bitrate);
        }
    }

    if let Some(f) = limit(plan.frame_rate) {
        if proposed.frame_rate > f {
            issues.push(IssueCode::FrameRate);
        }
    }

    if let Some(a) = limit(plan.audio_bitrate) {
        if proposed.audio_bitrate > a {
            issues.push(IssueCode::AudioBitrate);
        }
    }

    push_cumulative_issues(&mut issues, plan, usage, proposed, prior);

    if !restriction.permits(channel, identity) {
        issues.push(IssueCode::NameRestricted);
    }

    issues
}

/// Evaluate a subscribe against the plan and the current snapshot.
///
/// Only the cumulative checks apply; the channel's declared params stand in
/// as the proposed footprint since the subscriber consumes the published
/// stream as-is.
#[must_use]
pub fn evaluate_subscribe(
    plan: &Plan,
    usage: &AccountUsage,
    channel_params: &StreamParams,
    prior: Option<&StreamParams>,
) -> Vec<IssueCode> {
    let mut issues = Vec::new();
    push_cumulative_issues(&mut issues, plan, usage, channel_params, prior);
    issues
}

/// Cumulative bitrate and connection-count checks shared by both paths.
fn push_cumulative_issues(
    issues: &mut Vec<IssueCode>,
    plan: &Plan,
    usage: &AccountUsage,
    proposed: &StreamParams,
    prior: Option<&StreamParams>,
) {
    let (connections, bitrate, audio_bitrate) = adjusted_usage(usage, prior);

    if let Some(total) = limit(plan.total_bitrate) {
        let projected =
            bitrate + audio_bitrate + u64::from(proposed.bitrate) + u64::from(proposed.audio_bitrate);
        if projected > u64::from(total) {
            issues.push(IssueCode::TotalBitrate);
        }
    }

    if let Some(max) = limit(plan.max_connections) {
        if connections >= u64::from(max) {
            issues.push(IssueCode::Connections);
        }
    }
}
