//! Usage aggregation: per-account counters derived by full registry scan.
//!
//! The ledger owns the two pieces of state that are not derived: the
//! accumulated per-account issue tally (mutated on every admission
//! rejection) and the supplemental usage table contributed by an external
//! media server. Everything else is recomputed from the registry on every
//! call.

use crate::admission::IssueCode;
use crate::registry::{ConnectionRegistry, PeerRole};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

/// Per-account usage figures for one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountUsage {
    pub connections: u64,
    pub bitrate: u64,
    pub audio_bitrate: u64,
    pub players: u64,
    pub broadcasters: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub issues: BTreeMap<IssueCode, u64>,
}

/// Supplemental usage contributed by the external media server, folded
/// additively into every snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplementalUsage {
    #[serde(default)]
    pub connections: u64,
    #[serde(default)]
    pub bitrate: u64,
    #[serde(default)]
    pub audio_bitrate: u64,
}

/// Full usage snapshot, recomputed on every registry mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub accounts: BTreeMap<String, AccountUsage>,
    pub generated_at: i64,
}

impl UsageSnapshot {
    /// Usage for one account; zeros when the account has no activity.
    #[must_use]
    pub fn account(&self, name: &str) -> AccountUsage {
        self.accounts.get(name).cloned().unwrap_or_default()
    }
}

/// Owns the non-derived aggregation state and performs recomputes.
#[derive(Debug, Default)]
pub struct UsageLedger {
    issue_tally: HashMap<String, BTreeMap<IssueCode, u64>>,
    supplemental: HashMap<String, SupplementalUsage>,
}

impl UsageLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the accumulated tally for every rejected issue code.
    pub fn record_issues(&mut self, account: &str, issues: &[IssueCode]) {
        let tally = self.issue_tally.entry(account.to_string()).or_default();
        for issue in issues {
            *tally.entry(*issue).or_insert(0) += 1;
        }
    }

    /// Replace the supplemental usage table wholesale.
    pub fn set_supplemental(&mut self, table: HashMap<String, SupplementalUsage>) {
        self.supplemental = table;
    }

    /// Recompute the full snapshot from the registry.
    ///
    /// Side effects: refreshes each channel's derived peer count and sweeps
    /// channels that stayed empty past `grace`. Idempotent between
    /// mutations.
    pub fn recompute(
        &mut self,
        registry: &mut ConnectionRegistry,
        grace: Duration,
    ) -> UsageSnapshot {
        let swept = registry.refresh_and_sweep(grace);
        if !swept.is_empty() {
            debug!(
                target: "sc.stats",
                swept = swept.len(),
                channels = ?swept,
                "Swept empty channels"
            );
        }

        let mut accounts: BTreeMap<String, AccountUsage> = BTreeMap::new();

        for (_, channel) in registry.channels() {
            let params = channel.params;
            for record in channel.records.values() {
                let usage = accounts.entry(record.account.clone()).or_default();
                usage.connections += 1;
                usage.bitrate += u64::from(params.bitrate);
                usage.audio_bitrate += u64::from(params.audio_bitrate);
                match record.role {
                    PeerRole::Player => usage.players += 1,
                    PeerRole::Broadcaster => usage.broadcasters += 1,
                }
            }
        }

        for (account, extra) in &self.supplemental {
            let usage = accounts.entry(account.clone()).or_default();
            usage.connections += extra.connections;
            usage.bitrate += extra.bitrate;
            usage.audio_bitrate += extra.audio_bitrate;
        }

        for (account, tally) in &self.issue_tally {
            let usage = accounts.entry(account.clone()).or_default();
            usage.issues = tally.clone();
        }

        UsageSnapshot {
            accounts,
            generated_at: Utc::now().timestamp_millis(),
        }
    }
}
