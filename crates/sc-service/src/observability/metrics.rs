//! Metrics definitions for the signaling coordinator.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sc_` prefix for this service
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `operation`: publish, subscribe
//! - `issue`: the nine admission issue codes
//! - `kind` / `status`: small fixed vocabularies listed per function
//! - `outcome` (handshake): success plus the four refusal categories

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle that renders
/// `/metrics`. Must be called once, before any metric is recorded.
///
/// # Errors
///
/// Returns an error if the recorder fails to install (e.g. already
/// installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Recompute is an in-memory scan; sub-millisecond is the norm.
        .set_buckets_for_metric(
            Matcher::Prefix("sc_recompute".to_string()),
            &[
                0.000_05, 0.000_1, 0.000_25, 0.000_5, 0.001, 0.002, 0.005, 0.010, 0.025,
            ],
        )
        .map_err(|e| format!("Failed to set recompute buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("sc_db_query".to_string()),
            &[
                0.001, 0.002, 0.005, 0.010, 0.020, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set DB query buckets: {e}"))?
        // Verification has a 5 s ceiling, the probe a 10 s ceiling.
        .set_buckets_for_metric(
            Matcher::Prefix("sc_verification".to_string()),
            &[0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000],
        )
        .map_err(|e| format!("Failed to set verification buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("sc_ice_probe".to_string()),
            &[0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000],
        )
        .map_err(|e| format!("Failed to set probe buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

// ============================================================================
// Registry Gauges
// ============================================================================

/// Set the live registry gauges after a recompute.
///
/// Metrics: `sc_connections_active`, `sc_channels_active`, `sc_rooms_active`
pub fn set_registry_gauges(connections: usize, channels: usize, rooms: usize) {
    gauge!("sc_connections_active").set(connections as f64);
    gauge!("sc_channels_active").set(channels as f64);
    gauge!("sc_rooms_active").set(rooms as f64);
}

/// Set the count of live WebSocket sessions.
///
/// Metric: `sc_sessions_active`
pub fn set_sessions_active(sessions: usize) {
    gauge!("sc_sessions_active").set(sessions as f64);
}

// ============================================================================
// Admission Metrics
// ============================================================================

/// Record an admission decision.
///
/// Metric: `sc_admission_total`
/// Labels: `operation` ("publish" | "subscribe"), `status` ("admitted" |
/// "rejected")
pub fn record_admission(operation: &str, admitted: bool) {
    let status = if admitted { "admitted" } else { "rejected" };
    counter!("sc_admission_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record each issue code of a rejected admission.
///
/// Metric: `sc_admission_rejections_total`
/// Labels: `operation`, `issue`
pub fn record_admission_issue(operation: &str, issue: &str) {
    counter!("sc_admission_rejections_total",
        "operation" => operation.to_string(),
        "issue" => issue.to_string()
    )
    .increment(1);
}

// ============================================================================
// Routing Metrics
// ============================================================================

/// Record a routed signaling message.
///
/// Metric: `sc_messages_routed_total`
/// Labels: `kind` ("peer" | "broadcast" | "room"), `status` ("delivered" |
/// "dropped")
pub fn record_message_routed(kind: &str, delivered: bool) {
    let status = if delivered { "delivered" } else { "dropped" };
    counter!("sc_messages_routed_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

// ============================================================================
// Handshake Metrics
// ============================================================================

/// Record a connection handshake outcome.
///
/// Metric: `sc_handshakes_total`
/// Labels: `outcome` ("success" | "invalid_token" | "suspended" |
/// "rate_limited" | "login_rejected" | "protocol")
pub fn record_handshake(outcome: &str) {
    counter!("sc_handshakes_total", "outcome" => outcome.to_string()).increment(1);
}

// ============================================================================
// Recompute Metrics
// ============================================================================

/// Record a usage recompute pass.
///
/// Metric: `sc_recompute_duration_seconds`, `sc_recomputes_total`
pub fn record_recompute(duration: Duration) {
    histogram!("sc_recompute_duration_seconds").record(duration.as_secs_f64());
    counter!("sc_recomputes_total").increment(1);
}

// ============================================================================
// Database Metrics
// ============================================================================

/// Record an account-store query.
///
/// Metric: `sc_db_query_duration_seconds`, `sc_db_queries_total`
/// Labels: `operation` ("load_accounts"), `status` ("success" | "error")
pub fn record_db_query(operation: &str, status: &str, duration: Duration) {
    histogram!("sc_db_query_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("sc_db_queries_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

// ============================================================================
// External Call Metrics
// ============================================================================

/// Record an external credential-verification call.
///
/// Metric: `sc_verification_duration_seconds`, `sc_verifications_total`
/// Labels: `status` ("accepted" | "rejected" | "error" | "timeout")
pub fn record_verification(status: &str, duration: Duration) {
    histogram!("sc_verification_duration_seconds").record(duration.as_secs_f64());
    counter!("sc_verifications_total", "status" => status.to_string()).increment(1);
}

/// Record a STUN/TURN reachability probe.
///
/// Metric: `sc_ice_probe_duration_seconds`, `sc_ice_probes_total`
/// Labels: `server` ("stun" | "turn"), `status` ("reachable" | "unreachable")
pub fn record_ice_probe(server: &str, reachable: bool, duration: Duration) {
    let status = if reachable { "reachable" } else { "unreachable" };
    histogram!("sc_ice_probe_duration_seconds",
        "server" => server.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("sc_ice_probes_total",
        "server" => server.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a supplemental media-server stats pull.
///
/// Metric: `sc_media_stats_pulls_total`
/// Labels: `status` ("success" | "error")
pub fn record_media_stats_pull(status: &str) {
    counter!("sc_media_stats_pulls_total", "status" => status.to_string()).increment(1);
}
