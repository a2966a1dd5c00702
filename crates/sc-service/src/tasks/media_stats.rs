//! Supplemental media-server statistics poller.
//!
//! With a media-server URL configured, this task periodically fetches a JSON
//! document of per-account usage (`{"account": {"connections": n, "bitrate":
//! n, "audioBitrate": n}, ...}`) and replaces the coordinator's supplemental
//! table wholesale. The usage aggregator folds that table additively into
//! every snapshot, so admission decisions account for load the signaling
//! layer cannot see.
//!
//! A failed pull leaves the previous table in place.
//!
//! # Graceful Shutdown
//!
//! The task supports graceful shutdown via a cancellation token. When the
//! token is cancelled, the task exits cleanly after its current iteration.

use crate::actors::CoordinatorHandle;
use crate::observability::metrics;
use crate::stats::SupplementalUsage;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Per-pull request ceiling.
const PULL_TIMEOUT: Duration = Duration::from_secs(10);

/// Start the media-server statistics poller.
///
/// The first pull happens immediately; later ones follow `poll_interval`.
/// Returns when the cancellation token is triggered.
#[instrument(skip_all, name = "sc.task.media_stats")]
pub async fn start_media_stats_poll(
    coordinator: CoordinatorHandle,
    url: String,
    poll_interval: Duration,
    cancel_token: CancellationToken,
) {
    let client = match Client::builder().timeout(PULL_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            warn!(
                target: "sc.task.media_stats",
                error = %e,
                "HTTP client build failed, media stats poller not running"
            );
            return;
        }
    };

    info!(
        target: "sc.task.media_stats",
        url = %url,
        poll_seconds = poll_interval.as_secs(),
        "Starting media stats poller"
    );

    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match pull_once(&client, &coordinator, &url).await {
                    Ok(accounts) => {
                        metrics::record_media_stats_pull("success");
                        debug!(
                            target: "sc.task.media_stats",
                            accounts,
                            "Supplemental usage table replaced"
                        );
                    }
                    Err(e) => {
                        // The previous table stays in effect until a pull
                        // succeeds.
                        metrics::record_media_stats_pull("error");
                        warn!(
                            target: "sc.task.media_stats",
                            error = %e,
                            "Media stats pull failed"
                        );
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                info!(
                    target: "sc.task.media_stats",
                    "Media stats poller received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "sc.task.media_stats", "Media stats poller stopped");
}

/// Run a single pull and hand the table to the coordinator.
///
/// Separated from the loop for direct testing. Returns the number of
/// accounts in the fetched table.
pub(crate) async fn pull_once(
    client: &Client,
    coordinator: &CoordinatorHandle,
    url: &str,
) -> Result<usize, String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?
        .error_for_status()
        .map_err(|e| format!("bad status: {e}"))?;

    let table: HashMap<String, SupplementalUsage> = response
        .json()
        .await
        .map_err(|e| format!("malformed body: {e}"))?;

    let accounts = table.len();
    coordinator
        .set_supplemental(table)
        .await
        .map_err(|e| format!("coordinator send failed: {e}"))?;

    Ok(accounts)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::accounts::{AccountDirectory, DirectoryHandle};
    use crate::actors::CoordinatorActor;
    use crate::ice::IceConfig;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spawn_coordinator() -> CoordinatorHandle {
        let directory = DirectoryHandle::new(AccountDirectory::from_accounts(vec![]));
        let (handle, _join) = CoordinatorActor::spawn(
            "sc-test".to_string(),
            directory,
            IceConfig {
                ice_servers: vec![],
            },
            Duration::from_secs(300),
            Duration::from_secs(3600),
            CancellationToken::new(),
        );
        handle
    }

    #[tokio::test]
    async fn test_pull_once_replaces_supplemental_table() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "acme": {"connections": 3, "bitrate": 1500, "audioBitrate": 64}
            })))
            .mount(&mock_server)
            .await;

        let coordinator = spawn_coordinator();
        let client = Client::new();
        let url = format!("{}/stats", mock_server.uri());

        let accounts = pull_once(&client, &coordinator, &url).await.unwrap();
        assert_eq!(accounts, 1);

        let snapshot = coordinator.usage().await.unwrap();
        let usage = snapshot.account("acme");
        assert_eq!(usage.connections, 3);
        assert_eq!(usage.bitrate, 1500);
        assert_eq!(usage.audio_bitrate, 64);
    }

    #[tokio::test]
    async fn test_pull_once_reports_http_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let coordinator = spawn_coordinator();
        let client = Client::new();

        let err = pull_once(&client, &coordinator, &mock_server.uri())
            .await
            .unwrap_err();
        assert!(err.contains("bad status"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_pull_once_reports_malformed_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        let coordinator = spawn_coordinator();
        let client = Client::new();

        let err = pull_once(&client, &coordinator, &mock_server.uri())
            .await
            .unwrap_err();
        assert!(err.contains("malformed body"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_poller_starts_and_stops() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&mock_server)
            .await;

        let coordinator = spawn_coordinator();
        let cancel_token = CancellationToken::new();
        let cancel_clone = cancel_token.clone();

        let handle = tokio::spawn(start_media_stats_poll(
            coordinator,
            mock_server.uri(),
            Duration::from_millis(50),
            cancel_token,
        ));

        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel_clone.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(
            result.is_ok(),
            "Poller should stop within 2 seconds after cancellation"
        );
        result.unwrap().expect("Task should not panic");
    }
}
