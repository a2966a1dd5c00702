//! External credential verification.
//!
//! Accounts may carry a `loginUrl` property pointing at the platform that
//! owns their users. When a client supplies `user`/`pin` at handshake, this
//! verifier POSTs `{token, username, pin}` to that URL and expects
//! `{login: bool, message?}` back. Any transport failure or timeout is a
//! login failure for that handshake, never a process fault.

use crate::errors::{AuthError, ScError};
use crate::observability::metrics;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Connect-phase ceiling, separate from the overall request timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Message returned when the platform rejects a login without saying why.
const DEFAULT_REJECTION_MESSAGE: &str = "Login failed";

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    token: &'a str,
    username: &'a str,
    pin: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    login: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Client for the external login-verification call.
#[derive(Debug, Clone)]
pub struct CredentialVerifier {
    client: reqwest::Client,
}

impl CredentialVerifier {
    /// Build a verifier whose requests are bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Internal` if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, ScError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .build()
            .map_err(|e| {
                warn!(target: "sc.accounts", error = %e, "Failed to build verification client");
                ScError::Internal(format!("http client build failed: {e}"))
            })?;
        Ok(Self { client })
    }

    /// Verify `username`/`pin` against the account's login URL.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::LoginRejected` when the platform rejects the
    /// credentials or cannot be reached in time.
    #[instrument(skip_all, fields(username = %username))]
    pub async fn verify(
        &self,
        login_url: &str,
        token: &str,
        username: &str,
        pin: &str,
    ) -> Result<(), AuthError> {
        let start = Instant::now();

        let response = self
            .client
            .post(login_url)
            .json(&VerifyRequest {
                token,
                username,
                pin,
            })
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let status = if e.is_timeout() { "timeout" } else { "error" };
                metrics::record_verification(status, start.elapsed());
                warn!(
                    target: "sc.accounts",
                    username = %username,
                    error = %e,
                    "Verification request failed"
                );
                return Err(AuthError::LoginRejected(
                    DEFAULT_REJECTION_MESSAGE.to_string(),
                ));
            }
        };

        if !response.status().is_success() {
            metrics::record_verification("error", start.elapsed());
            warn!(
                target: "sc.accounts",
                username = %username,
                status = %response.status(),
                "Verification endpoint returned non-success status"
            );
            return Err(AuthError::LoginRejected(
                DEFAULT_REJECTION_MESSAGE.to_string(),
            ));
        }

        let body: VerifyResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                metrics::record_verification("error", start.elapsed());
                warn!(
                    target: "sc.accounts",
                    username = %username,
                    error = %e,
                    "Verification response was not valid JSON"
                );
                return Err(AuthError::LoginRejected(
                    DEFAULT_REJECTION_MESSAGE.to_string(),
                ));
            }
        };

        if body.login {
            metrics::record_verification("accepted", start.elapsed());
            debug!(target: "sc.accounts", username = %username, "Login verified");
            Ok(())
        } else {
            metrics::record_verification("rejected", start.elapsed());
            let message = body
                .message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_REJECTION_MESSAGE.to_string());
            debug!(
                target: "sc.accounts",
                username = %username,
                message = %message,
                "Login rejected by platform"
            );
            Err(AuthError::LoginRejected(message))
        }
    }
}
