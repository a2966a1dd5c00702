//! Handshake authentication: rate limiting, directory lookup, suspension,
//! and optional external login verification.
//!
//! Order matters: the per-IP limiter is consulted before any directory work,
//! so a blocked address costs nothing but a map lookup.

use crate::accounts::directory::{Account, DirectoryHandle};
use crate::accounts::verify::CredentialVerifier;
use crate::errors::AuthError;
use crate::observability::metrics;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Failed handshakes per window before an address is blocked.
const DEFAULT_MAX_FAILURES: u32 = 5;

/// Sliding window over which failures are counted.
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// How long a blocked address stays blocked.
const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(60);

/// Per-address failure tracking.
#[derive(Debug, Default)]
struct AddressEntry {
    failures: Vec<Instant>,
    blocked_until: Option<Instant>,
}

impl AddressEntry {
    fn drop_expired(&mut self, window: Duration) {
        let now = Instant::now();
        self.failures.retain(|t| now.duration_since(*t) < window);
    }

    fn is_blocked(&self) -> bool {
        self.blocked_until.is_some_and(|until| Instant::now() < until)
    }
}

/// Sliding-window rate limiter over failed handshakes, keyed by client IP.
#[derive(Debug, Clone)]
pub struct HandshakeLimiter {
    max_failures: u32,
    window: Duration,
    block_duration: Duration,
    entries: Arc<Mutex<HashMap<IpAddr, AddressEntry>>>,
}

impl Default for HandshakeLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FAILURES, DEFAULT_WINDOW, DEFAULT_BLOCK_DURATION)
    }
}

impl HandshakeLimiter {
    #[must_use]
    pub fn new(max_failures: u32, window: Duration, block_duration: Duration) -> Self {
        Self {
            max_failures,
            window,
            block_duration,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, AddressEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a handshake from this address may proceed.
    #[must_use]
    pub fn check(&self, ip: IpAddr) -> bool {
        self.lock().get(&ip).is_none_or(|entry| !entry.is_blocked())
    }

    /// Record a failed handshake. Returns true when the address is now
    /// blocked.
    pub fn record_failure(&self, ip: IpAddr) -> bool {
        let mut entries = self.lock();
        let entry = entries.entry(ip).or_default();
        entry.drop_expired(self.window);

        if entry.is_blocked() {
            return true;
        }

        entry.failures.push(Instant::now());
        if entry.failures.len() as u32 >= self.max_failures {
            entry.blocked_until = Some(Instant::now() + self.block_duration);
            entry.failures.clear();
            warn!(
                target: "sc.accounts",
                ip = %ip,
                block_seconds = self.block_duration.as_secs(),
                "Address blocked after repeated failed handshakes"
            );
            true
        } else {
            false
        }
    }

    /// Record a successful handshake, clearing the failure window.
    pub fn record_success(&self, ip: IpAddr) {
        if let Some(entry) = self.lock().get_mut(&ip) {
            entry.failures.clear();
        }
    }

    /// Drop entries with no live block and no recent failures.
    pub fn sweep(&self) {
        let window = self.window;
        self.lock().retain(|_, entry| {
            entry.drop_expired(window);
            entry.is_blocked() || !entry.failures.is_empty()
        });
    }
}

/// Result of a successful handshake: the resolved account and, when external
/// verification ran, the username the connection is bound to.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub account: Arc<Account>,
    pub user: Option<String>,
}

/// Handshake authenticator: limiter, then directory, then verification.
#[derive(Debug, Clone)]
pub struct Authenticator {
    directory: DirectoryHandle,
    verifier: CredentialVerifier,
    limiter: HandshakeLimiter,
}

impl Authenticator {
    #[must_use]
    pub fn new(directory: DirectoryHandle, verifier: CredentialVerifier) -> Self {
        Self {
            directory,
            verifier,
            limiter: HandshakeLimiter::default(),
        }
    }

    #[must_use]
    pub fn with_limiter(mut self, limiter: HandshakeLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Authenticate a `connect` handshake.
    ///
    /// # Errors
    ///
    /// Returns the refusal reason; every refusal except `RateLimited` counts
    /// against the address's failure window.
    #[instrument(skip_all, fields(ip = %ip))]
    pub async fn authenticate(
        &self,
        ip: IpAddr,
        token: &str,
        user: Option<&str>,
        pin: Option<&str>,
    ) -> Result<AuthGrant, AuthError> {
        if !self.limiter.check(ip) {
            metrics::record_handshake("rate_limited");
            return Err(AuthError::RateLimited);
        }

        let directory = self.directory.snapshot().await;
        let Some(account) = directory.by_token(token) else {
            self.limiter.record_failure(ip);
            metrics::record_handshake("invalid_token");
            debug!(target: "sc.accounts", ip = %ip, "Handshake with unknown token");
            return Err(AuthError::InvalidToken);
        };

        if account.is_suspended() {
            self.limiter.record_failure(ip);
            metrics::record_handshake("suspended");
            debug!(
                target: "sc.accounts",
                account = %account.name,
                "Handshake refused for suspended account"
            );
            return Err(AuthError::Suspended);
        }

        let mut bound_user = None;
        if let (Some(login_url), Some(user)) = (account.login_url(), user) {
            if let Err(e) = self
                .verifier
                .verify(login_url, token, user, pin.unwrap_or_default())
                .await
            {
                self.limiter.record_failure(ip);
                metrics::record_handshake("login_rejected");
                return Err(e);
            }
            bound_user = Some(user.to_string());
        }

        self.limiter.record_success(ip);
        metrics::record_handshake("success");
        debug!(
            target: "sc.accounts",
            account = %account.name,
            user = bound_user.as_deref().unwrap_or("-"),
            "Handshake authenticated"
        );

        Ok(AuthGrant {
            account,
            user: bound_user,
        })
    }
}
