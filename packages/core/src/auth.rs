//! Per-process authentication grants.
//!
//! A process identifier moves from unauthenticated to authenticated once the
//! user confirms their presence, and falls back to unauthenticated when its
//! grant expires. Expiry is checked lazily on every read; there is no
//! background sweep.
//!
//! The grant table is shared by every connection handler and every access
//! goes through its mutex. The lock is never held while the presence prompt
//! is on screen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default lifetime of a grant.
pub const DEFAULT_AUTH_DURATION: Duration = Duration::from_secs(60 * 60);

/// Longest grant lifetime; longer durations are clamped to it.
pub const MAX_AUTH_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A blocking user-presence confirmation (biometric, password, terminal...).
///
/// Implementations return `true` only when the user explicitly confirmed.
pub trait PresenceCheck: Send + Sync {
    fn confirm(&self, reason: &str) -> bool;
}

impl<F> PresenceCheck for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn confirm(&self, reason: &str) -> bool {
        self(reason)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("process_id is required")]
    MissingProcessId,
}

/// In-memory grant store gating secret access.
pub struct Authenticator {
    grants: Mutex<HashMap<String, Instant>>,
    auth_duration: Duration,
    presence: Arc<dyn PresenceCheck>,
}

impl Authenticator {
    pub fn new(auth_duration: Duration, presence: Arc<dyn PresenceCheck>) -> Self {
        if auth_duration > MAX_AUTH_DURATION {
            tracing::warn!(
                requested_secs = auth_duration.as_secs(),
                max_secs = MAX_AUTH_DURATION.as_secs(),
                "auth duration clamped"
            );
        }
        Self {
            grants: Mutex::new(HashMap::new()),
            auth_duration: auth_duration.min(MAX_AUTH_DURATION),
            presence,
        }
    }

    pub fn auth_duration(&self) -> Duration {
        self.auth_duration
    }

    /// Authenticate `process_id` for access to `secret_names`.
    ///
    /// Returns `Ok(true)` immediately when a valid grant already exists,
    /// without prompting again. Otherwise prompts once; a denial yields
    /// `Ok(false)` and records nothing.
    pub fn authenticate(&self, process_id: &str, secret_names: &[String]) -> Result<bool, AuthError> {
        if process_id.is_empty() {
            return Err(AuthError::MissingProcessId);
        }

        if self.is_authenticated(process_id) {
            tracing::debug!(process_id, "reusing existing grant");
            return Ok(true);
        }

        let reason = format!(
            "imbued would like to authenticate process {} to hydrate your environment ({} secret(s))",
            process_id,
            secret_names.len()
        );
        if !self.presence.confirm(&reason) {
            tracing::info!(process_id, "user presence check denied");
            return Ok(false);
        }

        let now = Instant::now();
        let expiry = now
            .checked_add(self.auth_duration)
            .or_else(|| now.checked_add(DEFAULT_AUTH_DURATION))
            .unwrap_or(now);
        self.lock().insert(process_id.to_string(), expiry);
        tracing::info!(
            process_id,
            secrets = ?secret_names,
            valid_for_secs = self.auth_duration.as_secs(),
            "process authenticated"
        );

        Ok(true)
    }

    /// Whether `process_id` currently holds a valid grant.
    pub fn is_authenticated(&self, process_id: &str) -> bool {
        self.is_authenticated_at(process_id, Instant::now())
    }

    /// Same as [`is_authenticated`](Self::is_authenticated), evaluated at `now`.
    ///
    /// A grant whose expiry lies before `now` is evicted and can never be
    /// reported valid again.
    pub fn is_authenticated_at(&self, process_id: &str, now: Instant) -> bool {
        let mut grants = self.lock();
        match grants.get(process_id) {
            None => false,
            Some(expiry) if now > *expiry => {
                grants.remove(process_id);
                tracing::debug!(process_id, "grant expired");
                false
            }
            Some(_) => true,
        }
    }

    /// Expiry of the current grant, if any. Does not evict.
    pub fn expires_at(&self, process_id: &str) -> Option<Instant> {
        self.lock().get(process_id).copied()
    }

    /// Advisory hook called after secrets were handed out.
    pub fn record_access(&self, process_id: &str, secret_names: &[String]) {
        tracing::info!(process_id, secrets = ?secret_names, "secrets accessed");
    }

    /// Number of grants currently held, expired or not.
    pub fn grant_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        // The map is valid after any panic mid-insert, so poisoning is ignored.
        self.grants.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("auth_duration", &self.auth_duration)
            .field("grants", &self.grant_count())
            .finish()
    }
}
