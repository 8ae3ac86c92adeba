//! Credential refresh policy.
//!
//! Refresh is host-driven: nothing here schedules timers. The policy answers
//! "is this credential still usable" and shapes failures so the host knows
//! whether to refresh or start over.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::auth::{AuthMethod, Refresh};
use crate::credential::{AuthData, Credential};
use crate::error::{PluginError, Result};

/// Classification of refresh errors for handling strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshErrorClassification {
    /// The refresh token is dead; the user must log in again.
    Permanent,
    /// Transient error (5xx, network issues) - retry later
    Transient,
    /// Rate limited - backoff and retry
    RateLimited,
}

/// Classify a refresh error message by the OAuth error codes it mentions.
pub fn classify_refresh_error(error_str: &str) -> RefreshErrorClassification {
    let lower = error_str.to_lowercase();

    const PERMANENT: &[&str] = &[
        "invalid_grant",
        "invalid_client",
        "unauthorized_client",
        "revoked",
        "forbidden",
        "access_denied",
        "unsupported_grant_type",
    ];
    const RATE_LIMITED: &[&str] = &[
        "rate_limit",
        "too_many_requests",
        "temporarily_unavailable",
        "quota_exceeded",
    ];

    if PERMANENT.iter().any(|needle| lower.contains(needle)) {
        RefreshErrorClassification::Permanent
    } else if RATE_LIMITED.iter().any(|needle| lower.contains(needle)) {
        RefreshErrorClassification::RateLimited
    } else {
        RefreshErrorClassification::Transient
    }
}

pub struct RefreshPolicy;

impl RefreshPolicy {
    pub fn is_expired(credential: &Credential, now: DateTime<Utc>) -> bool {
        credential.is_expired(now)
    }

    /// True when persisted auth data carries an expiry that has passed.
    pub fn needs_refresh(auth_data: &AuthData, now: DateTime<Utc>) -> bool {
        auth_data.is_expired(now)
    }

    /// Descriptor the host submits to renew `auth_data`.
    pub fn refresh_method(auth_data: AuthData) -> AuthMethod {
        AuthMethod::Refresh(Refresh { auth_data })
    }

    /// Maps a failed refresh exchange. Permanent rejections end the session;
    /// everything else is returned unchanged for the host to retry.
    pub fn on_refresh_failure(err: PluginError) -> PluginError {
        match err {
            PluginError::Upstream { status, message } => {
                let classification = classify_refresh_error(&message);
                if matches!(status, Some(401 | 403))
                    || classification == RefreshErrorClassification::Permanent
                {
                    PluginError::RefreshRejected(message)
                } else {
                    PluginError::Upstream { status, message }
                }
            }
            other => other,
        }
    }

    /// Maps a failed identity probe during rehydration. Auth-specific failures
    /// ask the host to refresh instead of retrying.
    pub fn on_validation_failure(err: PluginError) -> PluginError {
        match err {
            PluginError::Upstream { status, message } => {
                if matches!(status, Some(401 | 403))
                    || classify_refresh_error(&message) == RefreshErrorClassification::Permanent
                {
                    warn!(?status, "credential rejected during validation");
                    PluginError::RefreshRequired(message)
                } else {
                    PluginError::Upstream { status, message }
                }
            }
            other => other,
        }
    }

    /// Rejects a credential that is already past its expiry.
    pub fn ensure_usable(credential: &Credential, now: DateTime<Utc>) -> Result<()> {
        if credential.is_expired(now) {
            return Err(PluginError::RefreshRequired(format!(
                "credential expired at {}",
                credential.expires_at
            )));
        }
        Ok(())
    }
}

/// The adapter's live credential.
///
/// Readers take a cheap `Arc` clone, so a replacement never invalidates a
/// request already in flight.
#[derive(Debug, Default)]
pub struct CredentialCell {
    inner: RwLock<Option<Arc<Credential>>>,
}

impl CredentialCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<Credential>> {
        self.inner
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    pub fn replace(&self, credential: Credential) -> Option<Arc<Credential>> {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        guard.replace(Arc::new(credential))
    }

    pub fn is_loaded(&self) -> bool {
        self.current().is_some()
    }

    /// The current credential if one is loaded and not expired.
    pub fn require_fresh(&self, now: DateTime<Utc>) -> Result<Arc<Credential>> {
        let credential = self.current().ok_or(PluginError::NotAuthenticated)?;
        RefreshPolicy::ensure_usable(&credential, now)?;
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_classify_refresh_error_permanent() {
        let cases = [
            "invalid_grant",
            "Invalid_Client",
            "unauthorized_client",
            "Token has been revoked",
            "Forbidden",
            "access_denied",
            "unsupported_grant_type",
        ];
        for case in cases {
            assert_eq!(
                classify_refresh_error(case),
                RefreshErrorClassification::Permanent,
                "{case}"
            );
        }
    }

    #[test]
    fn test_classify_refresh_error_rate_limited() {
        assert_eq!(
            classify_refresh_error("too_many_requests"),
            RefreshErrorClassification::RateLimited
        );
        assert_eq!(
            classify_refresh_error("quota_exceeded for app"),
            RefreshErrorClassification::RateLimited
        );
    }

    #[test]
    fn test_classify_refresh_error_transient() {
        assert_eq!(
            classify_refresh_error("502 bad gateway"),
            RefreshErrorClassification::Transient
        );
    }

    #[test]
    fn refresh_failure_mapping() {
        let rejected = RefreshPolicy::on_refresh_failure(PluginError::upstream(
            Some(400),
            "invalid_grant: refresh token revoked",
        ));
        assert!(matches!(rejected, PluginError::RefreshRejected(_)));

        let unauthorized =
            RefreshPolicy::on_refresh_failure(PluginError::upstream(Some(401), "nope"));
        assert!(matches!(unauthorized, PluginError::RefreshRejected(_)));

        let transient =
            RefreshPolicy::on_refresh_failure(PluginError::upstream(Some(503), "unavailable"));
        assert!(matches!(transient, PluginError::Upstream { status: Some(503), .. }));

        let transport = RefreshPolicy::on_refresh_failure(PluginError::transport("reset"));
        assert!(matches!(transport, PluginError::Transport(_)));
    }

    #[test]
    fn validation_failure_mapping() {
        let mapped =
            RefreshPolicy::on_validation_failure(PluginError::upstream(Some(401), "expired token"));
        assert!(matches!(mapped, PluginError::RefreshRequired(_)));

        let untouched =
            RefreshPolicy::on_validation_failure(PluginError::upstream(Some(500), "oops"));
        assert!(matches!(untouched, PluginError::Upstream { .. }));
    }

    #[test]
    fn needs_refresh_uses_expiry() {
        let now = Utc::now();
        let stale = AuthData {
            bytes: vec![],
            expires_at: Some(now - Duration::seconds(1)),
        };
        let fresh = AuthData {
            bytes: vec![],
            expires_at: Some(now + Duration::seconds(60)),
        };
        let forever = AuthData {
            bytes: vec![],
            expires_at: None,
        };
        assert!(RefreshPolicy::needs_refresh(&stale, now));
        assert!(!RefreshPolicy::needs_refresh(&fresh, now));
        assert!(!RefreshPolicy::needs_refresh(&forever, now));
        assert!(matches!(
            RefreshPolicy::refresh_method(stale),
            AuthMethod::Refresh(_)
        ));
    }

    #[test]
    fn cell_keeps_old_arc_for_in_flight_readers() {
        let now = Utc::now();
        let cell = CredentialCell::new();
        assert!(matches!(
            cell.require_fresh(now),
            Err(PluginError::NotAuthenticated)
        ));

        cell.replace(Credential::new("old", "r", now + Duration::hours(1)));
        let in_flight = cell.current().expect("loaded");
        cell.replace(Credential::new("new", "r", now + Duration::hours(2)));

        assert_eq!(in_flight.access_token, "old");
        assert_eq!(cell.require_fresh(now).expect("fresh").access_token, "new");
    }

    #[test]
    fn expired_cell_requires_refresh() {
        let now = Utc::now();
        let cell = CredentialCell::new();
        cell.replace(Credential::new("a", "r", now - Duration::seconds(5)));
        assert!(matches!(
            cell.require_fresh(now),
            Err(PluginError::RefreshRequired(_))
        ));
        assert!(RefreshPolicy::is_expired(&cell.current().expect("loaded"), now));
    }
}
