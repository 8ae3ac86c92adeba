//! # Error Handling
//!
//! Unified error taxonomy shared by every adapter. Errors surface to the host
//! unchanged; [`PluginError::host_action`] tells the host how to react.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by negotiation, rehydration and adapter operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Malformed or missing method input.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Vendor or broker endpoint returned a failure.
    #[error("upstream error{}: {message}", status_suffix(.status))]
    Upstream {
        status: Option<u16>,
        message: String,
    },
    /// Callback URL could not be decoded into a token.
    #[error("malformed callback: {0}")]
    MalformedCallback(String),
    /// The QR-code scan window lapsed or the challenge was already consumed.
    #[error("qrcode expired")]
    QrcodeExpired,
    /// The refresh token is invalid or revoked; the session is over.
    #[error("refresh rejected: {0}")]
    RefreshRejected(String),
    /// The stored credential expired or failed validation and must be refreshed.
    #[error("credential refresh required: {0}")]
    RefreshRequired(String),
    /// Network or IO failure talking to an external endpoint.
    #[error("transport error: {0}")]
    Transport(String),
    /// Persisted auth data could not be decoded.
    #[error("invalid auth data: {0}")]
    InvalidAuthData(String),
    /// Requested path or entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Operation needs a credential and none is loaded.
    #[error("adapter is not authenticated")]
    NotAuthenticated,
    /// Caller abandoned the operation.
    #[error("operation cancelled")]
    Cancelled,
    /// Local filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, PluginError>;

/// What the host is expected to do with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostAction {
    /// Ask the user for new input or restart from `get_auth`.
    Reprompt,
    /// Transient failure; the host may retry at its discretion.
    RetryLater,
    /// Start a fresh login flow.
    Reauthenticate,
    /// Invoke the refresh method before further calls.
    Refresh,
    /// Not recoverable by auth.
    Fail,
}

impl PluginError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    pub fn upstream<S: Into<String>>(status: Option<u16>, message: S) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    pub fn host_action(&self) -> HostAction {
        match self {
            PluginError::Validation(_)
            | PluginError::QrcodeExpired
            | PluginError::MalformedCallback(_) => HostAction::Reprompt,
            PluginError::Upstream { .. } | PluginError::Transport(_) | PluginError::Cancelled => {
                HostAction::RetryLater
            }
            PluginError::RefreshRejected(_)
            | PluginError::InvalidAuthData(_)
            | PluginError::NotAuthenticated => HostAction::Reauthenticate,
            PluginError::RefreshRequired(_) => HostAction::Refresh,
            PluginError::NotFound(_) | PluginError::Io(_) => HostAction::Fail,
        }
    }

    /// True for upstream failures that indicate the credential itself was refused.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            PluginError::Upstream {
                status: Some(401 | 403),
                ..
            }
        )
    }
}

impl From<reqwest::Error> for PluginError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PluginError::upstream(
                err.status().map(|s| s.as_u16()),
                format!("undecodable response: {err}"),
            )
        } else if let Some(status) = err.status() {
            PluginError::upstream(Some(status.as_u16()), err.to_string())
        } else {
            PluginError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        PluginError::upstream(None, format!("malformed response body: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reprompt_errors() {
        assert_eq!(
            PluginError::validation("bad").host_action(),
            HostAction::Reprompt
        );
        assert_eq!(PluginError::QrcodeExpired.host_action(), HostAction::Reprompt);
    }

    #[test]
    fn refresh_rejected_forces_reauthentication() {
        let err = PluginError::RefreshRejected("invalid_grant".into());
        assert_eq!(err.host_action(), HostAction::Reauthenticate);
    }

    #[test]
    fn transient_errors_retry_later() {
        assert_eq!(
            PluginError::upstream(Some(500), "boom").host_action(),
            HostAction::RetryLater
        );
        assert_eq!(
            PluginError::transport("reset").host_action(),
            HostAction::RetryLater
        );
    }

    #[test]
    fn upstream_display_includes_status() {
        let err = PluginError::upstream(Some(401), "denied");
        assert_eq!(err.to_string(), "upstream error (status 401): denied");
        let err = PluginError::upstream(None, "denied");
        assert_eq!(err.to_string(), "upstream error: denied");
    }

    #[test]
    fn auth_failure_detection() {
        assert!(PluginError::upstream(Some(401), "x").is_auth_failure());
        assert!(PluginError::upstream(Some(403), "x").is_auth_failure());
        assert!(!PluginError::upstream(Some(500), "x").is_auth_failure());
        assert!(!PluginError::transport("x").is_auth_failure());
    }
}
