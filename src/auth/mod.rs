//! Authentication method descriptors and negotiation.
//!
//! An adapter advertises one or more [`AuthMethod`]s from `get_auth`; the host
//! submits exactly one back to `check_auth_method`.

pub mod broker;
pub mod form;
pub mod negotiator;
pub mod refresh;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credential::AuthData;

pub use broker::{AuthBroker, ChallengeStatus, HttpAuthBroker, TokenRequest};
pub use form::{FormData, FormItem, FormValue};
pub use negotiator::Negotiator;
pub use refresh::{CredentialCell, RefreshPolicy};

/// One negotiation method. Resolution sites match this exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthMethod {
    FormInput(FormData),
    Callback(Callback),
    ScanQrcode(ScanQrcode),
    Refresh(Refresh),
}

impl AuthMethod {
    pub fn kind(&self) -> AuthKind {
        match self {
            AuthMethod::FormInput(_) => AuthKind::FormInput,
            AuthMethod::Callback(_) => AuthKind::Callback,
            AuthMethod::ScanQrcode(_) => AuthKind::ScanQrcode,
            AuthMethod::Refresh(_) => AuthKind::Refresh,
        }
    }
}

/// Fieldless mirror of [`AuthMethod`], used in metadata and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    FormInput,
    Callback,
    ScanQrcode,
    Refresh,
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::FormInput => "form_input",
            AuthKind::Callback => "callback",
            AuthKind::ScanQrcode => "scan_qrcode",
            AuthKind::Refresh => "refresh",
        }
    }
}

impl std::fmt::Display for AuthKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Out-of-band redirect flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callback {
    /// Where the user is sent to authorize.
    pub callback_url: String,
    /// The URL the host received back, carrying an encoded `token` parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum QrcodeImage {
    Url(String),
    Png(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanQrcode {
    pub image: QrcodeImage,
    /// Ties this challenge to its scan confirmation.
    pub correlation_key: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refresh {
    pub auth_data: AuthData,
}

/// Result of advancing a negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Resolved(AuthData),
    /// Not complete yet; the host polls again.
    Pending,
}

impl AuthOutcome {
    pub fn into_option(self) -> Option<AuthData> {
        match self {
            AuthOutcome::Resolved(auth_data) => Some(auth_data),
            AuthOutcome::Pending => None,
        }
    }
}
