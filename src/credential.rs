//! Credential bundle and its persisted byte layout.
//!
//! A record is `[RECORD_VERSION][kind][u32 BE length][JSON payload]`, optionally
//! sealed with [`crate::crypto`]. The host treats the bytes as opaque.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, CryptoKey};
use crate::error::{PluginError, Result};

/// Seconds subtracted from the upstream-reported lifetime.
pub const EXPIRY_SAFETY_MARGIN_SECS: i64 = 300;

/// Leading byte of every unsealed record.
pub const RECORD_VERSION: u8 = 0x10;

const HEADER_LEN: usize = 1 + 1 + 4;

/// Token grant as returned by a broker or vendor token endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    pub expires_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    #[zeroize(skip)]
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Expiry is truncated to whole seconds so it survives a round trip.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: truncate_to_seconds(expires_at),
        }
    }

    /// Builds a credential whose expiry is `now + expires_in - EXPIRY_SAFETY_MARGIN_SECS`.
    ///
    /// A lifetime that does not fit a timestamp is an upstream error.
    pub fn from_token_response(resp: &TokenResponse, now: DateTime<Utc>) -> Result<Self> {
        let expires_at = resp
            .expires_in
            .checked_sub(EXPIRY_SAFETY_MARGIN_SECS)
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                PluginError::upstream(
                    None,
                    format!("token lifetime {}s is out of range", resp.expires_in),
                )
            })?;
        Ok(Self::new(
            resp.access_token.clone(),
            resp.refresh_token.clone(),
            expires_at,
        ))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn truncate_to_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}

/// Opaque blob handed to the host after a successful negotiation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthData {
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthData {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

impl std::fmt::Debug for AuthData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthData")
            .field("len", &self.bytes.len())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// What a record's payload holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// A token credential, possibly embedded in adapter-specific fields.
    Token = 0x01,
    /// Persisted form values.
    Form = 0x02,
}

impl RecordKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(RecordKind::Token),
            0x02 => Some(RecordKind::Form),
            _ => None,
        }
    }
}

pub fn encode_record<T: Serialize>(kind: RecordKind, value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| PluginError::InvalidAuthData(format!("serialize record: {e}")))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| PluginError::InvalidAuthData("record too large".into()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(RECORD_VERSION);
    out.push(kind as u8);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode_record<T: DeserializeOwned>(expected: RecordKind, bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_LEN {
        return Err(PluginError::InvalidAuthData("record truncated".into()));
    }
    if bytes[0] != RECORD_VERSION {
        return Err(PluginError::InvalidAuthData(format!(
            "unsupported record version 0x{:02x}",
            bytes[0]
        )));
    }
    let kind = RecordKind::from_byte(bytes[1])
        .ok_or_else(|| PluginError::InvalidAuthData(format!("unknown record kind {}", bytes[1])))?;
    if kind != expected {
        return Err(PluginError::InvalidAuthData(format!(
            "expected {expected:?} record, found {kind:?}"
        )));
    }
    let len = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != len {
        return Err(PluginError::InvalidAuthData(format!(
            "record length mismatch: header says {len}, found {}",
            payload.len()
        )));
    }
    serde_json::from_slice(payload)
        .map_err(|e| PluginError::InvalidAuthData(format!("record payload: {e}")))
}

/// Encodes and decodes records for one adapter, sealing them when a key is set.
#[derive(Debug, Clone)]
pub struct CredentialCodec {
    plugin_id: String,
    key: Option<CryptoKey>,
}

impl CredentialCodec {
    pub fn new(plugin_id: impl Into<String>, key: Option<CryptoKey>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            key,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn encode<T: Serialize>(&self, kind: RecordKind, value: &T) -> Result<Vec<u8>> {
        let record = encode_record(kind, value)?;
        match &self.key {
            Some(key) => crypto::seal(key, self.plugin_id.as_bytes(), &record)
                .map_err(|e| PluginError::InvalidAuthData(e.to_string())),
            None => Ok(record),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, kind: RecordKind, bytes: &[u8]) -> Result<T> {
        if crypto::is_sealed(bytes) {
            let key = self.key.as_ref().ok_or_else(|| {
                PluginError::InvalidAuthData("auth data is sealed but no key is configured".into())
            })?;
            let record = crypto::open(key, self.plugin_id.as_bytes(), bytes)
                .map_err(|e| PluginError::InvalidAuthData(e.to_string()))?;
            return decode_record(kind, &record);
        }
        decode_record(kind, bytes)
    }

    pub fn encode_credential(&self, credential: &Credential) -> Result<AuthData> {
        Ok(AuthData {
            bytes: self.encode(RecordKind::Token, credential)?,
            expires_at: Some(credential.expires_at),
        })
    }

    pub fn decode_credential(&self, bytes: &[u8]) -> Result<Credential> {
        self.decode(RecordKind::Token, bytes)
    }
}
