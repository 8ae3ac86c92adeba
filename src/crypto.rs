//! Credential sealing using AES-256-GCM
//!
//! Serialized credential records can be sealed before they are handed to the
//! host. The plugin id is bound as additional authenticated data (AAD) so a
//! blob issued by one adapter is rejected by every other adapter.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const VERSION_SEALED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_SEALED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("sealing failed: {0}")]
    SealFailed(String),
    #[error("unsealing failed: {0}")]
    OpenFailed(String),
    #[error("invalid sealed payload format")]
    InvalidFormat,
    #[error("empty payload")]
    EmptyPayload,
}

/// Secure wrapper for sealing keys with zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey(Vec<u8>);

impl CryptoKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(CryptoKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptoKey([REDACTED])")
    }
}

/// Seal bytes using AES-256-GCM
pub fn seal(key: &CryptoKey, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::SealFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_SEALED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);
    Ok(result)
}

/// Open a sealed payload. The caller must check [`is_sealed`] first; unsealed
/// payloads are rejected here.
pub fn open(key: &CryptoKey, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.is_empty() {
        return Err(CryptoError::EmptyPayload);
    }
    if sealed[0] != VERSION_SEALED || sealed.len() < MIN_SEALED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&sealed[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &sealed[VERSION_FIELD_LEN + NONCE_LEN..];

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::OpenFailed(e.to_string()))
}

/// Determine if a payload is using the sealed format
pub fn is_sealed(payload: &[u8]) -> bool {
    payload.len() >= MIN_SEALED_LEN && payload[0] == VERSION_SEALED
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> CryptoKey {
        CryptoKey::new(vec![7u8; 32]).expect("valid test key")
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = test_key();
        let sealed = seal(&key, b"alipan", b"record").expect("seal succeeds");
        assert!(is_sealed(&sealed));
        let opened = open(&key, b"alipan", &sealed).expect("open succeeds");
        assert_eq!(opened, b"record");
    }

    #[test]
    fn other_plugin_cannot_open() {
        let key = test_key();
        let sealed = seal(&key, b"alipan", b"record").expect("seal succeeds");
        assert!(open(&key, b"123pan", &sealed).is_err());
    }

    #[test]
    fn tampered_payload_fails() {
        let key = test_key();
        let mut sealed = seal(&key, b"local", b"record").expect("seal succeeds");
        sealed[13] ^= 0x01;
        assert!(matches!(
            open(&key, b"local", &sealed),
            Err(CryptoError::OpenFailed(_))
        ));
    }

    #[test]
    fn nonces_differ_between_seals() {
        let key = test_key();
        let a = seal(&key, b"local", b"record").expect("seal succeeds");
        let b = seal(&key, b"local", b"record").expect("seal succeeds");
        assert_ne!(&a[1..13], &b[1..13]);
    }

    #[test]
    fn short_or_unversioned_payload_rejected() {
        let key = test_key();
        assert!(matches!(
            open(&key, b"local", &[VERSION_SEALED, 0x02]),
            Err(CryptoError::InvalidFormat)
        ));
        assert!(matches!(
            open(&key, b"local", &[0x10; 40]),
            Err(CryptoError::InvalidFormat)
        ));
        assert!(matches!(
            open(&key, b"local", &[]),
            Err(CryptoError::EmptyPayload)
        ));
        assert!(!is_sealed(&[0x10; 40]));
    }

    #[test]
    fn invalid_key_length_rejected() {
        assert!(matches!(
            CryptoKey::new(vec![0u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
        assert!(CryptoKey::new(vec![0u8; 64]).is_err());
    }

    #[test]
    fn debug_does_not_leak_key() {
        assert_eq!(format!("{:?}", test_key()), "CryptoKey([REDACTED])");
    }
}
