//! Configuration loading
//!
//! Values come from layered `.env` files and `PLUGINS_*` environment variables.
//! Later layers win: `.env`, `.env.local`, `.env.{profile}`,
//! `.env.{profile}.local`, then the process environment.

use std::{collections::BTreeMap, env, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "PLUGINS_";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `json` or `pretty`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Base address of the auth broker
    #[serde(default = "default_auth_server_addr")]
    pub auth_server_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_connect_timeout_seconds")]
    pub http_connect_timeout_seconds: u64,
    /// Lifetime advertised for QR-code challenges
    #[serde(default = "default_qrcode_ttl_seconds")]
    pub qrcode_ttl_seconds: u64,
    /// Attempt budget for retry-with-reconnect
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// 32-byte key for sealing auth data; unsealed when absent
    #[serde(default)]
    pub crypto_key: Option<Vec<u8>>,
    #[serde(default = "default_alipan_api_base")]
    pub alipan_api_base: String,
    #[serde(default = "default_pan123_api_base")]
    pub pan123_api_base: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            auth_server_addr: default_auth_server_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_connect_timeout_seconds: default_http_connect_timeout_seconds(),
            qrcode_ttl_seconds: default_qrcode_ttl_seconds(),
            reconnect_attempts: default_reconnect_attempts(),
            crypto_key: None,
            alipan_api_base: default_alipan_api_base(),
            pan123_api_base: default_pan123_api_base(),
        }
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if self.crypto_key.is_some() {
            value["CRYPTO_KEY"] = serde_json::Value::String("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&value)
    }

    /// Validates the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref key) = self.crypto_key {
            if key.len() != 32 {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
        }

        for (field, value) in [
            ("AUTH_SERVER_ADDR", &self.auth_server_addr),
            ("ALIPAN_API_BASE", &self.alipan_api_base),
            ("PAN123_API_BASE", &self.pan123_api_base),
        ] {
            Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
                field,
                value: value.clone(),
                source,
            })?;
        }

        if self.http_timeout_seconds == 0 {
            return Err(ConfigError::InvalidTimeout {
                field: "HTTP_TIMEOUT_SECONDS",
            });
        }
        if self.http_connect_timeout_seconds == 0 {
            return Err(ConfigError::InvalidTimeout {
                field: "HTTP_CONNECT_TIMEOUT_SECONDS",
            });
        }
        if !(30..=900).contains(&self.qrcode_ttl_seconds) {
            return Err(ConfigError::InvalidQrcodeTtl {
                value: self.qrcode_ttl_seconds,
            });
        }
        if !(1..=10).contains(&self.reconnect_attempts) {
            return Err(ConfigError::InvalidReconnectAttempts {
                value: self.reconnect_attempts,
            });
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }
        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_auth_server_addr() -> String {
    "http://127.0.0.1:19971".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_connect_timeout_seconds() -> u64 {
    10
}

fn default_qrcode_ttl_seconds() -> u64 {
    180
}

fn default_reconnect_attempts() -> u32 {
    crate::retry::DEFAULT_RECONNECT_ATTEMPTS
}

fn default_alipan_api_base() -> String {
    "https://openapi.alipan.com".to_string()
}

fn default_pan123_api_base() -> String {
    "https://open-api.123pan.com".to_string()
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read env file {path:?}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid value '{value}' for {field}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("invalid URL '{value}' for {field}: {source}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        source: url::ParseError,
    },
    #[error("{field} must be greater than zero")]
    InvalidTimeout { field: &'static str },
    #[error("qrcode ttl must be between 30 and 900 seconds, got {value}")]
    InvalidQrcodeTtl { value: u64 },
    #[error("reconnect attempts must be between 1 and 10, got {value}")]
    InvalidReconnectAttempts { value: u32 },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
}

/// Loads configuration using layered `.env` files and `PLUGINS_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let defaults = AppConfig::default();
        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or(defaults.log_level);
        let log_format = take_string(&mut layered, "LOG_FORMAT").unwrap_or(defaults.log_format);
        let auth_server_addr =
            take_string(&mut layered, "AUTH_SERVER_ADDR").unwrap_or(defaults.auth_server_addr);
        let http_timeout_seconds = take_number(&mut layered, "HTTP_TIMEOUT_SECONDS")?
            .unwrap_or(defaults.http_timeout_seconds);
        let http_connect_timeout_seconds =
            take_number(&mut layered, "HTTP_CONNECT_TIMEOUT_SECONDS")?
                .unwrap_or(defaults.http_connect_timeout_seconds);
        let qrcode_ttl_seconds = take_number(&mut layered, "QRCODE_TTL_SECONDS")?
            .unwrap_or(defaults.qrcode_ttl_seconds);
        let reconnect_attempts = take_number(&mut layered, "RECONNECT_ATTEMPTS")?
            .unwrap_or(defaults.reconnect_attempts);
        let alipan_api_base =
            take_string(&mut layered, "ALIPAN_API_BASE").unwrap_or(defaults.alipan_api_base);
        let pan123_api_base =
            take_string(&mut layered, "PAN123_API_BASE").unwrap_or(defaults.pan123_api_base);

        let crypto_key = match take_string(&mut layered, "CRYPTO_KEY") {
            Some(key_str) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(key_str.trim()).map_err(|e| {
                    ConfigError::InvalidCryptoKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            auth_server_addr,
            http_timeout_seconds,
            http_connect_timeout_seconds,
            qrcode_ttl_seconds,
            reconnect_attempts,
            crypto_key,
            alipan_api_base,
            pan123_api_base,
        };
        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered.remove(key).filter(|v| !v.trim().is_empty())
}

fn take_number<T: std::str::FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match take_string(layered, key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber {
                field: key,
                value: raw,
            }),
        None => Ok(None),
    }
}
