//! Rebuildable outbound HTTP session.
//!
//! Wraps `reqwest::Client` so a broken connection pool can be replaced with a
//! fresh one between retry attempts. Clones share the same client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::AppConfig;
use crate::error::{PluginError, Result};
use crate::retry::Reconnect;

const USER_AGENT: &str = concat!("plugins/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl HttpSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.http_timeout_seconds),
            connect_timeout: Duration::from_secs(config.http_connect_timeout_seconds),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct HttpSession {
    inner: Arc<RwLock<reqwest::Client>>,
    settings: HttpSettings,
    generation: Arc<AtomicU64>,
}

impl HttpSession {
    pub fn new(settings: HttpSettings) -> Result<Self> {
        let client = Self::build_client(&settings)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(client)),
            settings,
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// `reqwest::Client` is internally `Arc`-ed, so cloning is cheap.
    pub async fn client(&self) -> reqwest::Client {
        self.inner.read().await.clone()
    }

    /// Replaces the pooled client. Requests already holding the old client finish on it.
    pub async fn rebuild(&self) -> Result<()> {
        let client = Self::build_client(&self.settings)?;
        *self.inner.write().await = client;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "rebuilt http session");
        Ok(())
    }

    /// Number of rebuilds so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn build_client(settings: &HttpSettings) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| PluginError::transport(format!("failed to build http client: {e}")))
    }
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("settings", &self.settings)
            .field("generation", &self.generation())
            .finish()
    }
}

#[async_trait]
impl Reconnect for HttpSession {
    async fn reconnect(&self) -> Result<()> {
        self.rebuild().await
    }
}
