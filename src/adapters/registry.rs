//! Adapter registry
//!
//! Maps plugin ids to factories. Every `create` call builds a fresh instance,
//! so no state is shared between adapter instances.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapters::{Adapter, AdapterMetadata};
use crate::auth::{AuthBroker, HttpAuthBroker};
use crate::config::AppConfig;
use crate::credential::CredentialCodec;
use crate::crypto::CryptoKey;
use crate::error::{PluginError, Result};
use crate::http_client::{HttpSession, HttpSettings};

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Adapter '{id}' not found")]
    AdapterNotFound { id: String },
    #[error("Adapter '{id}' failed to initialize: {source}")]
    Init {
        id: String,
        #[source]
        source: PluginError,
    },
}

/// Collaborators handed to adapter factories.
#[derive(Clone)]
pub struct AdapterContext {
    pub config: Arc<AppConfig>,
    pub broker: Arc<dyn AuthBroker>,
    pub session: HttpSession,
    pub crypto_key: Option<CryptoKey>,
}

impl AdapterContext {
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let session = HttpSession::new(HttpSettings::from_config(&config))?;
        let broker: Arc<dyn AuthBroker> = Arc::new(HttpAuthBroker::new(
            config.auth_server_addr.clone(),
            session.clone(),
        ));
        let crypto_key = config
            .crypto_key
            .clone()
            .map(CryptoKey::new)
            .transpose()
            .map_err(|e| PluginError::validation(e.to_string()))?;
        Ok(Self {
            config: Arc::new(config),
            broker,
            session,
            crypto_key,
        })
    }

    /// Replaces the broker, e.g. with a test double.
    pub fn with_broker(mut self, broker: Arc<dyn AuthBroker>) -> Self {
        self.broker = broker;
        self
    }

    pub fn codec(&self, plugin_id: &str) -> CredentialCodec {
        CredentialCodec::new(plugin_id, self.crypto_key.clone())
    }
}

pub type AdapterFactory = Arc<dyn Fn(&AdapterContext) -> Result<Arc<dyn Adapter>> + Send + Sync>;

/// Adapter registry that stores factories and their metadata
#[derive(Clone, Default)]
pub struct Registry {
    factories: HashMap<String, AdapterFactory>,
    metadata: HashMap<String, AdapterMetadata>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every adapter this crate ships.
    pub fn with_builtin_adapters() -> Self {
        let mut registry = Self::new();
        crate::adapters::local::register_local_adapter(&mut registry);
        crate::adapters::alipan::register_alipan_adapter(&mut registry);
        crate::adapters::pan123::register_pan123_adapter(&mut registry);
        registry
    }

    pub fn register(&mut self, metadata: AdapterMetadata, factory: AdapterFactory) {
        let id = metadata.id.clone();
        self.factories.insert(id.clone(), factory);
        self.metadata.insert(id, metadata);
    }

    /// Builds a new, unauthenticated instance of `id`.
    pub fn create(
        &self,
        id: &str,
        context: &AdapterContext,
    ) -> std::result::Result<Arc<dyn Adapter>, RegistryError> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| RegistryError::AdapterNotFound { id: id.to_string() })?;
        factory(context).map_err(|source| RegistryError::Init {
            id: id.to_string(),
            source,
        })
    }

    /// Get metadata for all adapters, sorted by id for stable ordering
    pub fn list_metadata(&self) -> Vec<AdapterMetadata> {
        let mut metadata: Vec<_> = self.metadata.values().cloned().collect();
        metadata.sort_by(|a, b| a.id.cmp(&b.id));
        metadata
    }

    pub fn get_metadata(&self, id: &str) -> std::result::Result<&AdapterMetadata, RegistryError> {
        self.metadata
            .get(id)
            .ok_or_else(|| RegistryError::AdapterNotFound { id: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthKind;

    fn context() -> AdapterContext {
        AdapterContext::from_config(AppConfig::default()).expect("context builds")
    }

    #[test]
    fn builtin_metadata_sorted() {
        let registry = Registry::with_builtin_adapters();
        let ids: Vec<_> = registry
            .list_metadata()
            .into_iter()
            .map(|metadata| metadata.id)
            .collect();
        assert_eq!(ids, vec!["123pan", "alipan", "local"]);
    }

    #[test]
    fn metadata_lists_auth_kinds() {
        let registry = Registry::with_builtin_adapters();
        let alipan = registry.get_metadata("alipan").expect("registered");
        assert!(alipan.supports(AuthKind::Callback));
        assert!(alipan.supports(AuthKind::ScanQrcode));
        assert!(!alipan.supports(AuthKind::FormInput));
    }

    #[test]
    fn unknown_adapter_errors() {
        let registry = Registry::with_builtin_adapters();
        assert!(matches!(
            registry.get_metadata("ftp"),
            Err(RegistryError::AdapterNotFound { .. })
        ));
        assert!(matches!(
            registry.create("ftp", &context()),
            Err(RegistryError::AdapterNotFound { .. })
        ));
    }

    #[test]
    fn create_builds_independent_instances() {
        let registry = Registry::with_builtin_adapters();
        let context = context();
        let a = registry.create("local", &context).expect("created");
        let b = registry.create("local", &context).expect("created");
        assert_eq!(a.plugin_id(), "local");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn invalid_crypto_key_fails_context() {
        let config = AppConfig {
            crypto_key: Some(vec![0u8; 8]),
            ..AppConfig::default()
        };
        assert!(AdapterContext::from_config(config).is_err());
    }
}
