//! Adapter metadata types

use serde::{Deserialize, Serialize};

use crate::auth::AuthKind;

/// Metadata about an adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterMetadata {
    /// Stable plugin id, also the registry key
    pub id: String,
    pub display_name: String,
    /// Methods `get_auth` may advertise
    pub auth_kinds: Vec<AuthKind>,
}

impl AdapterMetadata {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        auth_kinds: Vec<AuthKind>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            auth_kinds,
        }
    }

    pub fn supports(&self, kind: AuthKind) -> bool {
        self.auth_kinds.contains(&kind)
    }
}
