//! Adapters module
//!
//! This module provides the adapter SDK including:
//! - The `Adapter` trait every storage backend implements
//! - Adapter metadata and the registry used for lookup and construction
//! - The built-in local, alipan and 123pan adapters

pub mod alipan;
pub mod local;
pub mod metadata;
pub mod pan123;
pub mod registry;
pub mod trait_;

pub use metadata::AdapterMetadata;
pub use registry::{AdapterContext, AdapterFactory, Registry, RegistryError};
pub use trait_::{
    Adapter, DEFAULT_PAGE_SIZE, DirEntry, DirEntryRequest, FileEntry, FileResource,
    FileResourceRequest, FileType, Resolution, ResourceData, ResourceType, paginate,
};

pub use alipan::{ALIPAN_PLUGIN_ID, AlipanAdapter, register_alipan_adapter};
pub use local::{LOCAL_PLUGIN_ID, LocalAdapter, register_local_adapter};
pub use pan123::{PAN123_PLUGIN_ID, Pan123Adapter, register_pan123_adapter};
