//! Adapter trait definition
//!
//! Defines the contract every storage backend exposes to the host.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::auth::AuthMethod;
use crate::credential::AuthData;
use crate::error::Result;

pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub file_type: FileType,
    pub size: u64,
    /// Unix seconds.
    pub created_time: u64,
    pub modified_time: u64,
    pub accessed_time: u64,
    /// Adapter-private bytes, handed back verbatim on later requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<Vec<u8>>,
}

impl FileEntry {
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_type: FileType::Dir,
            size: 0,
            created_time: 0,
            modified_time: 0,
            accessed_time: 0,
            raw_data: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Dir
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryRequest {
    pub path: String,
    /// 1-based; 0 is treated as 1.
    pub page: u32,
    /// 0 selects the adapter default.
    pub page_size: u32,
    /// Cursor returned by the previous page, if the backend uses cursors.
    #[serde(default)]
    pub dir_page_key: Option<String>,
    /// The entry for `path` from a previous listing, carrying its raw data.
    #[serde(default)]
    pub file_entry: Option<FileEntry>,
}

impl DirEntryRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            ..Default::default()
        }
    }

    pub fn effective_page(&self) -> u32 {
        self.page.max(1)
    }

    pub fn effective_page_size(&self) -> u32 {
        if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub file_entries: Vec<FileEntry>,
    /// Page size the adapter used; the host uses it for the next request.
    pub page_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir_page_key: Option<String>,
}

impl DirEntry {
    pub fn empty(page_size: u32) -> Self {
        Self {
            file_entries: Vec::new(),
            page_size,
            dir_page_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResourceRequest {
    pub file_path: String,
    #[serde(default)]
    pub file_entry: Option<FileEntry>,
    /// Ask for transcoded streams and subtitles as well.
    #[serde(default)]
    pub is_media: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Original,
    Ld,
    Sd,
    Hd,
    Fhd,
    Qhd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Video,
    Subtitle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceData {
    pub url: String,
    /// Unix seconds after which `url` stops working.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<u64>,
    pub resolution: Resolution,
    pub resource_type: ResourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Headers the host must send when fetching `url`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl ResourceData {
    pub fn original(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expire_time: None,
            resolution: Resolution::Original,
            resource_type: ResourceType::Video,
            title: None,
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResource {
    pub data: Vec<ResourceData>,
}

/// Slices a 1-based page out of `items`.
pub fn paginate<T>(items: Vec<T>, page: u32, page_size: u32) -> Vec<T> {
    let page = page.max(1) as usize;
    let page_size = page_size as usize;
    let start = (page - 1).saturating_mul(page_size);
    if start >= items.len() {
        return Vec::new();
    }
    items.into_iter().skip(start).take(page_size).collect()
}

/// A storage backend.
///
/// Instances are independent: each owns its credential, limiter and cursors.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn plugin_id(&self) -> &'static str;

    /// Methods the host may present to the user. Never touches the stored credential.
    async fn get_auth(&self) -> Result<Vec<AuthMethod>>;

    /// Advances one method. `Ok(None)` means pending; poll again.
    async fn check_auth_method(&self, method: AuthMethod) -> Result<Option<AuthData>>;

    /// Rehydrates the adapter from persisted auth data and validates it.
    async fn check_auth_data(&self, auth_data: &[u8]) -> Result<()>;

    /// Stable identity of the underlying account.
    fn plugin_auth_id(&self) -> Result<String>;

    async fn get_dir_entry(&self, request: DirEntryRequest) -> Result<DirEntry>;

    async fn get_file_resource(&self, request: FileResourceRequest) -> Result<FileResource>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paginate_slices_pages() {
        let items: Vec<u32> = (0..25).collect();
        assert_eq!(paginate(items.clone(), 1, 10), (0..10).collect::<Vec<_>>());
        assert_eq!(paginate(items.clone(), 3, 10), (20..25).collect::<Vec<_>>());
        assert!(paginate(items.clone(), 4, 10).is_empty());
        assert_eq!(paginate(items, 0, 10), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn request_defaults() {
        let request = DirEntryRequest {
            path: "/".into(),
            ..Default::default()
        };
        assert_eq!(request.effective_page(), 1);
        assert_eq!(request.effective_page_size(), DEFAULT_PAGE_SIZE);
    }
}
