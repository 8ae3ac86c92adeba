//! Local filesystem adapter.
//!
//! Authenticates with a single directory form field and serves that directory
//! tree as `file://` resources.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::adapters::registry::{AdapterContext, Registry};
use crate::adapters::{
    Adapter, AdapterMetadata, DirEntry, DirEntryRequest, FileEntry, FileResource,
    FileResourceRequest, FileType, ResourceData, paginate,
};
use crate::auth::{AuthKind, AuthMethod, FormData, FormItem, FormValue};
use crate::credential::{AuthData, CredentialCodec, RecordKind};
use crate::error::{PluginError, Result};

pub const LOCAL_PLUGIN_ID: &str = "local";
pub const DIRECTORY_FIELD: &str = "Directory";

#[derive(Debug, Clone)]
struct LocalRoot {
    /// Directory exactly as the user entered it.
    configured: String,
    root: PathBuf,
}

#[derive(Debug)]
pub struct LocalAdapter {
    codec: CredentialCodec,
    root: RwLock<Option<LocalRoot>>,
}

impl LocalAdapter {
    pub fn new(codec: CredentialCodec) -> Self {
        Self {
            codec,
            root: RwLock::new(None),
        }
    }

    fn form(directory: &str) -> FormData {
        FormData::new(vec![FormItem::new(
            DIRECTORY_FIELD,
            FormValue::DirectoryPath(directory.to_string()),
        )])
    }

    fn current_root(&self) -> Option<LocalRoot> {
        self.root
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    fn require_root(&self) -> Result<LocalRoot> {
        self.current_root().ok_or(PluginError::NotAuthenticated)
    }

    async fn resolve_form(&self, submitted: &FormData) -> Result<AuthData> {
        submitted.validate_against(&Self::form(""))?;
        let directory = submitted.required_string(DIRECTORY_FIELD)?;
        ensure_directory(&normalize_directory(directory))
            .await
            .map_err(|err| match err {
                PluginError::NotFound(msg) => PluginError::validation(msg),
                other => other,
            })?;
        Ok(AuthData {
            bytes: self.codec.encode(RecordKind::Form, submitted)?,
            expires_at: None,
        })
    }
}

/// `C:\Media` becomes `/C/Media`; other paths are kept as entered.
pub fn normalize_directory(directory: &str) -> PathBuf {
    if directory.contains(':') {
        PathBuf::from(format!(
            "/{}",
            directory.replace(':', "").replace('\\', "/")
        ))
    } else {
        PathBuf::from(directory)
    }
}

async fn ensure_directory(path: &Path) -> Result<()> {
    let metadata = tokio::fs::metadata(path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            PluginError::NotFound(format!("{} does not exist", path.display()))
        } else {
            PluginError::Io(err)
        }
    })?;
    if !metadata.is_dir() {
        return Err(PluginError::validation(format!(
            "{} is not a directory",
            path.display()
        )));
    }
    Ok(())
}

/// Joins a host path below `root`, refusing to leave it.
fn resolve_below(root: &Path, path: &str) -> Result<PathBuf> {
    let relative = Path::new(path.trim_start_matches(['/', '\\']));
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PluginError::validation(format!(
                    "path '{path}' escapes the configured directory"
                )));
            }
        }
    }
    Ok(resolved)
}

fn unix_secs(time: std::io::Result<SystemTime>) -> u64 {
    time.ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn plugin_id(&self) -> &'static str {
        LOCAL_PLUGIN_ID
    }

    async fn get_auth(&self) -> Result<Vec<AuthMethod>> {
        let current = self
            .current_root()
            .map(|root| root.configured)
            .unwrap_or_default();
        Ok(vec![AuthMethod::FormInput(Self::form(&current))])
    }

    #[instrument(skip_all, fields(plugin_id = LOCAL_PLUGIN_ID, method = %method.kind()))]
    async fn check_auth_method(&self, method: AuthMethod) -> Result<Option<AuthData>> {
        match method {
            AuthMethod::FormInput(form) => self.resolve_form(&form).await.map(Some),
            AuthMethod::Refresh(refresh) => {
                let form: FormData = self.codec.decode(RecordKind::Form, &refresh.auth_data.bytes)?;
                self.resolve_form(&form).await.map(Some)
            }
            AuthMethod::Callback(_) | AuthMethod::ScanQrcode(_) => Err(PluginError::validation(
                format!("{LOCAL_PLUGIN_ID} only supports {}", AuthKind::FormInput),
            )),
        }
    }

    async fn check_auth_data(&self, auth_data: &[u8]) -> Result<()> {
        let form: FormData = self.codec.decode(RecordKind::Form, auth_data)?;
        let configured = form.required_string(DIRECTORY_FIELD)?.to_string();
        let root = normalize_directory(&configured);
        ensure_directory(&root).await?;

        info!(root = %root.display(), "local directory attached");
        *self
            .root
            .write()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(LocalRoot { configured, root });
        Ok(())
    }

    fn plugin_auth_id(&self) -> Result<String> {
        let root = self.require_root()?;
        Ok(hex::encode(Sha256::digest(root.configured.as_bytes())))
    }

    async fn get_dir_entry(&self, request: DirEntryRequest) -> Result<DirEntry> {
        let root = self.require_root()?;
        let dir = resolve_below(&root.root, &request.path)?;
        let page_size = request.effective_page_size();

        let mut reader = tokio::fs::read_dir(&dir).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                PluginError::NotFound(request.path.clone())
            } else {
                PluginError::Io(err)
            }
        })?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(name = %name, error = %err, "failed to stat entry");
                    continue;
                }
            };
            entries.push(FileEntry {
                name,
                file_type: if metadata.is_dir() {
                    FileType::Dir
                } else {
                    FileType::File
                },
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                created_time: unix_secs(metadata.created()),
                modified_time: unix_secs(metadata.modified()),
                accessed_time: unix_secs(metadata.accessed()),
                raw_data: None,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(path = %request.path, total = entries.len(), "listed local directory");

        Ok(DirEntry {
            file_entries: paginate(entries, request.effective_page(), page_size),
            page_size,
            dir_page_key: None,
        })
    }

    async fn get_file_resource(&self, request: FileResourceRequest) -> Result<FileResource> {
        let root = self.require_root()?;
        let path = resolve_below(&root.root, &request.file_path)?;
        tokio::fs::metadata(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                PluginError::NotFound(request.file_path.clone())
            } else {
                PluginError::Io(err)
            }
        })?;

        let url = format!("file://{}", path.to_string_lossy().replace('\\', "/"));
        Ok(FileResource {
            data: vec![ResourceData::original(url)],
        })
    }
}

pub fn register_local_adapter(registry: &mut Registry) {
    registry.register(
        AdapterMetadata::new(LOCAL_PLUGIN_ID, "Local Directory", vec![AuthKind::FormInput]),
        Arc::new(|context: &AdapterContext| {
            Ok(Arc::new(LocalAdapter::new(context.codec(LOCAL_PLUGIN_ID))) as Arc<dyn Adapter>)
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_paths_are_normalized() {
        assert_eq!(
            normalize_directory(r"C:\Users\me\Videos"),
            PathBuf::from("/C/Users/me/Videos")
        );
        assert_eq!(normalize_directory("/srv/media"), PathBuf::from("/srv/media"));
    }

    #[test]
    fn resolve_below_rejects_escape() {
        let root = Path::new("/srv/media");
        assert_eq!(
            resolve_below(root, "/movies/a.mkv").expect("inside"),
            PathBuf::from("/srv/media/movies/a.mkv")
        );
        assert_eq!(resolve_below(root, "/").expect("root"), PathBuf::from("/srv/media"));
        assert!(resolve_below(root, "/../etc/passwd").is_err());
        assert!(resolve_below(root, "movies/../../x").is_err());
    }

    #[tokio::test]
    async fn unsupported_methods_are_validation_errors() {
        let adapter = LocalAdapter::new(CredentialCodec::new(LOCAL_PLUGIN_ID, None));
        let err = adapter
            .check_auth_method(AuthMethod::Callback(crate::auth::Callback {
                callback_url: "http://x".into(),
                callback_url_data: None,
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Validation(_)));
    }

    #[test]
    fn unauthenticated_adapter_has_no_identity() {
        let adapter = LocalAdapter::new(CredentialCodec::new(LOCAL_PLUGIN_ID, None));
        assert!(matches!(
            adapter.plugin_auth_id(),
            Err(PluginError::NotAuthenticated)
        ));
    }
}
