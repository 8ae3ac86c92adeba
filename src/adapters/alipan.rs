//! Alipan (Aliyun Drive open platform) adapter.
//!
//! Authenticates through the broker with either a callback redirect or a QR
//! scan, and browses the resource and backup drives of the account.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::registry::{AdapterContext, Registry};
use crate::adapters::{
    Adapter, AdapterMetadata, DirEntry, DirEntryRequest, FileEntry, FileResource,
    FileResourceRequest, FileType, Resolution, ResourceData, ResourceType,
};
use crate::auth::{
    AuthKind, AuthMethod, AuthOutcome, CredentialCell, Negotiator, QrcodeImage, RefreshPolicy,
};
use crate::credential::{AuthData, Credential};
use crate::error::{PluginError, Result};
use crate::http_client::HttpSession;
use crate::ratelimit::{LimitConfig, RateLimiter};
use crate::retry::ReconnectPolicy;

pub const ALIPAN_PLUGIN_ID: &str = "alipan";

pub const RESOURCE_DRIVE_DIR: &str = "资源库";
pub const BACKUP_DRIVE_DIR: &str = "备份盘";

const USER_INFO_URI: &str = "/oauth/users/info";
const DRIVE_INFO_URI: &str = "/adrive/v1.0/user/getDriveInfo";
const LIST_URI: &str = "/adrive/v1.0/openFile/list";
const GET_BY_PATH_URI: &str = "/adrive/v1.0/openFile/get_by_path";
const DOWNLOAD_URL_URI: &str = "/adrive/v1.0/openFile/getDownloadUrl";
const PREVIEW_URI: &str = "/adrive/v1.0/openFile/getVideoPreviewPlayInfo";

const DOWNLOAD_URL_EXPIRE_SECS: i64 = 900;
const PREVIEW_URL_EXPIRE_SECS: i64 = 12_000;
const PREVIEW_TEMPLATES: &str = "LD|SD|HD|FHD|QHD";

fn vendor_limits() -> RateLimiter {
    RateLimiter::new([
        (LIST_URI, LimitConfig::new(40, Duration::from_secs(10))),
        (DOWNLOAD_URL_URI, LimitConfig::per_second(1)),
    ])
}

#[derive(Debug, Deserialize)]
struct QrcodeChallenge {
    #[serde(rename = "qrCodeUrl")]
    qr_code_url: String,
    sid: String,
}

#[derive(Debug, Default, Deserialize)]
struct VendorErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct UserInfo {
    id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DriveInfo {
    #[serde(default)]
    default_drive_id: String,
    #[serde(default)]
    resource_drive_id: String,
    #[serde(default)]
    backup_drive_id: String,
}

#[derive(Debug, Clone)]
struct Account {
    user: UserInfo,
    drive: DriveInfo,
}

/// A file as the vendor reports it; stored verbatim in `FileEntry::raw_data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VendorFile {
    #[serde(default)]
    drive_id: String,
    #[serde(default)]
    file_id: String,
    #[serde(default)]
    parent_file_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    content_hash: String,
    #[serde(default)]
    category: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl VendorFile {
    fn to_entry(&self) -> FileEntry {
        let created = unix_secs(self.created_at);
        let updated = unix_secs(self.updated_at);
        FileEntry {
            name: self.name.clone(),
            file_type: if self.kind == "folder" {
                FileType::Dir
            } else {
                FileType::File
            },
            size: self.size,
            created_time: created,
            modified_time: updated,
            accessed_time: updated,
            raw_data: serde_json::to_vec(self).ok(),
        }
    }
}

fn unix_secs(at: Option<DateTime<Utc>>) -> u64 {
    at.map(|t| t.timestamp().max(0) as u64).unwrap_or(0)
}

#[derive(Debug, Serialize)]
struct ListRequest<'a> {
    drive_id: &'a str,
    limit: u32,
    marker: &'a str,
    order_by: &'a str,
    parent_file_id: &'a str,
    category: &'a str,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    next_marker: String,
    #[serde(default)]
    items: Vec<VendorFile>,
}

#[derive(Debug, Serialize)]
struct GetByPathRequest<'a> {
    drive_id: &'a str,
    file_path: &'a str,
}

#[derive(Debug, Serialize)]
struct DownloadUrlRequest<'a> {
    drive_id: &'a str,
    file_id: &'a str,
    expire_sec: i64,
}

#[derive(Debug, Deserialize)]
struct DownloadUrlResponse {
    url: String,
    #[serde(default)]
    expiration: String,
}

#[derive(Debug, Serialize)]
struct PreviewRequest<'a> {
    drive_id: &'a str,
    file_id: &'a str,
    category: &'a str,
    template_id: &'a str,
    url_expire_sec: i64,
    get_subtitle_info: bool,
}

#[derive(Debug, Default, Deserialize)]
struct PreviewResponse {
    #[serde(default)]
    video_preview_play_info: Option<PreviewPlayInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct PreviewPlayInfo {
    #[serde(default)]
    live_transcoding_task_list: Vec<TranscodingTask>,
    #[serde(default)]
    live_transcoding_subtitle_task_list: Vec<SubtitleTask>,
}

#[derive(Debug, Deserialize)]
struct TranscodingTask {
    template_id: String,
    status: String,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct SubtitleTask {
    #[serde(default)]
    language: String,
    status: String,
    #[serde(default)]
    url: String,
}

fn template_resolution(template_id: &str) -> Option<Resolution> {
    match template_id {
        "LD" => Some(Resolution::Ld),
        "SD" => Some(Resolution::Sd),
        "HD" => Some(Resolution::Hd),
        "FHD" => Some(Resolution::Fhd),
        "QHD" => Some(Resolution::Qhd),
        _ => None,
    }
}

/// Turns a non-200 body into `message(code)`.
fn vendor_error(status: StatusCode, body: &[u8]) -> PluginError {
    match serde_json::from_slice::<VendorErrorBody>(body) {
        Ok(err) if !err.code.is_empty() || !err.message.is_empty() => PluginError::upstream(
            Some(status.as_u16()),
            format!("{}({})", err.message, err.code),
        ),
        _ => PluginError::upstream(
            Some(status.as_u16()),
            String::from_utf8_lossy(body).into_owned(),
        ),
    }
}

/// Collapses `path` into its components, resolving `.` and `..`.
fn clean_components(path: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts
}

/// Splits a host path into the drive id and the path inside that drive.
fn drive_path(drive: &DriveInfo, path: &str) -> Result<(String, String)> {
    let parts = clean_components(path);
    let (first, rest) = parts
        .split_first()
        .ok_or_else(|| PluginError::NotFound(path.to_string()))?;
    let drive_id = match *first {
        RESOURCE_DRIVE_DIR => &drive.resource_drive_id,
        BACKUP_DRIVE_DIR => &drive.backup_drive_id,
        _ => {
            error!(path, "path is outside the known drives");
            return Err(PluginError::NotFound(path.to_string()));
        }
    };
    if drive_id.is_empty() {
        return Err(PluginError::NotFound(path.to_string()));
    }
    Ok((drive_id.clone(), format!("/{}", rest.join("/"))))
}

fn raw_file_id(entry: Option<&FileEntry>) -> Result<Option<String>> {
    let Some(raw) = entry.and_then(|entry| entry.raw_data.as_deref()) else {
        return Ok(None);
    };
    let file: VendorFile = serde_json::from_slice(raw)
        .map_err(|e| PluginError::validation(format!("unrecognized entry raw data: {e}")))?;
    Ok(Some(file.file_id).filter(|id| !id.is_empty()))
}

pub struct AlipanAdapter {
    negotiator: Negotiator,
    session: HttpSession,
    reconnect: ReconnectPolicy,
    limiter: RateLimiter,
    credential: CredentialCell,
    account: RwLock<Option<Account>>,
    api_base: String,
    /// (directory path, page) -> marker that continues after that page.
    page_markers: Mutex<HashMap<(String, u32), String>>,
}

impl AlipanAdapter {
    pub fn new(context: &AdapterContext) -> Self {
        let ttl = chrono::Duration::seconds(context.config.qrcode_ttl_seconds as i64);
        Self {
            negotiator: Negotiator::new(context.codec(ALIPAN_PLUGIN_ID), context.broker.clone())
                .with_qrcode_ttl(ttl),
            session: context.session.clone(),
            reconnect: ReconnectPolicy::new(context.config.reconnect_attempts),
            limiter: vendor_limits(),
            credential: CredentialCell::new(),
            account: RwLock::new(None),
            api_base: context.config.alipan_api_base.trim_end_matches('/').to_string(),
            page_markers: Mutex::new(HashMap::new()),
        }
    }

    fn account(&self) -> Result<Account> {
        self.account
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
            .ok_or(PluginError::NotAuthenticated)
    }

    async fn negotiate(&self, method: AuthMethod) -> Result<AuthOutcome> {
        let now = Utc::now();
        let (credential, refreshed): (Credential, bool) = match method {
            AuthMethod::Callback(callback) => {
                (self.negotiator.resolve_callback(&callback, now)?, false)
            }
            AuthMethod::ScanQrcode(qrcode) => {
                match self.negotiator.resolve_qrcode(&qrcode, now).await? {
                    Some(credential) => (credential, false),
                    None => return Ok(AuthOutcome::Pending),
                }
            }
            AuthMethod::Refresh(refresh) => {
                (self.negotiator.resolve_refresh(&refresh, now).await?, true)
            }
            AuthMethod::FormInput(_) => {
                return Err(PluginError::validation(format!(
                    "{ALIPAN_PLUGIN_ID} does not accept {}",
                    AuthKind::FormInput
                )));
            }
        };

        let auth_data = self.negotiator.issue(&credential)?;
        // A fresh login may belong to another account; it goes live through
        // `check_auth_data`, which re-reads the account.
        if refreshed && self.credential.is_loaded() {
            self.credential.replace(credential);
        }
        info!("access token issued");
        Ok(AuthOutcome::Resolved(auth_data))
    }

    async fn send<Req, Resp>(
        &self,
        method: Method,
        uri: &str,
        body: Option<&Req>,
        access_token: &str,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        self.reconnect
            .run_limited(&self.session, &self.limiter, uri, move || {
                self.send_once(method.clone(), uri, body, access_token)
            })
            .await
    }

    async fn send_once<Req, Resp>(
        &self,
        method: Method,
        uri: &str,
        body: Option<&Req>,
        access_token: &str,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let client = self.session.client().await;
        let mut request = client
            .request(method, format!("{}{}", self.api_base, uri))
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(access_token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        debug!(uri, status = status.as_u16(), len = bytes.len(), "alipan response");
        if status != StatusCode::OK {
            return Err(vendor_error(status, &bytes));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn file_by_path(
        &self,
        drive_id: &str,
        file_path: &str,
        token: &str,
    ) -> Result<VendorFile> {
        let request = GetByPathRequest { drive_id, file_path };
        self.send(Method::POST, GET_BY_PATH_URI, Some(&request), token)
            .await
    }

    async fn resolve_file_id(
        &self,
        drive_id: &str,
        path: &str,
        entry: Option<&FileEntry>,
        token: &str,
    ) -> Result<String> {
        if let Some(id) = raw_file_id(entry)? {
            return Ok(id);
        }
        let file = self.file_by_path(drive_id, path, token).await?;
        if file.file_id.is_empty() {
            return Err(PluginError::NotFound(path.to_string()));
        }
        Ok(file.file_id)
    }

    fn lookup_marker(&self, path: &str, page: u32) -> Option<String> {
        self.page_markers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(&(path.to_string(), page))
            .cloned()
    }

    fn store_marker(&self, path: &str, page: u32, marker: Option<&str>) {
        let mut markers = self
            .page_markers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let key = (path.to_string(), page);
        match marker {
            Some(marker) => {
                markers.insert(key, marker.to_string());
            }
            None => {
                markers.remove(&key);
            }
        }
    }

    fn root_listing(drive: &DriveInfo, page_size: u32) -> DirEntry {
        let mut listing = DirEntry::empty(page_size);
        if !drive.resource_drive_id.is_empty() {
            listing.file_entries.push(FileEntry::dir(RESOURCE_DRIVE_DIR));
        }
        if !drive.backup_drive_id.is_empty() {
            listing.file_entries.push(FileEntry::dir(BACKUP_DRIVE_DIR));
        }
        listing
    }

    async fn preview_resources(
        &self,
        drive_id: &str,
        file_id: &str,
        token: &str,
    ) -> Result<Vec<ResourceData>> {
        let request = PreviewRequest {
            drive_id,
            file_id,
            category: "live_transcoding",
            template_id: PREVIEW_TEMPLATES,
            url_expire_sec: PREVIEW_URL_EXPIRE_SECS,
            get_subtitle_info: true,
        };
        let response: PreviewResponse = self
            .send(Method::POST, PREVIEW_URI, Some(&request), token)
            .await?;
        let info = response.video_preview_play_info.unwrap_or_default();
        let expire_time = (Utc::now().timestamp() + PREVIEW_URL_EXPIRE_SECS) as u64;

        let mut resources = Vec::new();
        for task in info.live_transcoding_task_list {
            if task.status != "finished" || task.url.is_empty() {
                continue;
            }
            let Some(resolution) = template_resolution(&task.template_id) else {
                continue;
            };
            resources.push(ResourceData {
                expire_time: Some(expire_time),
                resolution,
                ..ResourceData::original(task.url)
            });
        }
        for task in info.live_transcoding_subtitle_task_list {
            if task.status != "finished" {
                continue;
            }
            resources.push(ResourceData {
                resource_type: ResourceType::Subtitle,
                title: Some(task.language),
                ..ResourceData::original(task.url)
            });
        }
        Ok(resources)
    }
}

impl std::fmt::Debug for AlipanAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlipanAdapter")
            .field("api_base", &self.api_base)
            .field("authenticated", &self.credential.is_loaded())
            .field("limiter", &self.limiter)
            .finish()
    }
}

#[async_trait]
impl Adapter for AlipanAdapter {
    fn plugin_id(&self) -> &'static str {
        ALIPAN_PLUGIN_ID
    }

    async fn get_auth(&self) -> Result<Vec<AuthMethod>> {
        let mut methods = vec![self.negotiator.callback_method()];

        let challenge = self.negotiator.fetch_challenge().await.map_err(|err| {
            error!(plugin_id = ALIPAN_PLUGIN_ID, error = %err, "get qrcode failed");
            err
        })?;
        let qrcode: QrcodeChallenge = serde_json::from_slice(&challenge)?;
        methods.push(self.negotiator.qrcode_method(
            QrcodeImage::Url(qrcode.qr_code_url),
            qrcode.sid,
            Utc::now(),
        ));
        Ok(methods)
    }

    #[instrument(skip_all, fields(plugin_id = ALIPAN_PLUGIN_ID, method = %method.kind()))]
    async fn check_auth_method(&self, method: AuthMethod) -> Result<Option<AuthData>> {
        self.negotiate(method).await.map(AuthOutcome::into_option)
    }

    #[instrument(skip_all, fields(plugin_id = ALIPAN_PLUGIN_ID))]
    async fn check_auth_data(&self, auth_data: &[u8]) -> Result<()> {
        let credential = self.negotiator.codec().decode_credential(auth_data)?;
        RefreshPolicy::ensure_usable(&credential, Utc::now())?;

        let token = credential.access_token.as_str();
        let user: UserInfo = self
            .send(Method::GET, USER_INFO_URI, None::<&()>, token)
            .await
            .map_err(RefreshPolicy::on_validation_failure)?;
        let drive: DriveInfo = self
            .send(Method::POST, DRIVE_INFO_URI, Some(&serde_json::json!({})), token)
            .await
            .map_err(RefreshPolicy::on_validation_failure)?;

        info!(
            user_id = %user.id,
            default_drive = %drive.default_drive_id,
            "alipan account attached"
        );
        *self
            .account
            .write()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(Account { user, drive });
        self.credential.replace(credential);
        Ok(())
    }

    fn plugin_auth_id(&self) -> Result<String> {
        Ok(self.account()?.user.id)
    }

    async fn get_dir_entry(&self, request: DirEntryRequest) -> Result<DirEntry> {
        let credential = self.credential.require_fresh(Utc::now())?;
        let token = credential.access_token.as_str();
        let account = self.account()?;
        let page_size = request.effective_page_size();

        if clean_components(&request.path).is_empty() {
            return Ok(Self::root_listing(&account.drive, page_size));
        }

        let (drive_id, path) = drive_path(&account.drive, &request.path)?;
        let parent_file_id = if path == "/" {
            "root".to_string()
        } else {
            self.resolve_file_id(&drive_id, &path, request.file_entry.as_ref(), token)
                .await?
        };

        let page = request.effective_page();
        let marker = match request.dir_page_key.clone().filter(|key| !key.is_empty()) {
            Some(key) => key,
            None if page > 1 => match self.lookup_marker(&request.path, page - 1) {
                Some(marker) => marker,
                None => return Ok(DirEntry::empty(page_size)),
            },
            None => String::new(),
        };

        let list = ListRequest {
            drive_id: &drive_id,
            limit: page_size,
            marker: &marker,
            order_by: "name_enhanced",
            parent_file_id: &parent_file_id,
            category: "",
        };
        let response: ListResponse = self.send(Method::POST, LIST_URI, Some(&list), token).await?;

        let next_marker = Some(response.next_marker).filter(|marker| !marker.is_empty());
        self.store_marker(&request.path, page, next_marker.as_deref());
        debug!(path = %request.path, page, items = response.items.len(), "listed alipan directory");

        Ok(DirEntry {
            file_entries: response.items.iter().map(VendorFile::to_entry).collect(),
            page_size,
            dir_page_key: next_marker,
        })
    }

    async fn get_file_resource(&self, request: FileResourceRequest) -> Result<FileResource> {
        let credential = self.credential.require_fresh(Utc::now())?;
        let token = credential.access_token.as_str();
        let account = self.account()?;
        let (drive_id, path) = drive_path(&account.drive, &request.file_path)?;
        let file_id = self
            .resolve_file_id(&drive_id, &path, request.file_entry.as_ref(), token)
            .await?;

        let download = DownloadUrlRequest {
            drive_id: &drive_id,
            file_id: &file_id,
            expire_sec: DOWNLOAD_URL_EXPIRE_SECS,
        };
        let response: DownloadUrlResponse = self
            .send(Method::POST, DOWNLOAD_URL_URI, Some(&download), token)
            .await?;
        let expire_time = match DateTime::parse_from_rfc3339(&response.expiration) {
            Ok(at) => Some(at.timestamp().max(0) as u64),
            Err(err) => {
                warn!(
                    error = %err,
                    expiration = %response.expiration,
                    "unparsable download url expiration"
                );
                None
            }
        };

        let mut data = vec![ResourceData {
            expire_time,
            ..ResourceData::original(response.url)
        }];
        if request.is_media {
            match self.preview_resources(&drive_id, &file_id, token).await {
                Ok(resources) => data.extend(resources),
                Err(err) => error!(error = %err, "get video preview play info failed"),
            }
        }
        Ok(FileResource { data })
    }
}

pub fn register_alipan_adapter(registry: &mut Registry) {
    registry.register(
        AdapterMetadata::new(
            ALIPAN_PLUGIN_ID,
            "Alipan",
            vec![AuthKind::Callback, AuthKind::ScanQrcode, AuthKind::Refresh],
        ),
        Arc::new(|context: &AdapterContext| {
            Ok(Arc::new(AlipanAdapter::new(context)) as Arc<dyn Adapter>)
        }),
    );
}
