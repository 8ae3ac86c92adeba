//! 123pan open platform adapter.
//!
//! Authenticates with an app's client id and secret. The vendor issues a
//! non-refreshable access token, so the stored record keeps the client
//! credentials and a refresh simply exchanges them again.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, error, info, instrument};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::adapters::registry::{AdapterContext, Registry};
use crate::adapters::{
    Adapter, AdapterMetadata, DirEntry, DirEntryRequest, FileEntry, FileResource,
    FileResourceRequest, FileType, ResourceData,
};
use crate::auth::{
    AuthKind, AuthMethod, CredentialCell, FormData, FormItem, FormValue, Negotiator,
    RefreshPolicy,
};
use crate::credential::{AuthData, Credential, RecordKind, TokenResponse};
use crate::error::{PluginError, Result};
use crate::http_client::HttpSession;
use crate::ratelimit::{LimitConfig, RateLimiter};
use crate::retry::ReconnectPolicy;

pub const PAN123_PLUGIN_ID: &str = "123pan";
pub const CLIENT_ID_FIELD: &str = "Client Id";
pub const CLIENT_SECRET_FIELD: &str = "Client Secret";

const PLATFORM_HEADER: &str = "Platform";
const PLATFORM: &str = "open_platform";

const ACCESS_TOKEN_URI: &str = "/api/v1/access_token";
const USER_INFO_URI: &str = "/api/v1/user/info";
const FILE_LIST_URI: &str = "/api/v2/file/list";
const DOWNLOAD_INFO_URI: &str = "/api/v1/file/download_info";

const ROOT_FILE_ID: u64 = 0;
const LAST_PAGE: i64 = -1;
const VENDOR_UNAUTHORIZED: i64 = 401;
/// Vendor timestamps are Beijing time without an offset.
const VENDOR_UTC_OFFSET_SECS: i32 = 8 * 3600;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct ClientCredentials {
    client_id: String,
    client_secret: String,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// Persisted payload: the app credentials plus the token they produced.
#[derive(Clone, Serialize, Deserialize)]
struct Pan123Record {
    client: ClientCredentials,
    credential: Credential,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default = "Option::default")]
    data: Option<T>,
}

#[derive(Serialize)]
struct AccessTokenRequest<'a> {
    #[serde(rename = "clientID")]
    client_id: &'a str,
    #[serde(rename = "clientSecret")]
    client_secret: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenData {
    access_token: String,
    expired_at: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UserInfo {
    uid: i64,
}

/// A file as the vendor reports it; stored verbatim in `FileEntry::raw_data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VendorFile {
    file_id: u64,
    #[serde(default)]
    file_name: String,
    /// 0 file, 1 folder.
    #[serde(default, rename = "type")]
    kind: i32,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    etag: String,
    #[serde(default)]
    trashed: i32,
    #[serde(default)]
    create_at: String,
    #[serde(default)]
    update_at: String,
}

impl VendorFile {
    fn to_entry(&self) -> FileEntry {
        let updated = vendor_time(&self.update_at);
        FileEntry {
            name: self.file_name.clone(),
            file_type: if self.kind == 1 {
                FileType::Dir
            } else {
                FileType::File
            },
            size: self.size,
            created_time: vendor_time(&self.create_at),
            modified_time: updated,
            accessed_time: updated,
            raw_data: serde_json::to_vec(self).ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListData {
    last_file_id: i64,
    #[serde(default)]
    file_list: Vec<VendorFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadInfo {
    download_url: String,
}

fn vendor_time(value: &str) -> u64 {
    let Some(offset) = FixedOffset::east_opt(VENDOR_UTC_OFFSET_SECS) else {
        return 0;
    };
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .and_then(|naive| naive.and_local_timezone(offset).single())
        .map(|at| at.timestamp().max(0) as u64)
        .unwrap_or(0)
}

/// Converts the vendor's absolute expiry into a relative lifetime.
fn token_response(data: AccessTokenData, now: DateTime<Utc>) -> Result<TokenResponse> {
    let expired_at = DateTime::parse_from_rfc3339(&data.expired_at).map_err(|e| {
        PluginError::upstream(None, format!("unparsable expiredAt '{}': {e}", data.expired_at))
    })?;
    Ok(TokenResponse {
        access_token: data.access_token,
        refresh_token: String::new(),
        expires_in: (expired_at.with_timezone(&Utc) - now).num_seconds(),
        token_type: None,
    })
}

fn envelope_error(status: StatusCode, code: i64, message: &str) -> PluginError {
    let status = if code == VENDOR_UNAUTHORIZED {
        Some(401)
    } else if status.is_success() {
        None
    } else {
        Some(status.as_u16())
    };
    PluginError::upstream(status, format!("Request Failed: {message} (code {code})"))
}

fn raw_file_id(entry: Option<&FileEntry>) -> Result<Option<u64>> {
    let Some(raw) = entry.and_then(|entry| entry.raw_data.as_deref()) else {
        return Ok(None);
    };
    let file: VendorFile = serde_json::from_slice(raw)
        .map_err(|e| PluginError::validation(format!("unrecognized entry raw data: {e}")))?;
    Ok(Some(file.file_id))
}

fn path_components(path: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(PluginError::validation(format!(
                    "path '{path}' must not contain '..'"
                )));
            }
            other => parts.push(other),
        }
    }
    Ok(parts)
}

#[derive(Debug, Clone)]
struct Account {
    uid: String,
}

pub struct Pan123Adapter {
    negotiator: Negotiator,
    session: HttpSession,
    reconnect: ReconnectPolicy,
    limiter: RateLimiter,
    credential: CredentialCell,
    client: RwLock<Option<ClientCredentials>>,
    account: RwLock<Option<Account>>,
    api_base: String,
}

impl Pan123Adapter {
    pub fn new(context: &AdapterContext) -> Self {
        Self {
            negotiator: Negotiator::new(context.codec(PAN123_PLUGIN_ID), context.broker.clone()),
            session: context.session.clone(),
            reconnect: ReconnectPolicy::new(context.config.reconnect_attempts),
            limiter: RateLimiter::new([(USER_INFO_URI, LimitConfig::per_second(1))]),
            credential: CredentialCell::new(),
            client: RwLock::new(None),
            account: RwLock::new(None),
            api_base: context.config.pan123_api_base.trim_end_matches('/').to_string(),
        }
    }

    fn form(client_id: &str, client_secret: &str) -> FormData {
        FormData::new(vec![
            FormItem::new(CLIENT_ID_FIELD, FormValue::PlainString(client_id.to_string())),
            FormItem::new(
                CLIENT_SECRET_FIELD,
                FormValue::ObscuredString(client_secret.to_string()),
            ),
        ])
    }

    fn current_client(&self) -> Option<ClientCredentials> {
        self.client
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    fn store_client(&self, client: ClientCredentials) {
        *self
            .client
            .write()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(client);
    }

    fn account(&self) -> Result<Account> {
        self.account
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
            .ok_or(PluginError::NotAuthenticated)
    }

    async fn send<Req, Resp>(
        &self,
        method: Method,
        uri: &str,
        query: &[(&str, String)],
        body: Option<&Req>,
        access_token: Option<&str>,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        self.reconnect
            .run_limited(&self.session, &self.limiter, uri, move || {
                self.send_once(method.clone(), uri, query, body, access_token)
            })
            .await
    }

    async fn send_once<Req, Resp>(
        &self,
        method: Method,
        uri: &str,
        query: &[(&str, String)],
        body: Option<&Req>,
        access_token: Option<&str>,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let client = self.session.client().await;
        let mut request = client
            .request(method, format!("{}{}", self.api_base, uri))
            .header(PLATFORM_HEADER, PLATFORM);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        debug!(uri, status = status.as_u16(), len = bytes.len(), "123pan response");

        let envelope: Envelope<Resp> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(PluginError::upstream(
                    Some(status.as_u16()),
                    String::from_utf8_lossy(&bytes).into_owned(),
                ));
            }
            Err(err) => return Err(err.into()),
        };
        if envelope.code != 0 {
            error!(uri, code = envelope.code, message = %envelope.message, "123pan request failed");
            return Err(envelope_error(status, envelope.code, &envelope.message));
        }
        envelope
            .data
            .ok_or_else(|| PluginError::upstream(None, format!("{uri} returned no data")))
    }

    async fn exchange_client(
        &self,
        client: &ClientCredentials,
        now: DateTime<Utc>,
    ) -> Result<TokenResponse> {
        let request = AccessTokenRequest {
            client_id: &client.client_id,
            client_secret: &client.client_secret,
        };
        let data: AccessTokenData = self
            .send(Method::POST, ACCESS_TOKEN_URI, &[], Some(&request), None)
            .await?;
        token_response(data, now)
    }

    fn issue(&self, client: ClientCredentials, credential: Credential) -> Result<AuthData> {
        let expires_at = credential.expires_at;
        let record = Pan123Record { client, credential };
        Ok(AuthData {
            bytes: self.negotiator.codec().encode(RecordKind::Token, &record)?,
            expires_at: Some(expires_at),
        })
    }

    /// A fresh login only yields auth data; the live credential changes once
    /// `check_auth_data` has attached the account behind it.
    async fn resolve_form(&self, submitted: &FormData, now: DateTime<Utc>) -> Result<AuthData> {
        let advertised = Self::form("", "");
        let (credential, client) = self
            .negotiator
            .resolve_form(submitted, &advertised, now, |form| async move {
                let client = ClientCredentials {
                    client_id: form.required_string(CLIENT_ID_FIELD)?.to_string(),
                    client_secret: form.required_string(CLIENT_SECRET_FIELD)?.to_string(),
                };
                let token = self.exchange_client(&client, now).await?;
                Ok::<_, PluginError>((token, client))
            })
            .await?;
        self.issue(client, credential)
    }

    async fn resolve_refresh(&self, auth_data: &AuthData, now: DateTime<Utc>) -> Result<AuthData> {
        let record: Pan123Record =
            self.negotiator.codec().decode(RecordKind::Token, &auth_data.bytes)?;
        let credential = self
            .negotiator
            .refresh_with(now, self.exchange_client(&record.client, now))
            .await?;
        if self.credential.is_loaded() {
            self.store_client(record.client.clone());
            self.credential.replace(credential.clone());
        }
        self.issue(record.client.clone(), credential)
    }

    async fn list_page(
        &self,
        parent_file_id: u64,
        limit: u32,
        last_file_id: Option<&str>,
        token: &str,
    ) -> Result<FileListData> {
        let mut query = vec![
            ("parentFileId", parent_file_id.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(last) = last_file_id {
            query.push(("lastFileId", last.to_string()));
        }
        self.send(Method::GET, FILE_LIST_URI, &query, None::<&()>, Some(token))
            .await
    }

    /// Walks `path` from the root, one listing per component.
    async fn resolve_path(&self, path: &str, token: &str) -> Result<u64> {
        let mut current = ROOT_FILE_ID;
        for name in path_components(path)? {
            current = self.find_child(current, name, token).await?.file_id;
        }
        Ok(current)
    }

    async fn find_child(&self, parent_file_id: u64, name: &str, token: &str) -> Result<VendorFile> {
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .list_page(
                    parent_file_id,
                    crate::adapters::DEFAULT_PAGE_SIZE,
                    cursor.as_deref(),
                    token,
                )
                .await?;
            if let Some(found) = page
                .file_list
                .into_iter()
                .find(|file| file.trashed == 0 && file.file_name == name)
            {
                return Ok(found);
            }
            if page.last_file_id == LAST_PAGE {
                return Err(PluginError::NotFound(name.to_string()));
            }
            cursor = Some(page.last_file_id.to_string());
        }
    }

    async fn file_id_for(&self, path: &str, entry: Option<&FileEntry>, token: &str) -> Result<u64> {
        match raw_file_id(entry)? {
            Some(id) => Ok(id),
            None => self.resolve_path(path, token).await,
        }
    }
}

impl std::fmt::Debug for Pan123Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pan123Adapter")
            .field("api_base", &self.api_base)
            .field("authenticated", &self.credential.is_loaded())
            .field("limiter", &self.limiter)
            .finish()
    }
}

#[async_trait]
impl Adapter for Pan123Adapter {
    fn plugin_id(&self) -> &'static str {
        PAN123_PLUGIN_ID
    }

    async fn get_auth(&self) -> Result<Vec<AuthMethod>> {
        let form = match self.current_client() {
            Some(client) => Self::form(&client.client_id, &client.client_secret),
            None => Self::form("", ""),
        };
        Ok(vec![AuthMethod::FormInput(form)])
    }

    #[instrument(skip_all, fields(plugin_id = PAN123_PLUGIN_ID, method = %method.kind()))]
    async fn check_auth_method(&self, method: AuthMethod) -> Result<Option<AuthData>> {
        let now = Utc::now();
        let auth_data = match method {
            AuthMethod::FormInput(form) => self.resolve_form(&form, now).await?,
            AuthMethod::Refresh(refresh) => self.resolve_refresh(&refresh.auth_data, now).await?,
            AuthMethod::Callback(_) | AuthMethod::ScanQrcode(_) => {
                return Err(PluginError::validation(format!(
                    "{PAN123_PLUGIN_ID} only supports {}",
                    AuthKind::FormInput
                )));
            }
        };
        info!("access token issued");
        Ok(Some(auth_data))
    }

    #[instrument(skip_all, fields(plugin_id = PAN123_PLUGIN_ID))]
    async fn check_auth_data(&self, auth_data: &[u8]) -> Result<()> {
        let record: Pan123Record = self.negotiator.codec().decode(RecordKind::Token, auth_data)?;
        RefreshPolicy::ensure_usable(&record.credential, Utc::now())?;

        let user: UserInfo = self
            .send(
                Method::GET,
                USER_INFO_URI,
                &[],
                None::<&()>,
                Some(&record.credential.access_token),
            )
            .await
            .map_err(RefreshPolicy::on_validation_failure)?;

        info!(uid = user.uid, "123pan account attached");
        *self
            .account
            .write()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(Account {
            uid: user.uid.to_string(),
        });
        self.store_client(record.client.clone());
        self.credential.replace(record.credential.clone());
        Ok(())
    }

    fn plugin_auth_id(&self) -> Result<String> {
        Ok(self.account()?.uid)
    }

    async fn get_dir_entry(&self, request: DirEntryRequest) -> Result<DirEntry> {
        let credential = self.credential.require_fresh(Utc::now())?;
        let token = credential.access_token.as_str();
        let page_size = request.effective_page_size();

        let cursor = request.dir_page_key.clone().filter(|key| !key.is_empty());
        if cursor.is_none() && request.effective_page() > 1 {
            debug!(path = %request.path, "no cursor past the first page");
            return Ok(DirEntry::empty(page_size));
        }

        let parent_file_id = if path_components(&request.path)?.is_empty() {
            ROOT_FILE_ID
        } else {
            self.file_id_for(&request.path, request.file_entry.as_ref(), token)
                .await?
        };
        let page = self
            .list_page(parent_file_id, page_size, cursor.as_deref(), token)
            .await?;

        Ok(DirEntry {
            file_entries: page
                .file_list
                .iter()
                .filter(|file| file.trashed == 0)
                .map(VendorFile::to_entry)
                .collect(),
            page_size,
            dir_page_key: (page.last_file_id != LAST_PAGE).then(|| page.last_file_id.to_string()),
        })
    }

    async fn get_file_resource(&self, request: FileResourceRequest) -> Result<FileResource> {
        let credential = self.credential.require_fresh(Utc::now())?;
        let token = credential.access_token.as_str();
        let file_id = self
            .file_id_for(&request.file_path, request.file_entry.as_ref(), token)
            .await?;

        let info: DownloadInfo = self
            .send(
                Method::GET,
                DOWNLOAD_INFO_URI,
                &[("fileId", file_id.to_string())],
                None::<&()>,
                Some(token),
            )
            .await?;
        Ok(FileResource {
            data: vec![ResourceData::original(info.download_url)],
        })
    }
}

pub fn register_pan123_adapter(registry: &mut Registry) {
    registry.register(
        AdapterMetadata::new(
            PAN123_PLUGIN_ID,
            "123pan",
            vec![AuthKind::FormInput, AuthKind::Refresh],
        ),
        Arc::new(|context: &AdapterContext| {
            Ok(Arc::new(Pan123Adapter::new(context)) as Arc<dyn Adapter>)
        }),
    );
}
