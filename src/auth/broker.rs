//! Outbound contract with the external auth broker.
//!
//! The broker holds vendor client secrets on behalf of adapters. It issues
//! redirect URLs, QR-code challenges and token exchanges.

use std::collections::HashMap;

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::credential::TokenResponse;
use crate::error::{PluginError, Result};
use crate::http_client::HttpSession;

const GET_AUTH_ADDR_URI: &str = "/api/get_auth_addr";
const GET_AUTH_TOKEN_URI: &str = "/api/get_auth_token";
const GET_AUTH_QRCODE_URI: &str = "/api/get_auth_qrcode_v2";
const CHECK_AUTH_QRCODE_URI: &str = "/api/check_auth_qrcode";

/// Body of a token exchange; either `code` or `refresh_token` is set.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub id: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub uid: String,
}

impl TokenRequest {
    pub fn refresh(plugin_id: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            id: plugin_id.into(),
            refresh_token: refresh_token.into(),
            ..Default::default()
        }
    }

    pub fn code(plugin_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: plugin_id.into(),
            code: code.into(),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for TokenRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRequest")
            .field("id", &self.id)
            .field("has_code", &!self.code.is_empty())
            .field("has_refresh_token", &!self.refresh_token.is_empty())
            .field("uid", &self.uid)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeStatus {
    /// Not scanned yet.
    Pending,
    Confirmed(TokenResponse),
    /// The broker reports the scan window closed or the user declined.
    Expired,
}

/// Instructions for the second leg of a QR-code challenge fetch.
#[derive(Debug, Clone, Deserialize)]
struct QrcodeRequestParams {
    method: String,
    url: String,
    #[serde(default)]
    data: String,
    #[serde(default)]
    header: HashMap<String, String>,
}

#[async_trait]
pub trait AuthBroker: Send + Sync {
    /// Redirect URL for the callback flow.
    fn callback_url(&self, plugin_id: &str) -> String;

    /// Fetches a fresh QR-code challenge. The body is vendor-shaped and parsed by the adapter.
    async fn fetch_challenge(&self, plugin_id: &str) -> Result<Vec<u8>>;

    async fn exchange_code(&self, request: &TokenRequest) -> Result<TokenResponse>;

    async fn poll_challenge_status(
        &self,
        plugin_id: &str,
        correlation_key: &str,
    ) -> Result<ChallengeStatus>;
}

/// [`AuthBroker`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAuthBroker {
    server_addr: String,
    session: HttpSession,
}

impl HttpAuthBroker {
    pub fn new(server_addr: impl Into<String>, session: HttpSession) -> Self {
        let server_addr = server_addr.into().trim_end_matches('/').to_string();
        Self {
            server_addr,
            session,
        }
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    fn endpoint(&self, uri: &str) -> String {
        format!("{}{}", self.server_addr, uri)
    }
}

#[async_trait]
impl AuthBroker for HttpAuthBroker {
    fn callback_url(&self, plugin_id: &str) -> String {
        format!("{}?id={}", self.endpoint(GET_AUTH_ADDR_URI), plugin_id)
    }

    #[instrument(skip(self))]
    async fn fetch_challenge(&self, plugin_id: &str) -> Result<Vec<u8>> {
        let client = self.session.client().await;
        let response = client
            .get(self.endpoint(GET_AUTH_QRCODE_URI))
            .query(&[("id", plugin_id)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), "qrcode params request failed");
            return Err(PluginError::upstream(Some(status.as_u16()), body));
        }
        let params: QrcodeRequestParams = response.json().await?;

        let method = reqwest::Method::from_bytes(params.method.as_bytes()).map_err(|_| {
            PluginError::upstream(
                None,
                format!("invalid qrcode request method '{}'", params.method),
            )
        })?;
        let data = percent_decode_str(&params.data)
            .decode_utf8()
            .map(|decoded| decoded.into_owned())
            .unwrap_or(params.data);

        let mut request = client.request(method, &params.url).body(data);
        for (name, value) in &params.header {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(PluginError::upstream(
                Some(status.as_u16()),
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }
        debug!(len = body.len(), "fetched qrcode challenge");
        Ok(body.to_vec())
    }

    #[instrument(skip_all, fields(plugin_id = %request.id))]
    async fn exchange_code(&self, request: &TokenRequest) -> Result<TokenResponse> {
        let response = self
            .session
            .client()
            .await
            .post(self.endpoint(GET_AUTH_TOKEN_URI))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), "token exchange failed");
            return Err(PluginError::upstream(Some(status.as_u16()), body));
        }
        Ok(response.json().await?)
    }

    #[instrument(skip(self, correlation_key))]
    async fn poll_challenge_status(
        &self,
        plugin_id: &str,
        correlation_key: &str,
    ) -> Result<ChallengeStatus> {
        let response = self
            .session
            .client()
            .await
            .get(self.endpoint(CHECK_AUTH_QRCODE_URI))
            .query(&[("id", plugin_id), ("key", correlation_key)])
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if status == StatusCode::GONE {
            return Ok(ChallengeStatus::Expired);
        }
        if body.is_empty() {
            return Ok(ChallengeStatus::Pending);
        }
        if status != StatusCode::OK {
            let message = String::from_utf8_lossy(&body).into_owned();
            if message.to_lowercase().contains("expired") {
                return Ok(ChallengeStatus::Expired);
            }
            return Err(PluginError::upstream(Some(status.as_u16()), message));
        }
        let token: TokenResponse = serde_json::from_slice(&body)?;
        Ok(ChallengeStatus::Confirmed(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::HttpSettings;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn broker(server: &MockServer) -> HttpAuthBroker {
        HttpAuthBroker::new(
            server.uri(),
            HttpSession::new(HttpSettings::default()).expect("session"),
        )
    }

    #[test]
    fn callback_url_targets_auth_addr() {
        let broker = HttpAuthBroker::new(
            "http://127.0.0.1:19971/",
            HttpSession::new(HttpSettings::default()).expect("session"),
        );
        assert_eq!(
            broker.callback_url("alipan"),
            "http://127.0.0.1:19971/api/get_auth_addr?id=alipan"
        );
    }

    #[tokio::test]
    async fn exchange_code_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/get_auth_token"))
            .and(body_json(json!({
                "id": "alipan",
                "code": "",
                "refresh_token": "r1",
                "uid": ""
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "a2",
                "refresh_token": "r2",
                "expires_in": 7200
            })))
            .mount(&server)
            .await;

        let token = broker(&server)
            .exchange_code(&TokenRequest::refresh("alipan", "r1"))
            .await
            .expect("exchange succeeds");
        assert_eq!(token.access_token, "a2");
        assert_eq!(token.expires_in, 7200);
    }

    #[tokio::test]
    async fn exchange_code_surfaces_upstream_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/get_auth_token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let err = broker(&server)
            .exchange_code(&TokenRequest::refresh("alipan", "r1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PluginError::Upstream { status: Some(400), ref message } if message == "invalid_grant"
        ));
    }

    #[tokio::test]
    async fn poll_distinguishes_pending_confirmed_expired() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/check_auth_qrcode"))
            .and(query_param("key", "pending"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/check_auth_qrcode"))
            .and(query_param("key", "ok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "a",
                "refresh_token": "r",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/check_auth_qrcode"))
            .and(query_param("key", "gone"))
            .respond_with(ResponseTemplate::new(410).set_body_string("qrcode expired"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/check_auth_qrcode"))
            .and(query_param("key", "broken"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
            .mount(&server)
            .await;

        let broker = broker(&server);
        assert_eq!(
            broker.poll_challenge_status("alipan", "pending").await.expect("poll"),
            ChallengeStatus::Pending
        );
        assert!(matches!(
            broker.poll_challenge_status("alipan", "ok").await.expect("poll"),
            ChallengeStatus::Confirmed(token) if token.access_token == "a"
        ));
        assert_eq!(
            broker.poll_challenge_status("alipan", "gone").await.expect("poll"),
            ChallengeStatus::Expired
        );
        assert!(matches!(
            broker.poll_challenge_status("alipan", "broken").await,
            Err(PluginError::Upstream { status: Some(500), .. })
        ));
    }

    #[tokio::test]
    async fn fetch_challenge_follows_request_params() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/get_auth_qrcode_v2"))
            .and(query_param("id", "alipan"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "method": "POST",
                "url": format!("{}/oauth/authorize/qrcode", server.uri()),
                "data": "%7B%22scopes%22%3A%5B%22user%3Abase%22%5D%7D",
                "header": {"X-Client": "plugins"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/authorize/qrcode"))
            .and(header("X-Client", "plugins"))
            .and(body_string(r#"{"scopes":["user:base"]}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "qrCodeUrl": "https://qr.example/abc",
                "sid": "sid-1"
            })))
            .mount(&server)
            .await;

        let body = broker(&server)
            .fetch_challenge("alipan")
            .await
            .expect("challenge fetched");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(parsed["sid"], "sid-1");
    }

    #[test]
    fn token_request_debug_hides_secrets() {
        let rendered = format!("{:?}", TokenRequest::refresh("alipan", "secret-refresh"));
        assert!(!rendered.contains("secret-refresh"));
    }
}
