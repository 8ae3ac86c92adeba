//! Resolves a chosen auth method into a credential.
//!
//! A `Negotiator` belongs to one adapter instance. It owns the broker handle,
//! the record codec and the set of QR challenges already redeemed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::auth::broker::{AuthBroker, ChallengeStatus, TokenRequest};
use crate::auth::form::FormData;
use crate::auth::refresh::RefreshPolicy;
use crate::auth::{AuthKind, AuthMethod, Callback, QrcodeImage, Refresh, ScanQrcode};
use crate::credential::{AuthData, Credential, CredentialCodec, TokenResponse};
use crate::error::{PluginError, Result};

pub const DEFAULT_QRCODE_TTL_SECS: i64 = 180;

const CALLBACK_TOKEN_PARAM: &str = "token";

pub struct Negotiator {
    codec: CredentialCodec,
    broker: Arc<dyn AuthBroker>,
    qrcode_ttl: Duration,
    /// Correlation key -> advertised expiry, for keys that already yielded a credential.
    consumed: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Negotiator {
    pub fn new(codec: CredentialCodec, broker: Arc<dyn AuthBroker>) -> Self {
        Self {
            codec,
            broker,
            qrcode_ttl: Duration::seconds(DEFAULT_QRCODE_TTL_SECS),
            consumed: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_qrcode_ttl(mut self, ttl: Duration) -> Self {
        self.qrcode_ttl = ttl;
        self
    }

    pub fn plugin_id(&self) -> &str {
        self.codec.plugin_id()
    }

    pub fn codec(&self) -> &CredentialCodec {
        &self.codec
    }

    pub fn callback_method(&self) -> AuthMethod {
        AuthMethod::Callback(Callback {
            callback_url: self.broker.callback_url(self.plugin_id()),
            callback_url_data: None,
        })
    }

    /// Fetches a fresh challenge from the broker. Nothing is recorded locally,
    /// so an unused challenge costs nothing.
    pub async fn fetch_challenge(&self) -> Result<Vec<u8>> {
        self.broker.fetch_challenge(self.plugin_id()).await
    }

    pub fn qrcode_method(
        &self,
        image: QrcodeImage,
        correlation_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> AuthMethod {
        AuthMethod::ScanQrcode(ScanQrcode {
            image,
            correlation_key: correlation_key.into(),
            expires_at: now + self.qrcode_ttl,
        })
    }

    /// Seals a credential into host-facing auth data.
    pub fn issue(&self, credential: &Credential) -> Result<AuthData> {
        self.codec.encode_credential(credential)
    }

    pub fn resolve_callback(&self, callback: &Callback, now: DateTime<Utc>) -> Result<Credential> {
        let result = decode_callback_token(callback).and_then(|token| {
            Credential::from_token_response(&token, now)
                .map_err(|err| PluginError::MalformedCallback(err.to_string()))
        });
        self.observe(AuthKind::Callback, &result);
        result
    }

    /// `Ok(None)` means the code has not been scanned yet.
    #[instrument(skip_all, fields(plugin_id = %self.plugin_id()))]
    pub async fn resolve_qrcode(
        &self,
        qrcode: &ScanQrcode,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>> {
        let result = self.poll_qrcode(qrcode, now).await;
        if !matches!(result, Ok(None)) {
            self.observe(AuthKind::ScanQrcode, &result);
        }
        result
    }

    async fn poll_qrcode(
        &self,
        qrcode: &ScanQrcode,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>> {
        if now >= qrcode.expires_at {
            debug!("qrcode past advertised expiry");
            return Err(PluginError::QrcodeExpired);
        }
        if self.is_consumed(&qrcode.correlation_key, now) {
            debug!("qrcode already redeemed");
            return Err(PluginError::QrcodeExpired);
        }

        let status = self
            .broker
            .poll_challenge_status(self.plugin_id(), &qrcode.correlation_key)
            .await?;

        match status {
            ChallengeStatus::Pending => Ok(None),
            ChallengeStatus::Expired => Err(PluginError::QrcodeExpired),
            ChallengeStatus::Confirmed(token) => {
                if !self.mark_consumed(&qrcode.correlation_key, qrcode.expires_at, now) {
                    return Err(PluginError::QrcodeExpired);
                }
                info!("qrcode scan confirmed");
                Credential::from_token_response(&token, now).map(Some)
            }
        }
    }

    /// Decodes the credential embedded in `refresh` and renews it through the broker.
    pub async fn resolve_refresh(
        &self,
        refresh: &Refresh,
        now: DateTime<Utc>,
    ) -> Result<Credential> {
        let previous = self.codec.decode_credential(&refresh.auth_data.bytes)?;
        self.refresh_credential(&previous, now).await
    }

    #[instrument(skip_all, fields(plugin_id = %self.plugin_id()))]
    pub async fn refresh_credential(
        &self,
        previous: &Credential,
        now: DateTime<Utc>,
    ) -> Result<Credential> {
        let result = self.exchange_refresh(previous, now).await;
        self.observe(AuthKind::Refresh, &result);
        result
    }

    async fn exchange_refresh(
        &self,
        previous: &Credential,
        now: DateTime<Utc>,
    ) -> Result<Credential> {
        if previous.refresh_token.is_empty() {
            return Err(PluginError::RefreshRejected(
                "stored credential has no refresh token".into(),
            ));
        }

        let request = TokenRequest::refresh(self.plugin_id(), previous.refresh_token.clone());
        let mut token = self
            .broker
            .exchange_code(&request)
            .await
            .map_err(RefreshPolicy::on_refresh_failure)?;

        if token.refresh_token.is_empty() {
            token.refresh_token = previous.refresh_token.clone();
        }
        Credential::from_token_response(&token, now)
    }

    /// Runs a vendor-specific refresh exchange and records its outcome.
    pub async fn refresh_with<Fut>(&self, now: DateTime<Utc>, exchange: Fut) -> Result<Credential>
    where
        Fut: Future<Output = Result<TokenResponse>>,
    {
        let result = match exchange.await {
            Ok(token) => Credential::from_token_response(&token, now),
            Err(err) => Err(RefreshPolicy::on_refresh_failure(err)),
        };
        self.observe(AuthKind::Refresh, &result);
        result
    }

    /// Validates `submitted` against `advertised`, then runs the vendor exchange.
    ///
    /// `exchange` receives the validated form and may hand back whatever it
    /// derived from it alongside the grant.
    pub async fn resolve_form<F, Fut, T>(
        &self,
        submitted: &FormData,
        advertised: &FormData,
        now: DateTime<Utc>,
        exchange: F,
    ) -> Result<(Credential, T)>
    where
        F: FnOnce(FormData) -> Fut,
        Fut: Future<Output = Result<(TokenResponse, T)>>,
    {
        let result = match submitted.validate_against(advertised) {
            Ok(()) => exchange(submitted.clone()).await.and_then(|(token, derived)| {
                Credential::from_token_response(&token, now).map(|credential| (credential, derived))
            }),
            Err(err) => Err(err),
        };
        self.observe(AuthKind::FormInput, &result);
        result
    }

    fn is_consumed(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut consumed = self
            .consumed
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        consumed.retain(|_, expires_at| *expires_at > now);
        consumed.contains_key(key)
    }

    /// Returns false if another caller redeemed `key` first.
    fn mark_consumed(&self, key: &str, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let mut consumed = self
            .consumed
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        consumed.retain(|_, at| *at > now);
        if consumed.contains_key(key) {
            return false;
        }
        consumed.insert(key.to_string(), expires_at);
        true
    }

    fn observe<T>(&self, kind: AuthKind, result: &Result<T>) {
        let plugin = self.plugin_id().to_string();
        match result {
            Ok(_) => {
                counter!(
                    "plugins_auth_resolved_total",
                    "plugin" => plugin,
                    "method" => kind.as_str()
                )
                .increment(1);
            }
            Err(err) => {
                warn!(plugin_id = %plugin, method = %kind, error = %err, "auth negotiation failed");
                counter!(
                    "plugins_auth_failed_total",
                    "plugin" => plugin,
                    "method" => kind.as_str()
                )
                .increment(1);
            }
        }
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("plugin_id", &self.plugin_id())
            .field("qrcode_ttl", &self.qrcode_ttl)
            .finish()
    }
}

fn decode_callback_token(callback: &Callback) -> Result<TokenResponse> {
    let data = callback
        .callback_url_data
        .as_deref()
        .filter(|data| !data.is_empty())
        .ok_or_else(|| PluginError::MalformedCallback("callback carries no URL data".into()))?;
    let url = Url::parse(data)
        .map_err(|e| PluginError::MalformedCallback(format!("unparsable callback URL: {e}")))?;
    let encoded = url
        .query_pairs()
        .find(|(name, _)| name == CALLBACK_TOKEN_PARAM)
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| {
            PluginError::MalformedCallback("callback URL has no token parameter".into())
        })?;

    let bytes = general_purpose::URL_SAFE
        .decode(&encoded)
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(&encoded))
        .map_err(|e| PluginError::MalformedCallback(format!("token is not base64: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| PluginError::MalformedCallback(format!("token payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Broker double with scripted poll results.
    struct ScriptedBroker {
        polls: Mutex<Vec<ChallengeStatus>>,
        poll_calls: AtomicUsize,
        exchange: Mutex<Option<Result<TokenResponse>>>,
        last_request: Mutex<Option<TokenRequest>>,
    }

    impl ScriptedBroker {
        fn new(polls: Vec<ChallengeStatus>) -> Self {
            Self {
                polls: Mutex::new(polls),
                poll_calls: AtomicUsize::new(0),
                exchange: Mutex::new(None),
                last_request: Mutex::new(None),
            }
        }

        fn with_exchange(self, result: Result<TokenResponse>) -> Self {
            *self.exchange.lock().expect("lock") = Some(result);
            self
        }
    }

    #[async_trait]
    impl AuthBroker for ScriptedBroker {
        fn callback_url(&self, plugin_id: &str) -> String {
            format!("http://broker/api/get_auth_addr?id={plugin_id}")
        }

        async fn fetch_challenge(&self, _plugin_id: &str) -> Result<Vec<u8>> {
            Ok(br#"{"qrCodeUrl":"u","sid":"s"}"#.to_vec())
        }

        async fn exchange_code(&self, request: &TokenRequest) -> Result<TokenResponse> {
            *self.last_request.lock().expect("lock") = Some(request.clone());
            self.exchange
                .lock()
                .expect("lock")
                .take()
                .unwrap_or_else(|| Err(PluginError::transport("no scripted exchange")))
        }

        async fn poll_challenge_status(
            &self,
            _plugin_id: &str,
            _key: &str,
        ) -> Result<ChallengeStatus> {
            self.poll_calls.fetch_add(1, Ordering::SeqCst);
            let mut polls = self.polls.lock().expect("lock");
            if polls.is_empty() {
                return Ok(ChallengeStatus::Pending);
            }
            Ok(polls.remove(0))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 11, 2, 45, 0).single().expect("valid time")
    }

    fn token(access: &str, refresh: &str, expires_in: i64) -> TokenResponse {
        TokenResponse {
            access_token: access.into(),
            refresh_token: refresh.into(),
            expires_in,
            token_type: None,
        }
    }

    fn negotiator(broker: ScriptedBroker) -> (Negotiator, Arc<ScriptedBroker>) {
        let broker = Arc::new(broker);
        let negotiator = Negotiator::new(CredentialCodec::new("alipan", None), broker.clone());
        (negotiator, broker)
    }

    fn callback_with(data: Option<String>) -> Callback {
        Callback {
            callback_url: "http://broker/api/get_auth_addr?id=alipan".into(),
            callback_url_data: data,
        }
    }

    #[test]
    fn callback_token_is_decoded_with_margin() {
        let (negotiator, _) = negotiator(ScriptedBroker::new(vec![]));
        let payload = serde_json::to_vec(&token("a", "r", 7200)).expect("json");
        let encoded = general_purpose::URL_SAFE.encode(payload);
        let callback = callback_with(Some(format!("mediagate://alipan/?token={encoded}")));

        let credential = negotiator.resolve_callback(&callback, now()).expect("decodes");
        assert_eq!(credential.access_token, "a");
        assert_eq!(credential.expires_at, now() + Duration::seconds(6900));
    }

    #[test]
    fn callback_accepts_unpadded_token() {
        let (negotiator, _) = negotiator(ScriptedBroker::new(vec![]));
        let payload = serde_json::to_vec(&token("a", "r", 3600)).expect("json");
        let encoded = general_purpose::URL_SAFE_NO_PAD.encode(payload);
        let callback = callback_with(Some(format!("mediagate://alipan/?state=1&token={encoded}")));
        assert!(negotiator.resolve_callback(&callback, now()).is_ok());
    }

    #[test]
    fn malformed_callbacks_rejected() {
        let (negotiator, _) = negotiator(ScriptedBroker::new(vec![]));
        for data in [
            None,
            Some("not a url".to_string()),
            Some("mediagate://alipan/?code=abc".to_string()),
            Some("mediagate://alipan/?token=***".to_string()),
            Some(format!(
                "mediagate://alipan/?token={}",
                general_purpose::URL_SAFE.encode(b"not json")
            )),
        ] {
            let err = negotiator
                .resolve_callback(&callback_with(data.clone()), now())
                .unwrap_err();
            assert!(matches!(err, PluginError::MalformedCallback(_)), "{data:?}");
        }
    }

    #[test]
    fn callback_with_unrepresentable_lifetime_is_malformed() {
        let (negotiator, _) = negotiator(ScriptedBroker::new(vec![]));
        for expires_in in [i64::MAX, i64::MIN] {
            let payload = serde_json::to_vec(&token("a", "r", expires_in)).expect("json");
            let encoded = general_purpose::URL_SAFE.encode(payload);
            let callback = callback_with(Some(format!("mediagate://alipan/?token={encoded}")));
            let err = negotiator.resolve_callback(&callback, now()).unwrap_err();
            assert!(matches!(err, PluginError::MalformedCallback(_)), "{expires_in}");
        }
    }

    #[tokio::test]
    async fn confirmed_grant_with_unrepresentable_lifetime_is_upstream() {
        let (negotiator, _) = negotiator(ScriptedBroker::new(vec![ChallengeStatus::Confirmed(
            token("a", "r", i64::MAX),
        )]));
        let AuthMethod::ScanQrcode(qrcode) =
            negotiator.qrcode_method(QrcodeImage::Url("https://qr".into()), "sid", now())
        else {
            panic!("expected qrcode");
        };
        let err = negotiator.resolve_qrcode(&qrcode, now()).await.unwrap_err();
        assert!(matches!(err, PluginError::Upstream { .. }));
    }

    #[tokio::test]
    async fn qrcode_pending_then_confirmed_once() {
        let (negotiator, _) = negotiator(ScriptedBroker::new(vec![
            ChallengeStatus::Pending,
            ChallengeStatus::Pending,
            ChallengeStatus::Confirmed(token("a", "r", 7200)),
            ChallengeStatus::Confirmed(token("a", "r", 7200)),
        ]));
        let AuthMethod::ScanQrcode(qrcode) =
            negotiator.qrcode_method(QrcodeImage::Url("u".into()), "sid-1", now())
        else {
            panic!("expected qrcode method");
        };

        assert!(negotiator.resolve_qrcode(&qrcode, now()).await.expect("pending").is_none());
        assert!(negotiator.resolve_qrcode(&qrcode, now()).await.expect("pending").is_none());
        let credential = negotiator
            .resolve_qrcode(&qrcode, now())
            .await
            .expect("confirmed")
            .expect("credential");
        assert_eq!(credential.access_token, "a");

        let err = negotiator.resolve_qrcode(&qrcode, now()).await.unwrap_err();
        assert!(matches!(err, PluginError::QrcodeExpired));
    }

    #[tokio::test]
    async fn qrcode_past_expiry_skips_broker() {
        let (negotiator, broker) = negotiator(ScriptedBroker::new(vec![]));
        let AuthMethod::ScanQrcode(qrcode) =
            negotiator.qrcode_method(QrcodeImage::Url("u".into()), "sid-1", now())
        else {
            panic!("expected qrcode method");
        };
        assert_eq!(qrcode.expires_at, now() + Duration::seconds(180));

        let later = now() + Duration::seconds(180);
        let err = negotiator.resolve_qrcode(&qrcode, later).await.unwrap_err();
        assert!(matches!(err, PluginError::QrcodeExpired));
        assert_eq!(broker.poll_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn qrcode_broker_expiry_is_error() {
        let (negotiator, _) = negotiator(ScriptedBroker::new(vec![ChallengeStatus::Expired]));
        let AuthMethod::ScanQrcode(qrcode) =
            negotiator.qrcode_method(QrcodeImage::Url("u".into()), "sid-2", now())
        else {
            panic!("expected qrcode method");
        };
        assert!(matches!(
            negotiator.resolve_qrcode(&qrcode, now()).await,
            Err(PluginError::QrcodeExpired)
        ));
    }

    #[tokio::test]
    async fn refresh_keeps_refresh_token_when_not_rotated() {
        let (negotiator, broker) = negotiator(
            ScriptedBroker::new(vec![]).with_exchange(Ok(token("a2", "", 7200))),
        );
        let previous = Credential::new("a1", "r1", now());
        let auth_data = negotiator.issue(&previous).expect("encode");

        let renewed = negotiator
            .resolve_refresh(&Refresh { auth_data }, now())
            .await
            .expect("refreshed");
        assert_eq!(renewed.access_token, "a2");
        assert_eq!(renewed.refresh_token, "r1");
        let request = broker.last_request.lock().expect("lock").clone().expect("sent");
        assert_eq!(request.refresh_token, "r1");
        assert_eq!(request.id, "alipan");
    }

    #[tokio::test]
    async fn revoked_refresh_token_is_rejected() {
        let (negotiator, _) = negotiator(ScriptedBroker::new(vec![]).with_exchange(Err(
            PluginError::upstream(Some(400), "invalid_grant: token revoked"),
        )));
        let previous = Credential::new("a1", "r1", now());
        let err = negotiator.refresh_credential(&previous, now()).await.unwrap_err();
        assert!(matches!(err, PluginError::RefreshRejected(_)));
    }

    #[tokio::test]
    async fn refresh_transport_error_propagates() {
        let (negotiator, _) = negotiator(
            ScriptedBroker::new(vec![]).with_exchange(Err(PluginError::transport("reset"))),
        );
        let previous = Credential::new("a1", "r1", now());
        let err = negotiator.refresh_credential(&previous, now()).await.unwrap_err();
        assert!(matches!(err, PluginError::Transport(_)));
    }

    #[tokio::test]
    async fn missing_refresh_token_is_rejected_without_exchange() {
        let (negotiator, broker) = negotiator(ScriptedBroker::new(vec![]));
        let previous = Credential::new("a1", "", now());
        let err = negotiator.refresh_credential(&previous, now()).await.unwrap_err();
        assert!(matches!(err, PluginError::RefreshRejected(_)));
        assert!(broker.last_request.lock().expect("lock").is_none());
    }
}
