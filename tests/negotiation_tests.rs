use std::sync::Arc;

use chrono::{Duration, Utc};
use plugins::auth::{
    AuthMethod, HttpAuthBroker, Negotiator, QrcodeImage, Refresh, RefreshPolicy,
};
use plugins::credential::{Credential, CredentialCodec};
use plugins::crypto::CryptoKey;
use plugins::http_client::{HttpSession, HttpSettings};
use plugins::{HostAction, PluginError};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn negotiator(server: &MockServer, key: Option<CryptoKey>) -> Negotiator {
    let session = HttpSession::new(HttpSettings::default()).expect("session");
    let broker = Arc::new(HttpAuthBroker::new(server.uri(), session));
    Negotiator::new(CredentialCodec::new("alipan", key), broker)
}

fn qrcode(negotiator: &Negotiator, key: &str) -> plugins::auth::ScanQrcode {
    match negotiator.qrcode_method(QrcodeImage::Url("https://qr".into()), key, Utc::now()) {
        AuthMethod::ScanQrcode(qrcode) => qrcode,
        other => panic!("unexpected method {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_polls_yield_one_credential() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/check_auth_qrcode"))
        .and(query_param("id", "alipan"))
        .and(query_param("key", "sid-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "a",
            "refresh_token": "r",
            "expires_in": 7200
        })))
        .mount(&server)
        .await;

    let negotiator = Arc::new(negotiator(&server, None));
    let challenge = qrcode(&negotiator, "sid-7");

    let mut handles = Vec::new();
    for _ in 0..4 {
        let negotiator = negotiator.clone();
        let challenge = challenge.clone();
        handles.push(tokio::spawn(async move {
            negotiator.resolve_qrcode(&challenge, Utc::now()).await
        }));
    }

    let mut credentials = 0;
    let mut expired = 0;
    for handle in handles {
        match handle.await.expect("task") {
            Ok(Some(_)) => credentials += 1,
            Err(PluginError::QrcodeExpired) => expired += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(credentials, 1);
    assert_eq!(expired, 3);
}

#[tokio::test]
async fn broker_gone_status_expires_challenge() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/check_auth_qrcode"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let negotiator = negotiator(&server, None);
    let err = negotiator
        .resolve_qrcode(&qrcode(&negotiator, "sid-8"), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::QrcodeExpired));
    assert_eq!(err.host_action(), HostAction::Reprompt);
}

#[tokio::test]
async fn sealed_refresh_roundtrip_through_broker() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/get_auth_token"))
        .and(body_partial_json(json!({"id": "alipan", "refresh_token": "r1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "a2",
            "refresh_token": "r2",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let key = CryptoKey::new(vec![7u8; 32]).expect("key");
    let negotiator = negotiator(&server, Some(key));
    let now = Utc::now();
    let stale = Credential::new("a1", "r1", now - Duration::seconds(1));
    let auth_data = negotiator.issue(&stale).expect("sealed");
    assert!(RefreshPolicy::needs_refresh(&auth_data, now));

    let AuthMethod::Refresh(refresh) = RefreshPolicy::refresh_method(auth_data) else {
        panic!("expected refresh method");
    };
    let renewed = negotiator
        .resolve_refresh(&refresh, now)
        .await
        .expect("refreshed");
    assert_eq!(renewed.access_token, "a2");
    assert_eq!(renewed.refresh_token, "r2");
    assert_eq!(
        renewed.expires_at.timestamp(),
        (now + Duration::seconds(3300)).timestamp()
    );
}

#[tokio::test]
async fn record_from_other_key_is_rejected() {
    let server = MockServer::start().await;
    let sealed_by = negotiator(&server, Some(CryptoKey::new(vec![1u8; 32]).expect("key")));
    let opened_by = negotiator(&server, Some(CryptoKey::new(vec![2u8; 32]).expect("key")));

    let auth_data = sealed_by
        .issue(&Credential::new("a", "r", Utc::now()))
        .expect("sealed");
    let err = opened_by
        .resolve_refresh(&Refresh { auth_data }, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::InvalidAuthData(_)));
    assert_eq!(err.host_action(), HostAction::Reauthenticate);
}

#[tokio::test]
async fn broker_outage_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/get_auth_token"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let negotiator = negotiator(&server, None);
    let err = negotiator
        .refresh_credential(&Credential::new("a", "r", Utc::now()), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Upstream { status: Some(502), .. }));
    assert_eq!(err.host_action(), HostAction::RetryLater);
}
