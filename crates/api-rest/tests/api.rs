use api_rest::{router, AppState};
use api_shared::{ApiKeys, API_KEY_HEADER, PATIENT_SESSION_HEADER};
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uhi_codec::{
    Action, Context, Envelope, KeyId, SigningKeyPair, TrustedKeyRegistry, KEY_ID_HEADER,
    SIGNATURE_HEADER,
};
use uhi_core::{CoreConfig, Gateway, ManualClock, RecordingTransport};
use uhi_uuid::{ConsentId, MessageId, TransactionId};

const KEY: &str = "hiu-key";
const OTHER_KEY: &str = "other-key";

fn now() -> DateTime<Utc> {
    "2026-02-01T10:00:00Z".parse().unwrap()
}

fn provider_key() -> SigningKeyPair {
    SigningKeyPair::from_seed(KeyId::new("bpp2.example.org", "k1").unwrap(), &[2; 32])
}

fn app() -> Router {
    let config = CoreConfig::new(
        "bap.example.org".into(),
        "https://bap.example.org/uhi".into(),
    )
    .unwrap();
    let signing_key = SigningKeyPair::from_seed(
        KeyId::new("bap.example.org", "k1").unwrap(),
        &[1; 32],
    );
    let trusted = TrustedKeyRegistry::with_keys([provider_key().trusted_key()]);
    let gateway = Gateway::builder(Arc::new(config), Arc::new(signing_key))
        .with_clock(Arc::new(ManualClock::new(now())))
        .with_transport(Arc::new(RecordingTransport::new()))
        .with_trusted_keys(Arc::new(trusted))
        .build()
        .unwrap();
    router(AppState {
        gateway: Arc::new(gateway),
        api_keys: Arc::new(
            ApiKeys::new()
                .with_key(KEY, "hiu.example.org")
                .with_key(OTHER_KEY, "other.example.org"),
        ),
    })
}

fn post(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(API_KEY_HEADER, KEY)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(API_KEY_HEADER, KEY)
        .body(Body::empty())
        .unwrap()
}

/// Re-sends `request` under another participant's API key.
fn as_other(mut request: Request<Body>) -> Request<Body> {
    request
        .headers_mut()
        .insert(API_KEY_HEADER, OTHER_KEY.parse().unwrap());
    request
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn consent_request() -> Value {
    json!({
        "patient_id": "91-1234-5678-9012",
        "purpose": "CAREMGT",
        "scope": {
            "hi_types": ["Prescription"],
            "date_range": {"from": "2025-01-01T00:00:00Z", "to": "2026-01-31T00:00:00Z"},
            "data_erase_at": "2026-12-31T00:00:00Z"
        },
        "hiu_id": "hiu.example.org",
        "hip_id": "hip.example.org"
    })
}

fn patient_bundle() -> Value {
    json!({
        "resourceType": "Bundle",
        "type": "collection",
        "entry": [{
            "fullUrl": "urn:uuid:6c1d8a52-55a4-4b8e-9a59-0b7e1f3c9d10",
            "resource": {
                "resourceType": "Patient",
                "id": "p1",
                "identifier": [{"system": "https://healthid.ndhm.gov.in", "value": "91-1234-5678-9012"}],
                "name": [{"text": "Ravi Kumar"}],
                "gender": "male"
            }
        }]
    })
}

#[tokio::test]
async fn health_needs_no_credentials() {
    let app = app();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
}

#[tokio::test]
async fn requests_without_an_api_key_are_unauthenticated() {
    let app = app();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/consent/request")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(consent_request().to_string()))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], json!("unauthenticated"));
}

#[tokio::test]
async fn patient_sessions_are_refused_even_with_a_valid_key() {
    let app = app();
    let mut request = post("/consent/request", &consent_request());
    request
        .headers_mut()
        .insert(PATIENT_SESSION_HEADER, "session-token".parse().unwrap());
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], json!("patient_session_refused"));
}

#[tokio::test]
async fn consent_request_grant_and_release_check() {
    let app = app();
    let (status, body) = send(&app, post("/consent/request", &consent_request())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["consent"]["status"], json!("requested"));
    let consent_id = body["consent"]["id"].as_str().unwrap().to_owned();

    let grant = json!({
        "consent_id": consent_id,
        "authorization": {"method": "MOBILE_OTP", "proof": "482913"}
    });
    let (status, body) = send(&app, post("/consent/grant", &grant)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["consent"]["status"], json!("granted"));
    assert!(!body.to_string().contains("482913"));

    let (status, body) = send(&app, get(&format!("/consent/{consent_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["consent"]["status"], json!("granted"));

    let check = json!({
        "consent_id": consent_id,
        "release": {
            "hiu_id": "hiu.example.org",
            "hip_id": "hip.example.org",
            "hi_type": "Prescription",
            "record_date": "2025-06-01T00:00:00Z"
        }
    });
    let (status, body) = send(&app, post("/consent/check", &check)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"]["decision"], json!("allowed"));

    let (status, _) = send(&app, post("/consent/revoke", &json!({"consent_id": consent_id}))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&app, post("/consent/check", &check)).await;
    assert_eq!(body["decision"], json!({"decision": "denied", "reason": "revoked"}));

    let (status, body) = send(&app, post("/consent/deny", &json!({"consent_id": consent_id}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], json!("invalid_state"));
}

#[tokio::test]
async fn consents_are_only_visible_to_their_parties() {
    let app = app();
    let (status, body) = send(&app, as_other(post("/consent/request", &consent_request()))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], json!("forbidden"));

    let (_, body) = send(&app, post("/consent/request", &consent_request())).await;
    let consent_id = body["consent"]["id"].as_str().unwrap().to_owned();
    let id = json!({"consent_id": consent_id});
    let grant = json!({
        "consent_id": consent_id,
        "authorization": {"method": "MOBILE_OTP", "proof": "482913"}
    });

    for request in [
        get(&format!("/consent/{consent_id}")),
        post("/consent/grant", &grant),
        post("/consent/deny", &id),
        post("/consent/revoke", &id),
    ] {
        let (status, body) = send(&app, as_other(request)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], json!("forbidden"));
    }

    let check = json!({
        "consent_id": consent_id,
        "release": {
            "hiu_id": "hiu.example.org",
            "hip_id": "hip.example.org",
            "hi_type": "Prescription"
        }
    });
    let (status, _) = send(&app, as_other(post("/consent/check", &check))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, body) = send(&app, get(&format!("/consent/{consent_id}"))).await;
    assert_eq!(body["consent"]["status"], json!("requested"));
}

#[tokio::test]
async fn unknown_consent_is_not_found() {
    let app = app();
    let (status, _) = send(&app, get(&format!("/consent/{}", ConsentId::new()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bundle_validation_returns_canonical_form_or_every_error() {
    let app = app();
    let (status, body) = send(&app, post("/bundles/validate", &patient_bundle())).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["bundle"]["bundle_id"].is_string());
    assert_eq!(body["bundle"]["sha256"].as_str().unwrap().len(), 64);

    let mut bundle = patient_bundle();
    bundle["entry"][0]["resource"]["gender"] = json!("unknown-code");
    let (status, body) = send(&app, post("/bundles/validate", &bundle)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], json!("bundle_validation_failed"));
    assert!(!body["errors"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn preauth_requires_a_confirmed_transaction() {
    let app = app();
    let (_, body) = send(&app, post("/bundles/validate", &patient_bundle())).await;
    let bundle_id = body["bundle"]["bundle_id"].clone();

    let preauth = json!({
        "transaction_id": TransactionId::new(),
        "consent_id": ConsentId::new(),
        "hi_type": "Prescription",
        "bundle_ids": [bundle_id],
        "amount": {"minor_units": 125000, "currency": "INR"}
    });
    let (status, body) = send(&app, post("/claims/preauth", &preauth)).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["code"], json!("precondition_failed"));
}

fn on_select_from_provider() -> (Value, String, String) {
    let key = provider_key();
    let envelope = Envelope {
        context: Context {
            domain: "nic2004:85111".into(),
            action: Action::OnSelect,
            transaction_id: TransactionId::new(),
            message_id: MessageId::new(),
            bap_id: "bap.example.org".into(),
            bap_uri: "https://bap.example.org/uhi".into(),
            bpp_id: Some("bpp2.example.org".into()),
            bpp_uri: Some("https://bpp2.example.org/uhi".into()),
            timestamp: now(),
            ttl: 30,
            signature: None,
        },
        message: json!({"order": {}}),
    };
    let signed = uhi_codec::sign(envelope, &key).unwrap();
    let (signature, key_id) = signed.headers().unwrap();
    (signed.raw().clone(), signature, key_id)
}

fn callback(path: &str, body: &Value, signature: Option<(&str, &str)>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some((value, key_id)) = signature {
        builder = builder
            .header(SIGNATURE_HEADER, value)
            .header(KEY_ID_HEADER, key_id);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn callbacks_posted_to_the_wrong_action_path_are_nacked() {
    let app = app();
    let (body, signature, key_id) = on_select_from_provider();
    let (status, ack) = send(
        &app,
        callback("/on_search", &body, Some((&signature, &key_id))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(ack["message"]["ack"]["status"], json!("NACK"));
    assert_eq!(ack["error"]["code"], json!("malformed_envelope"));
}

#[tokio::test]
async fn unparseable_callbacks_are_nacked() {
    let app = app();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/on_select")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, ack) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(ack["message"]["ack"]["status"], json!("NACK"));
}

#[tokio::test]
async fn tampered_callbacks_fail_signature_checks() {
    let app = app();
    let (mut body, signature, key_id) = on_select_from_provider();
    body["message"]["order"] = json!({"quote": {"price": "1"}});
    let (status, ack) = send(
        &app,
        callback("/on_select", &body, Some((&signature, &key_id))),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(ack["error"]["code"], json!("signature_invalid"));
}

#[tokio::test]
async fn well_signed_callbacks_without_an_outstanding_request_are_refused() {
    let app = app();
    let (body, signature, key_id) = on_select_from_provider();
    let (status, ack) = send(
        &app,
        callback("/on_select", &body, Some((&signature, &key_id))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(ack["message"]["ack"]["status"], json!("NACK"));
    assert_eq!(ack["error"]["code"], json!("unmatched"));
}

#[tokio::test]
async fn unsigned_callbacks_are_refused() {
    let app = app();
    let (mut body, _, _) = on_select_from_provider();
    body["context"].as_object_mut().unwrap().remove("signature");
    let (status, ack) = send(&app, callback("/on_select", &body, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(ack["error"]["code"], json!("malformed_envelope"));
    assert_eq!(ack["message"]["ack"]["status"], json!("NACK"));
}
