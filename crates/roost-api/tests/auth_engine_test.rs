#![allow(clippy::unwrap_used)]
// Integration tests for the login state machine using wiremock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use roost_api::auth::{AuthConfig, AuthEngine};
use roost_api::session::{SessionDetails, SessionStore};
use roost_api::tfa::TwoFactorProvider;
use roost_api::transport::{FingerprintProfile, TransportConfig};
use roost_api::{CloudClient, Error};

// ── Helpers ─────────────────────────────────────────────────────────

struct Harness {
    server: MockServer,
    client: CloudClient,
    store: SessionStore,
    _dir: tempfile::TempDir,
}

async fn setup() -> Harness {
    let server = MockServer::start().await;
    let url = Url::parse(&server.uri()).unwrap();

    let transport = TransportConfig {
        timeout: Duration::from_secs(5),
        profiles: vec![FingerprintProfile { name: "default", http1_only: false, tls12_max: false }],
        ..Default::default()
    };
    let client = CloudClient::new(&transport, url.clone(), url).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(
        dir.path().join("session.json"),
        dir.path().join("cookies.txt"),
        "user@example.com".into(),
        true,
    );

    Harness { server, client, store, _dir: dir }
}

fn engine_config() -> AuthConfig {
    AuthConfig {
        username: "user@example.com".into(),
        password: "hunter2".to_owned().into(),
        attempts: 1,
        retry_delay: Duration::from_millis(10),
        tfa_retries: 3,
        tfa_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

fn engine() -> AuthEngine {
    let transport = TransportConfig {
        timeout: Duration::from_secs(5),
        profiles: vec![FingerprintProfile { name: "default", http1_only: false, tls12_max: false }],
        ..Default::default()
    };
    AuthEngine::new(engine_config(), transport)
}

fn ok_envelope(data: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"meta": {"code": 200}, "data": data}))
}

fn rejected_envelope() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "meta": {"code": 400, "message": "untrusted", "error": 9204}
    }))
}

fn auth_body(completed: bool) -> serde_json::Value {
    json!({
        "token": "tok-1",
        "userId": "U1",
        "expiresIn": chrono::Utc::now().timestamp() + 86_400,
        "authCompleted": completed,
    })
}

async fn mount_validate(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/validateAccessToken"))
        .respond_with(ok_envelope(json!({})))
        .mount(server)
        .await;
}

// A scripted second factor standing in for the console provider.
struct ScriptedTfa {
    code: Option<String>,
    started: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl TwoFactorProvider for ScriptedTfa {
    async fn start(&mut self) -> bool {
        self.started.store(true, Ordering::SeqCst);
        true
    }

    async fn get(&mut self) -> Option<String> {
        self.code.clone()
    }

    async fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn fresh_login_without_second_factor_reaches_success() {
    let harness = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/auth"))
        .respond_with(ok_envelope(auth_body(true)))
        .expect(1)
        .mount(&harness.server)
        .await;
    mount_validate(&harness.server).await;

    let mut details = harness.store.load();
    engine()
        .login(&harness.client, &mut details, &harness.store)
        .await
        .unwrap();

    assert_eq!(details.user_id.as_deref(), Some("U1"));
    assert_eq!(details.web_id.as_deref(), Some("U1_web"));
    assert_eq!(details.token.as_deref(), Some("tok-1"));

    // The session record is persisted with a stable client id.
    let reloaded = harness.store.load();
    assert_eq!(reloaded.device_id, details.device_id);
    assert!(!reloaded.device_id.is_empty());
    assert_eq!(reloaded.token.as_deref(), Some("tok-1"));
}

#[tokio::test]
async fn untrusted_browser_runs_the_full_challenge_path() {
    let harness = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/auth"))
        .respond_with(ok_envelope(auth_body(false)))
        .expect(1)
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/getFactorId"))
        .respond_with(rejected_envelope())
        .expect(1)
        .mount(&harness.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/getFactors"))
        .respond_with(ok_envelope(json!({
            "items": [
                {"factorId": "f-mail", "factorType": "EMAIL", "factorNickname": "main"},
            ]
        })))
        .expect(1)
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/startAuth"))
        .respond_with(ok_envelope(json!({"factorAuthCode": "fac-1"})))
        .expect(1)
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/finishAuth"))
        .respond_with(ok_envelope(json!({
            "token": "tok-2",
            "userId": "U1",
            "expiresIn": chrono::Utc::now().timestamp() + 86_400,
            "browserAuthCode": "trust-me",
        })))
        .expect(1)
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/startPairingFactor"))
        .respond_with(ok_envelope(json!({})))
        .expect(1)
        .mount(&harness.server)
        .await;
    mount_validate(&harness.server).await;

    let started = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    let (started_c, stopped_c) = (started.clone(), stopped.clone());

    let mut details = harness.store.load();
    engine()
        .with_provider_factory(Box::new(move |_| {
            Box::new(ScriptedTfa {
                code: Some("123456".into()),
                started: started_c.clone(),
                stopped: stopped_c.clone(),
            })
        }))
        .login(&harness.client, &mut details, &harness.store)
        .await
        .unwrap();

    assert!(started.load(Ordering::SeqCst), "provider must be started");
    assert!(stopped.load(Ordering::SeqCst), "provider must be stopped");
    assert_eq!(details.token.as_deref(), Some("tok-2"));
}

#[tokio::test]
async fn wrong_password_fails_immediately_without_second_factor() {
    let harness = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/auth"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/startAuth"))
        .respond_with(ok_envelope(json!({})))
        .expect(0)
        .mount(&harness.server)
        .await;

    let started = Arc::new(AtomicBool::new(false));
    let started_c = started.clone();

    let mut details = harness.store.load();
    let result = engine()
        .with_provider_factory(Box::new(move |_| {
            started_c.store(true, Ordering::SeqCst);
            Box::new(ScriptedTfa {
                code: None,
                started: Arc::new(AtomicBool::new(false)),
                stopped: Arc::new(AtomicBool::new(false)),
            })
        }))
        .login(&harness.client, &mut details, &harness.store)
        .await;

    assert!(matches!(result, Err(Error::Authentication { .. })));
    assert!(!started.load(Ordering::SeqCst), "no provider on credential rejection");
}

#[tokio::test]
async fn cached_token_inside_margin_skips_login() {
    let harness = setup().await;

    mount_validate(&harness.server).await;
    Mock::given(method("POST"))
        .and(path("/api/auth"))
        .respond_with(ok_envelope(auth_body(true)))
        .expect(0)
        .mount(&harness.server)
        .await;

    // Seed a session whose token is comfortably inside its lifetime.
    let mut details = harness.store.load();
    details.update_from_auth(&json!({
        "token": "cached",
        "userId": "U1",
        "expiresIn": chrono::Utc::now().timestamp() + 86_400,
    }));
    harness.store.save(&details);

    let mut details = harness.store.load();
    engine()
        .login(&harness.client, &mut details, &harness.store)
        .await
        .unwrap();

    assert_eq!(details.token.as_deref(), Some("cached"));
}

#[tokio::test]
async fn cached_token_past_margin_routes_through_login() {
    let harness = setup().await;

    mount_validate(&harness.server).await;
    Mock::given(method("POST"))
        .and(path("/api/auth"))
        .respond_with(ok_envelope(auth_body(true)))
        .expect(1)
        .mount(&harness.server)
        .await;

    // Token expires inside the safety margin: treated as expired.
    let mut details = harness.store.load();
    details.update_from_auth(&json!({
        "token": "stale",
        "userId": "U1",
        "expiresIn": chrono::Utc::now().timestamp() + 60,
    }));
    harness.store.save(&details);

    let mut details = harness.store.load();
    engine()
        .login(&harness.client, &mut details, &harness.store)
        .await
        .unwrap();

    assert_eq!(details.token.as_deref(), Some("tok-1"));
}

#[tokio::test]
async fn push_approval_retries_only_the_finish_call() {
    let harness = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/auth"))
        .respond_with(ok_envelope(auth_body(false)))
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/getFactorId"))
        .respond_with(rejected_envelope())
        .mount(&harness.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/getFactors"))
        .respond_with(ok_envelope(json!({
            "items": [{"factorId": "f-push", "factorType": "PUSH"}]
        })))
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/startAuth"))
        .respond_with(ok_envelope(json!({"factorAuthCode": "fac-push"})))
        .expect(1)
        .mount(&harness.server)
        .await;
    // The first two finish calls report "not approved yet"; the third
    // succeeds. Challenge start must NOT be re-run in between.
    Mock::given(method("POST"))
        .and(path("/api/finishAuth"))
        .respond_with(rejected_envelope())
        .up_to_n_times(2)
        .expect(2)
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/finishAuth"))
        .respond_with(ok_envelope(json!({
            "token": "tok-push",
            "userId": "U1",
            "expiresIn": chrono::Utc::now().timestamp() + 86_400,
        })))
        .expect(1)
        .mount(&harness.server)
        .await;
    mount_validate(&harness.server).await;

    let mut cfg = engine_config();
    cfg.factor_kind = "push".into();

    let transport = TransportConfig {
        timeout: Duration::from_secs(5),
        profiles: vec![FingerprintProfile { name: "default", http1_only: false, tls12_max: false }],
        ..Default::default()
    };

    let calls = Arc::new(AtomicU32::new(0));
    let calls_c = calls.clone();

    let mut details = harness.store.load();
    AuthEngine::new(cfg, transport)
        .with_provider_factory(Box::new(move |_| {
            calls_c.fetch_add(1, Ordering::SeqCst);
            Box::new(ScriptedTfa {
                // Empty code: the finish call performs the wait.
                code: Some(String::new()),
                started: Arc::new(AtomicBool::new(false)),
                stopped: Arc::new(AtomicBool::new(false)),
            })
        }))
        .login(&harness.client, &mut details, &harness.store)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1, "one provider per challenge");
    assert_eq!(details.token.as_deref(), Some("tok-push"));
}

#[tokio::test]
async fn exhausted_profiles_fail_the_login() {
    let harness = setup().await;

    // Edge keeps rejecting with a retryable status.
    Mock::given(method("POST"))
        .and(path("/api/auth"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&harness.server)
        .await;

    let mut details = harness.store.load();
    let result = engine()
        .login(&harness.client, &mut details, &harness.store)
        .await;

    assert!(matches!(result, Err(Error::Authentication { .. })));
}

// Scripted session-details check: a SessionDetails travelling through
// the engine keeps its device id even across a full re-login.
#[tokio::test]
async fn device_id_is_stable_across_relogin() {
    let harness = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/auth"))
        .respond_with(ok_envelope(auth_body(true)))
        .mount(&harness.server)
        .await;
    mount_validate(&harness.server).await;

    let mut details = harness.store.load();
    let device_id = details.device_id.clone();

    engine()
        .login(&harness.client, &mut details, &harness.store)
        .await
        .unwrap();
    engine()
        .login(&harness.client, &mut details, &harness.store)
        .await
        .unwrap();

    assert_eq!(details.device_id, device_id);
    let _unused: SessionDetails = harness.store.load();
}
