use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use chrono::Utc;
use logferry_cloud::memory::{MemoryStagingStore, MemoryTargetStore};
use logferry_cloud::trust::{IdentityProvider, TrustExchange};
use logferry_cloud::{
    CleanupSweeper, ContentEncoding, CredentialBroker, CredentialScope, CrossCloudCredential,
    FerryError, FerryResult, ObjectNamingScheme, TransferWorker,
};
use logferry_functions::{AppState, router};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tower::ServiceExt;

struct StaticIdentity;

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn identity_token(&self, audience: &str) -> FerryResult<String> {
        Ok(format!("jwt-for-{audience}"))
    }
}

#[derive(Default)]
struct SwitchableExchange {
    deny: AtomicBool,
}

#[async_trait]
impl TrustExchange for SwitchableExchange {
    async fn exchange(
        &self,
        _assertion: &str,
        _scope: &CredentialScope,
    ) -> FerryResult<CrossCloudCredential> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(FerryError::AuthDenied("trust policy".into()));
        }
        Ok(CrossCloudCredential {
            access_key_id: "AKIATEST".into(),
            secret_access_key: "secret".into(),
            session_token: "session".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

struct App {
    staging: Arc<MemoryStagingStore>,
    target: Arc<MemoryTargetStore>,
    exchange: Arc<SwitchableExchange>,
    router: axum::Router,
}

fn app() -> App {
    let staging = Arc::new(MemoryStagingStore::new());
    let target = Arc::new(MemoryTargetStore::new());
    let exchange = Arc::new(SwitchableExchange::default());
    let broker = Arc::new(
        CredentialBroker::new(Arc::new(StaticIdentity), exchange.clone(), Duration::from_secs(300))
            .with_retry(1, Duration::from_millis(1)),
    );
    let worker = Arc::new(TransferWorker::new(
        staging.clone(),
        target.clone(),
        ObjectNamingScheme::new("logs/"),
        broker,
        CredentialScope::new("arn:aws:iam::1:role/w", "test", Duration::from_secs(3600)),
        "log-staging",
    ));
    let sweeper = Arc::new(CleanupSweeper::new(worker.clone(), 100, 2, Duration::from_secs(60)));
    let router = router(AppState::new(worker, sweeper, 4, Duration::from_secs(1800)));
    App {
        staging,
        target,
        exchange,
        router,
    }
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn healthz_is_ok() {
    let app = app();
    let response = app
        .router
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn transfer_returns_outcome() {
    let app = app();
    app.staging.insert(
        "log-staging",
        "a.jsonl",
        b"{\"m\":1}\n".to_vec(),
        Utc::now(),
        ContentEncoding::Identity,
    );

    let response = app
        .router
        .oneshot(post("/transfer", r#"{"bucket":"log-staging","name":"a.jsonl"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["target_key"], "logs/a.jsonl");
    assert!(app.target.get("logs/a.jsonl").is_some());
}

#[tokio::test]
async fn failed_transfer_is_still_ok_response() {
    let app = app();

    let response = app
        .router
        .oneshot(post("/transfer", r#"{"bucket":"log-staging","name":"missing"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "failed_permanent");
}

#[tokio::test]
async fn auth_denied_transfer_is_server_error() {
    let app = app();
    app.staging.insert("log-staging", "a.jsonl", b"x".to_vec(), Utc::now(), ContentEncoding::Identity);
    app.exchange.deny.store(true, Ordering::SeqCst);

    let response = app
        .router
        .oneshot(post("/transfer", r#"{"bucket":"log-staging","name":"a.jsonl"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json_body(response).await["error"].as_str().unwrap().contains("access denied"));
}

#[tokio::test]
async fn malformed_event_is_rejected() {
    let app = app();
    let response = app
        .router
        .oneshot(post("/transfer", r#"{"unexpected":true}"#))
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn sweep_returns_report() {
    let app = app();
    app.staging.insert(
        "log-staging",
        "old.jsonl",
        b"x\n".to_vec(),
        Utc::now() - chrono::Duration::hours(2),
        ContentEncoding::Identity,
    );
    app.staging.insert("log-staging", "new.jsonl", b"y\n".to_vec(), Utc::now(), ContentEncoding::Identity);

    let response = app.router.oneshot(post("/sweep", "")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["scanned"], 2);
    assert_eq!(body["retried"], 1);
    assert_eq!(body["succeeded"], 1);
    assert_eq!(body["complete"], true);
}

#[tokio::test]
async fn sweep_auth_denied_is_server_error() {
    let app = app();
    app.exchange.deny.store(true, Ordering::SeqCst);

    let response = app.router.oneshot(post("/sweep", "")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
