//! Credential lifecycle: caching, refresh, single-flight and retry policy.

mod support;

use logferry_cloud::{CredentialBroker, CredentialScope, FerryError};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use support::{FakeExchange, FakeIdentity, ROLE_ARN, creds_expiring_in, scope};

fn broker(exchange: Arc<FakeExchange>) -> CredentialBroker {
    CredentialBroker::new(
        Arc::new(FakeIdentity::default()),
        exchange,
        Duration::from_secs(300),
    )
    .with_retry(3, Duration::from_millis(1))
}

// ── Expiry helpers ──

#[test]
fn expired_credential_is_expired() {
    assert!(creds_expiring_in(-60).is_expired());
    assert!(!creds_expiring_in(3600).is_expired());
}

#[test]
fn expires_within_margin() {
    assert!(creds_expiring_in(200).expires_within(Duration::from_secs(300)));
    assert!(!creds_expiring_in(3600).expires_within(Duration::from_secs(300)));
}

#[test]
fn debug_redacts_secrets() {
    let rendered = format!("{:?}", creds_expiring_in(3600));
    assert!(rendered.contains("AKIATEST"));
    assert!(!rendered.contains("secret\""));
    assert!(!rendered.contains("\"token\""));
    assert!(rendered.contains("<redacted>"));
}

// ── Caching ──

#[tokio::test]
async fn second_acquire_is_served_from_cache() {
    let exchange = Arc::new(FakeExchange::default());
    let broker = broker(exchange.clone());

    let first = broker.acquire(&scope()).await.unwrap();
    let second = broker.acquire(&scope()).await.unwrap();

    assert_eq!(exchange.calls(), 1);
    assert_eq!(first, second);
    assert!(broker.has_valid(&scope()).await);
}

#[tokio::test]
async fn identity_token_audience_is_role_arn() {
    let identity = Arc::new(FakeIdentity::default());
    let broker = CredentialBroker::new(
        identity.clone(),
        Arc::new(FakeExchange::default()),
        Duration::from_secs(300),
    );

    broker.acquire(&scope()).await.unwrap();

    assert_eq!(identity.audiences(), vec![ROLE_ARN.to_string()]);
}

#[tokio::test]
async fn credential_inside_margin_is_refreshed() {
    // Every credential expires in 2 minutes, inside the 5 minute margin.
    let exchange = Arc::new(FakeExchange::default().with_lifetime(chrono::Duration::minutes(2)));
    let broker = broker(exchange.clone());

    let first = broker.acquire(&scope()).await.unwrap();
    let second = broker.acquire(&scope()).await.unwrap();

    assert_eq!(exchange.calls(), 2);
    assert_ne!(first.access_key_id, second.access_key_id);
    assert!(!broker.has_valid(&scope()).await);
}

#[tokio::test]
async fn scopes_are_cached_separately() {
    let exchange = Arc::new(FakeExchange::default());
    let broker = broker(exchange.clone());
    let other = CredentialScope::new(ROLE_ARN, "other-session", Duration::from_secs(3600));

    broker.acquire(&scope()).await.unwrap();
    broker.acquire(&other).await.unwrap();
    broker.acquire(&scope()).await.unwrap();

    assert_eq!(exchange.calls(), 2);
}

#[tokio::test]
async fn invalidate_forces_new_exchange() {
    let exchange = Arc::new(FakeExchange::default());
    let broker = broker(exchange.clone());

    broker.acquire(&scope()).await.unwrap();
    broker.invalidate(&scope()).await;
    assert!(!broker.has_valid(&scope()).await);
    broker.acquire(&scope()).await.unwrap();

    assert_eq!(exchange.calls(), 2);
}

#[tokio::test]
async fn clear_drops_every_scope() {
    let exchange = Arc::new(FakeExchange::default());
    let broker = broker(exchange.clone());

    broker.acquire(&scope()).await.unwrap();
    broker.clear().await;

    assert!(!broker.has_valid(&scope()).await);
}

// ── Single flight ──

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_exchange() {
    let exchange = Arc::new(FakeExchange::default().with_delay(Duration::from_millis(200)));
    let broker = Arc::new(broker(exchange.clone()));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let broker = broker.clone();
            tokio::spawn(async move { broker.acquire(&scope()).await })
        })
        .collect();

    let mut keys = Vec::new();
    for handle in handles {
        keys.push(handle.await.unwrap().unwrap().access_key_id);
    }

    assert_eq!(exchange.calls(), 1);
    assert!(keys.iter().all(|k| k == &keys[0]));
}

// ── Retry policy ──

#[tokio::test]
async fn transient_failure_is_retried() {
    let exchange = Arc::new(FakeExchange::default());
    exchange.fail_next(FerryError::TransientUnavailable("throttled".into()));
    exchange.fail_next(FerryError::TransientUnavailable("throttled".into()));
    let broker = broker(exchange.clone());

    let creds = broker.acquire(&scope()).await.unwrap();

    assert_eq!(exchange.calls(), 3);
    assert_eq!(creds.access_key_id, "AKIA0003");
}

#[tokio::test]
async fn transient_failure_surfaces_after_max_attempts() {
    let exchange = Arc::new(FakeExchange::default());
    for _ in 0..3 {
        exchange.fail_next(FerryError::TransientUnavailable("down".into()));
    }
    let broker = broker(exchange.clone());

    let err = broker.acquire(&scope()).await.unwrap_err();

    assert!(matches!(err, FerryError::TransientUnavailable(_)));
    assert_eq!(exchange.calls(), 3);
    assert!(!broker.has_valid(&scope()).await);
}

#[tokio::test]
async fn auth_denied_is_never_retried() {
    let exchange = Arc::new(FakeExchange::default());
    exchange.fail_next(FerryError::AuthDenied("role trust policy".into()));
    let broker = broker(exchange.clone());

    let err = broker.acquire(&scope()).await.unwrap_err();

    assert!(matches!(err, FerryError::AuthDenied(_)));
    assert_eq!(exchange.calls(), 1);
}

#[tokio::test]
async fn failure_does_not_poison_cache() {
    let exchange = Arc::new(FakeExchange::default());
    exchange.fail_next(FerryError::AuthDenied("denied".into()));
    let broker = broker(exchange.clone());

    assert!(broker.acquire(&scope()).await.is_err());
    assert!(broker.acquire(&scope()).await.is_ok());
    assert_eq!(exchange.calls(), 2);
}
