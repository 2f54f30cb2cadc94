//! Shared fakes for integration tests that run against the in-memory stores.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use logferry_cloud::memory::{MemoryStagingStore, MemoryTargetStore};
use logferry_cloud::trust::{IdentityProvider, TrustExchange};
use logferry_cloud::{
    ContentEncoding, CredentialBroker, CredentialScope, CrossCloudCredential, FerryError,
    FerryResult, ObjectNamingScheme, StagedObject, TransferWorker,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const STAGING_BUCKET: &str = "log-staging";
pub const TARGET_PREFIX: &str = "logs/";
pub const ROLE_ARN: &str = "arn:aws:iam::123456789012:role/log-writer";

pub fn scope() -> CredentialScope {
    CredentialScope::new(ROLE_ARN, "logferry-test", Duration::from_secs(3600))
}

pub fn creds_expiring_in(secs: i64) -> CrossCloudCredential {
    CrossCloudCredential {
        access_key_id: "AKIATEST".into(),
        secret_access_key: "secret".into(),
        session_token: "token".into(),
        expires_at: Utc::now() + chrono::Duration::seconds(secs),
    }
}

/// Identity provider that records the audiences it was asked for.
#[derive(Default)]
pub struct FakeIdentity {
    audiences: Mutex<Vec<String>>,
}

impl FakeIdentity {
    pub fn audiences(&self) -> Vec<String> {
        self.audiences.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn identity_token(&self, audience: &str) -> FerryResult<String> {
        self.audiences.lock().unwrap().push(audience.to_string());
        Ok(format!("jwt-for-{audience}"))
    }
}

/// Trust exchange that counts calls and can be scripted to fail.
pub struct FakeExchange {
    calls: AtomicUsize,
    lifetime: chrono::Duration,
    delay: Option<Duration>,
    failures: Mutex<VecDeque<FerryError>>,
}

impl Default for FakeExchange {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            lifetime: chrono::Duration::hours(1),
            delay: None,
            failures: Mutex::new(VecDeque::new()),
        }
    }
}

impl FakeExchange {
    pub fn with_lifetime(mut self, lifetime: chrono::Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues an error returned by the next exchange instead of credentials.
    pub fn fail_next(&self, err: FerryError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrustExchange for FakeExchange {
    async fn exchange(
        &self,
        assertion: &str,
        scope: &CredentialScope,
    ) -> FerryResult<CrossCloudCredential> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(assertion, format!("jwt-for-{}", scope.role_arn));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(CrossCloudCredential {
            access_key_id: format!("AKIA{n:04}"),
            secret_access_key: format!("secret-{n}"),
            session_token: format!("session-{n}"),
            expires_at: Utc::now() + self.lifetime,
        })
    }
}

/// In-memory pipeline: both stores, a broker over the fakes and a worker.
pub struct Harness {
    pub staging: Arc<MemoryStagingStore>,
    pub target: Arc<MemoryTargetStore>,
    pub exchange: Arc<FakeExchange>,
    pub broker: Arc<CredentialBroker>,
    pub worker: Arc<TransferWorker>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(540))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let staging = Arc::new(MemoryStagingStore::new());
        let target = Arc::new(MemoryTargetStore::new());
        let exchange = Arc::new(FakeExchange::default());
        let broker = Arc::new(
            CredentialBroker::new(
                Arc::new(FakeIdentity::default()),
                exchange.clone(),
                Duration::from_secs(300),
            )
            .with_retry(3, Duration::from_millis(1)),
        );
        let worker = Arc::new(
            TransferWorker::new(
                staging.clone(),
                target.clone(),
                ObjectNamingScheme::new(TARGET_PREFIX),
                broker.clone(),
                scope(),
                STAGING_BUCKET,
            )
            .with_timeout(timeout),
        );
        Self {
            staging,
            target,
            exchange,
            broker,
            worker,
        }
    }

    /// Stages an uncompressed object created `age` ago.
    pub fn stage(&self, key: &str, data: &[u8], age: chrono::Duration) -> StagedObject {
        self.staging.insert(
            STAGING_BUCKET,
            key,
            data.to_vec(),
            Utc::now() - age,
            ContentEncoding::Identity,
        )
    }

    pub fn stage_encoded(&self, key: &str, data: &[u8], encoding: ContentEncoding) -> StagedObject {
        self.staging
            .insert(STAGING_BUCKET, key, data.to_vec(), Utc::now(), encoding)
    }

    pub fn target_key(key: &str) -> String {
        format!("{TARGET_PREFIX}{key}")
    }
}

/// Newline-delimited JSON log lines, `lines` of them.
pub fn log_lines(lines: usize) -> Vec<u8> {
    (0..lines)
        .map(|i| format!("{{\"severity\":\"INFO\",\"seq\":{i},\"message\":\"request served\"}}\n"))
        .collect::<String>()
        .into_bytes()
}

/// Decompresses a gzip body.
pub fn gunzip(data: &[u8]) -> Vec<u8> {
    use std::io::Read;
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .unwrap();
    out
}

/// Compresses `data` with gzip.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}
