//! Pipeline configuration.
//!
//! Loaded from `LOGFERRY_`-prefixed environment variables on top of the
//! defaults below. Durations use humantime syntax (`30m`, `1h`, `540s`).

use crate::error::{FerryError, FerryResult};
use crate::types::CredentialScope;
use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable prefix for every option.
pub const ENV_PREFIX: &str = "LOGFERRY_";

/// Configuration for both entry points.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FerryConfig {
    /// Staging bucket the batching sink writes into.
    pub staging_bucket: String,

    /// Target S3 bucket.
    pub target_bucket: String,

    /// AWS region of the target bucket.
    pub target_region: String,

    /// Prefix prepended to every target key.
    pub target_prefix: String,

    /// Optional S3 endpoint override (for MinIO in testing).
    pub target_endpoint_override: Option<String>,

    /// IAM role assumed through web identity federation.
    pub role_arn: String,

    /// STS role session name recorded in the target account's audit trail.
    pub session_name: String,

    /// Requested credential lifetime.
    #[serde(with = "humantime_serde")]
    pub credential_duration: Duration,

    /// Refresh credentials this long before they expire.
    #[serde(with = "humantime_serde")]
    pub credential_refresh_margin: Duration,

    /// Attempts for a transient credential exchange failure, first try included.
    pub broker_max_attempts: u32,

    /// First backoff delay between exchange attempts; doubles each retry.
    #[serde(with = "humantime_serde")]
    pub broker_retry_base_delay: Duration,

    /// Minimum age before the sweeper retries a staged object.
    #[serde(with = "humantime_serde")]
    pub staleness_threshold: Duration,

    /// Hard wall-clock limit for one transfer.
    #[serde(with = "humantime_serde")]
    pub invocation_timeout: Duration,

    /// Total time budget for one sweep.
    #[serde(with = "humantime_serde")]
    pub sweep_budget: Duration,

    /// Objects transferred in parallel within one sweep.
    pub sweep_concurrency: usize,

    /// Objects requested per staging listing page.
    pub list_page_size: u32,

    /// Event-triggered transfers allowed to run at once in this process.
    pub max_concurrent_transfers: usize,

    /// Address the HTTP entry points listen on.
    pub listen_addr: String,

    /// Base URL of the GCS JSON API.
    pub gcs_base_url: String,

    /// Base URL of the GCE metadata server.
    pub metadata_base_url: String,

    /// `json` for Cloud Logging, anything else for human-readable output.
    pub log_format: String,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            staging_bucket: String::new(),
            target_bucket: String::new(),
            target_region: "us-east-1".to_string(),
            target_prefix: String::new(),
            target_endpoint_override: None,
            role_arn: String::new(),
            session_name: "logferry-transfer".to_string(),
            credential_duration: Duration::from_secs(3600),
            credential_refresh_margin: Duration::from_secs(300), // 5 minutes before expiry
            broker_max_attempts: 3,
            broker_retry_base_delay: Duration::from_millis(500),
            staleness_threshold: Duration::from_secs(60 * 60),
            invocation_timeout: Duration::from_secs(540),
            sweep_budget: Duration::from_secs(25 * 60),
            sweep_concurrency: 4,
            list_page_size: 1000,
            max_concurrent_transfers: 16,
            listen_addr: "0.0.0.0:8080".to_string(),
            gcs_base_url: "https://storage.googleapis.com".to_string(),
            metadata_base_url: "http://metadata.google.internal".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl FerryConfig {
    /// Loads defaults overlaid with `LOGFERRY_*` environment variables and validates.
    pub fn load() -> FerryResult<Self> {
        let config: FerryConfig = Figment::from(Serialized::defaults(FerryConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the pipeline cannot run with.
    pub fn validate(&self) -> FerryResult<()> {
        let required = [
            ("staging_bucket", &self.staging_bucket),
            ("target_bucket", &self.target_bucket),
            ("target_region", &self.target_region),
            ("role_arn", &self.role_arn),
            ("session_name", &self.session_name),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(FerryError::Config(format!("missing {name}")));
            }
        }
        if self.sweep_concurrency == 0 {
            return Err(FerryError::Config("sweep_concurrency must be at least 1".into()));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(FerryError::Config(
                "max_concurrent_transfers must be at least 1".into(),
            ));
        }
        if self.broker_max_attempts == 0 {
            return Err(FerryError::Config("broker_max_attempts must be at least 1".into()));
        }
        if self.list_page_size == 0 {
            return Err(FerryError::Config("list_page_size must be at least 1".into()));
        }
        if self.invocation_timeout.is_zero() || self.sweep_budget.is_zero() {
            return Err(FerryError::Config("timeouts must be non-zero".into()));
        }
        if self.credential_refresh_margin >= self.credential_duration {
            return Err(FerryError::Config(
                "credential_refresh_margin must be shorter than credential_duration".into(),
            ));
        }
        Ok(())
    }

    /// Credential scope for the configured role.
    pub fn credential_scope(&self) -> CredentialScope {
        CredentialScope::new(
            self.role_arn.clone(),
            self.session_name.clone(),
            self.credential_duration,
        )
    }
}
