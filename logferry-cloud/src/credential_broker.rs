//! Cross-cloud credential lifecycle with per-scope caching.
//!
//! Credentials are cached per scope until `expiry - refresh_margin`. Each
//! scope has its own async mutex held across the exchange, so concurrent
//! callers in one process share a single in-flight acquisition.

use crate::config::FerryConfig;
use crate::error::{FerryError, FerryResult};
use crate::trust::{IdentityProvider, TrustExchange};
use crate::types::{CredentialScope, CrossCloudCredential};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

type Slot = Arc<Mutex<Option<CrossCloudCredential>>>;

/// Acquires and caches target-store credentials.
pub struct CredentialBroker {
    identity: Arc<dyn IdentityProvider>,
    exchange: Arc<dyn TrustExchange>,
    slots: RwLock<HashMap<CredentialScope, Slot>>,
    refresh_margin: Duration,
    max_attempts: u32,
    retry_base_delay: Duration,
}

impl CredentialBroker {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        exchange: Arc<dyn TrustExchange>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            identity,
            exchange,
            slots: RwLock::new(HashMap::new()),
            refresh_margin,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }

    pub fn from_config(
        identity: Arc<dyn IdentityProvider>,
        exchange: Arc<dyn TrustExchange>,
        config: &FerryConfig,
    ) -> Self {
        Self::new(identity, exchange, config.credential_refresh_margin)
            .with_retry(config.broker_max_attempts, config.broker_retry_base_delay)
    }

    /// Overrides the transient-failure retry policy.
    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_base_delay = base_delay;
        self
    }

    /// Gets a valid credential for `scope`, exchanging a new one if needed.
    pub async fn acquire(&self, scope: &CredentialScope) -> FerryResult<CrossCloudCredential> {
        let slot = self.slot(scope).await;
        let mut cached = slot.lock().await;

        if let Some(ref c) = *cached {
            if !c.expires_within(self.refresh_margin) {
                return Ok(c.clone());
            }
            debug!(
                role_arn = %scope.role_arn,
                "credentials expiring within {:?}, refreshing", self.refresh_margin
            );
        }

        let fresh = self.exchange_with_retry(scope).await?;
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drops the cached credential for one scope.
    pub async fn invalidate(&self, scope: &CredentialScope) {
        let slot = self.slots.read().await.get(scope).cloned();
        if let Some(slot) = slot {
            *slot.lock().await = None;
        }
    }

    /// Drops every cached credential.
    pub async fn clear(&self) {
        self.slots.write().await.clear();
    }

    /// Returns true if a credential for `scope` is cached and not about to expire.
    pub async fn has_valid(&self, scope: &CredentialScope) -> bool {
        let slot = self.slots.read().await.get(scope).cloned();
        match slot {
            Some(slot) => slot
                .lock()
                .await
                .as_ref()
                .is_some_and(|c| !c.expires_within(self.refresh_margin)),
            None => false,
        }
    }

    async fn slot(&self, scope: &CredentialScope) -> Slot {
        if let Some(slot) = self.slots.read().await.get(scope) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(scope.clone())
            .or_default()
            .clone()
    }

    async fn exchange_with_retry(&self, scope: &CredentialScope) -> FerryResult<CrossCloudCredential> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.exchange_once(scope).await {
                Ok(creds) => {
                    debug!(
                        role_arn = %scope.role_arn,
                        attempt,
                        "acquired credentials, expires at {}", creds.expires_at
                    );
                    return Ok(creds);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let backoff = self.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        role_arn = %scope.role_arn,
                        attempt,
                        "credential exchange unavailable, retrying in {backoff:?}: {e}"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    if let FerryError::AuthDenied(_) = e {
                        error!(role_arn = %scope.role_arn, "credential exchange denied: {e}");
                    } else {
                        warn!(
                            role_arn = %scope.role_arn,
                            attempt,
                            "credential exchange failed: {e}"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn exchange_once(&self, scope: &CredentialScope) -> FerryResult<CrossCloudCredential> {
        let assertion = self.identity.identity_token(&scope.role_arn).await?;
        self.exchange.exchange(&assertion, scope).await
    }
}
