//! GCE metadata server client.
//!
//! Mints identity tokens (signed JWTs with a caller-chosen audience) for web
//! identity federation, and OAuth access tokens for the staging store API.

use crate::error::{FerryError, FerryResult};
use crate::trust::IdentityProvider;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, error};

const SERVICE_ACCOUNT_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default";

/// Access tokens are refreshed this long before the server says they expire.
const ACCESS_TOKEN_MARGIN_SECS: i64 = 60;

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Client for the metadata server of the running instance.
pub struct MetadataServer {
    client: Client,
    base_url: String,
    access_token: RwLock<Option<CachedToken>>,
}

impl MetadataServer {
    pub fn new(base_url: impl Into<String>) -> FerryResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: RwLock::new(None),
        })
    }

    /// Fetches an identity token for `audience`.
    pub async fn identity_token(&self, audience: &str) -> FerryResult<String> {
        let url = format!("{}{SERVICE_ACCOUNT_PATH}/identity", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .query(&[("audience", audience), ("format", "full")])
            .send()
            .await
            .map_err(|e| {
                error!(audience, "failed to reach metadata server: {e}");
                FerryError::TransientUnavailable(format!("metadata server unreachable: {e}"))
            })?;

        let resp = check_status(resp, "identity token")?;
        let token = resp.text().await?;
        if token.trim().is_empty() {
            return Err(FerryError::TransientUnavailable(
                "metadata server returned an empty identity token".into(),
            ));
        }
        Ok(token.trim().to_string())
    }

    /// Returns an OAuth access token for the default service account, cached
    /// until shortly before it expires.
    pub async fn access_token(&self) -> FerryResult<String> {
        {
            let cached = self.access_token.read().await;
            if let Some(ref t) = *cached {
                if Utc::now() + Duration::seconds(ACCESS_TOKEN_MARGIN_SECS) < t.expires_at {
                    return Ok(t.token.clone());
                }
            }
        }

        let url = format!("{}{SERVICE_ACCOUNT_PATH}/token", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| FerryError::TransientUnavailable(format!("metadata server unreachable: {e}")))?;

        let body: AccessTokenResponse = check_status(resp, "access token")?.json().await?;
        debug!("refreshed staging access token, expires in {}s", body.expires_in);

        let mut cached = self.access_token.write().await;
        *cached = Some(CachedToken {
            token: body.access_token.clone(),
            expires_at: Utc::now() + Duration::seconds(body.expires_in),
        });
        Ok(body.access_token)
    }
}

#[async_trait]
impl IdentityProvider for MetadataServer {
    async fn identity_token(&self, audience: &str) -> FerryResult<String> {
        MetadataServer::identity_token(self, audience).await
    }
}

/// A missing service account or a refused audience is a deployment problem;
/// anything else from the metadata server is worth retrying.
fn check_status(resp: reqwest::Response, what: &str) -> FerryResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Err(
            FerryError::AuthDenied(format!("metadata server refused {what}: {status}")),
        ),
        _ => Err(FerryError::TransientUnavailable(format!(
            "metadata server failed {what}: {status}"
        ))),
    }
}
