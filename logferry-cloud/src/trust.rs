//! Cross-cloud trust exchange.
//!
//! A locally minted identity assertion is presented to AWS STS
//! (`AssumeRoleWithWebIdentity`), which returns temporary credentials for
//! the target role.

use crate::error::{FerryError, FerryResult};
use crate::types::{CredentialScope, CrossCloudCredential};
use async_trait::async_trait;
use aws_sdk_sts::Client as StsClient;
use aws_sdk_sts::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_sts::operation::assume_role_with_web_identity::AssumeRoleWithWebIdentityError;
use chrono::DateTime;
use tracing::debug;

/// STS error codes that are worth retrying.
const RETRYABLE_STS_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "InternalFailure",
    "ExpiredTokenException",
];

/// Mints identity assertions for a given audience.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn identity_token(&self, audience: &str) -> FerryResult<String>;
}

/// Trades an identity assertion for target-store credentials.
#[async_trait]
pub trait TrustExchange: Send + Sync {
    async fn exchange(
        &self,
        assertion: &str,
        scope: &CredentialScope,
    ) -> FerryResult<CrossCloudCredential>;
}

/// `AssumeRoleWithWebIdentity` against AWS STS.
pub struct StsTrustExchange {
    client: StsClient,
}

impl StsTrustExchange {
    pub fn new(region: String, endpoint_override: Option<String>) -> Self {
        let mut config_builder = aws_sdk_sts::Config::builder()
            .region(aws_types::region::Region::new(region))
            .behavior_version_latest();

        if let Some(endpoint) = endpoint_override {
            config_builder = config_builder.endpoint_url(endpoint);
        }

        Self {
            client: StsClient::from_conf(config_builder.build()),
        }
    }
}

#[async_trait]
impl TrustExchange for StsTrustExchange {
    async fn exchange(
        &self,
        assertion: &str,
        scope: &CredentialScope,
    ) -> FerryResult<CrossCloudCredential> {
        let duration_secs = i32::try_from(scope.duration.as_secs()).unwrap_or(i32::MAX);

        let resp = self
            .client
            .assume_role_with_web_identity()
            .role_arn(&scope.role_arn)
            .role_session_name(&scope.session_name)
            .web_identity_token(assertion)
            .duration_seconds(duration_secs)
            .send()
            .await
            .map_err(classify_sts_error)?;

        let creds = resp.credentials().ok_or_else(|| {
            FerryError::TransientUnavailable("STS response carried no credentials".into())
        })?;

        let expiration = creds.expiration();
        let expires_at = DateTime::from_timestamp(expiration.secs(), expiration.subsec_nanos())
            .ok_or_else(|| {
                FerryError::TransientUnavailable(format!(
                    "STS returned an unrepresentable expiry: {expiration:?}"
                ))
            })?;

        debug!(
            role_arn = %scope.role_arn,
            "assumed role via web identity, expires at {expires_at}"
        );

        Ok(CrossCloudCredential {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: creds.session_token().to_string(),
            expires_at,
        })
    }
}

/// Service errors are policy decisions unless STS says it is overloaded;
/// anything that never got a response is a transport problem.
fn classify_sts_error<R: std::fmt::Debug>(
    err: SdkError<AssumeRoleWithWebIdentityError, R>,
) -> FerryError {
    match err {
        SdkError::ServiceError(ctx) => {
            let service_err = ctx.into_err();
            let code = service_err.code().unwrap_or("Unknown").to_string();
            if service_err.is_idp_communication_error_exception()
                || RETRYABLE_STS_CODES.contains(&code.as_str())
            {
                FerryError::TransientUnavailable(format!("STS {code}: {service_err}"))
            } else {
                FerryError::AuthDenied(format!("STS {code}: {service_err}"))
            }
        }
        other => FerryError::TransientUnavailable(format!("STS unreachable: {other}")),
    }
}
