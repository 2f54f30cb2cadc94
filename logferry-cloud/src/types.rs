//! Shared types for the transfer pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// `Content-Encoding` of a stored object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum ContentEncoding {
    #[default]
    Identity,
    Gzip,
    /// Any other non-identity encoding (e.g. `br`). Preserved as-is.
    Other(String),
}

impl ContentEncoding {
    /// Parses a header value. Missing, empty and `identity` all mean identity.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            None => ContentEncoding::Identity,
            Some(v) if v.is_empty() || v == "identity" => ContentEncoding::Identity,
            Some(v) if v == "gzip" || v == "x-gzip" => ContentEncoding::Gzip,
            Some(v) => ContentEncoding::Other(v),
        }
    }

    /// Header value to send, or `None` for identity.
    pub fn as_header(&self) -> Option<&str> {
        match self {
            ContentEncoding::Identity => None,
            ContentEncoding::Gzip => Some("gzip"),
            ContentEncoding::Other(v) => Some(v.as_str()),
        }
    }

    /// Returns true if the payload is already compressed.
    pub fn is_compressed(&self) -> bool {
        !matches!(self, ContentEncoding::Identity)
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_header().unwrap_or("none"))
    }
}

impl From<Option<String>> for ContentEncoding {
    fn from(value: Option<String>) -> Self {
        ContentEncoding::from_header(value.as_deref())
    }
}

impl From<ContentEncoding> for Option<String> {
    fn from(value: ContentEncoding) -> Self {
        value.as_header().map(str::to_string)
    }
}

/// One file in the staging store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedObject {
    pub bucket: String,
    pub key: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub content_encoding: ContentEncoding,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Store-assigned version of the object (GCS generation).
    #[serde(default)]
    pub generation: Option<String>,
}

impl StagedObject {
    /// Returns true if the object was created strictly before `now - threshold`.
    pub fn is_older_than(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(threshold) {
            Ok(threshold) => self.created_at < now - threshold,
            Err(_) => false,
        }
    }

    pub fn uri(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.key)
    }
}

/// "Object created" notification from the staging store.
///
/// Field names follow the storage CloudEvent payload (`bucket`, `name`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    #[serde(rename = "bucket", alias = "sourceBucket")]
    pub source_bucket: String,
    #[serde(rename = "name", alias = "objectKey")]
    pub object_key: String,
}

/// Which entry point started a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferTrigger {
    Event,
    Sweep,
}

impl TransferTrigger {
    /// Value recorded in the `transferred-by` metadata tag.
    pub fn label(&self) -> &'static str {
        match self {
            TransferTrigger::Event => "transfer-worker",
            TransferTrigger::Sweep => "cleanup-sweeper",
        }
    }
}

/// Terminal status of one transfer attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Succeeded,
    FailedTransient,
    FailedPermanent,
}

/// Transfer state machine stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStage {
    Received,
    Fetching,
    DetectingEncoding,
    Uploading,
    Verifying,
    Deleting,
    Done,
    Failed,
}

impl TransferStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStage::Done | TransferStage::Failed)
    }
}

/// Result of one transfer attempt. Emitted for observability, never persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub invocation_id: Uuid,
    pub trigger: TransferTrigger,
    pub staged_object: StagedObject,
    pub target_key: String,
    pub status: TransferStatus,
    /// Bytes written to the target (compressed size when compressing).
    pub bytes_transferred: u64,
    /// Bytes read from the staging store.
    pub bytes_read: u64,
    /// The target already held this exact source object; upload was skipped.
    pub already_present: bool,
    pub source_deleted: bool,
    pub attempted_at: DateTime<Utc>,
    /// Stage in which the attempt failed, if it did.
    pub failed_stage: Option<TransferStage>,
    pub error: Option<String>,
}

impl TransferOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == TransferStatus::Succeeded
    }
}

/// Summary of one sweep run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Objects listed from the staging store.
    pub scanned: u64,
    /// Objects old enough to be retried and actually attempted.
    pub retried: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// False when the sweep budget ran out before the listing was exhausted.
    pub complete: bool,
}

/// Temporary write credentials for the target store.
#[derive(Clone, PartialEq, Eq)]
pub struct CrossCloudCredential {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CrossCloudCredential {
    /// Returns true if the credential expires within `margin` from now.
    pub fn expires_within(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::MAX);
        Utc::now()
            .checked_add_signed(margin)
            .is_none_or(|deadline| deadline >= self.expires_at)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl fmt::Debug for CrossCloudCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossCloudCredential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What a credential is good for: one role assumed under one session name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CredentialScope {
    pub role_arn: String,
    pub session_name: String,
    pub duration: Duration,
}

impl CredentialScope {
    pub fn new(role_arn: impl Into<String>, session_name: impl Into<String>, duration: Duration) -> Self {
        Self {
            role_arn: role_arn.into(),
            session_name: session_name.into(),
            duration,
        }
    }
}

/// Where and how a staged object lands in the target store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetPlacement {
    pub key: String,
    pub content_encoding: ContentEncoding,
    pub content_type: String,
}

/// One page of a staging-store listing.
#[derive(Clone, Debug, Default)]
pub struct ObjectPage {
    pub objects: Vec<StagedObject>,
    pub next_page_token: Option<String>,
}

/// Metadata of an object in the target store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetObjectMeta {
    pub key: String,
    pub size_bytes: u64,
    pub content_encoding: ContentEncoding,
    pub metadata: BTreeMap<String, String>,
}

/// Headers and user metadata for a target-store upload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub content_encoding: ContentEncoding,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
}

/// Idempotency marker stored as target-object metadata.
///
/// Identifies the staged object an upload came from, so a repeated transfer
/// of the same source can be recognized and skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceMarker {
    pub bucket: String,
    pub key: String,
    pub size_bytes: u64,
    pub generation: Option<String>,
}

impl SourceMarker {
    const BUCKET: &'static str = "source-bucket";
    const KEY: &'static str = "source-key";
    const SIZE: &'static str = "source-size";
    const GENERATION: &'static str = "source-generation";

    pub fn for_object(object: &StagedObject) -> Self {
        Self {
            bucket: object.bucket.clone(),
            key: object.key.clone(),
            size_bytes: object.size_bytes,
            generation: object.generation.clone(),
        }
    }

    /// Writes the marker into an upload's metadata map.
    pub fn write_to(&self, metadata: &mut BTreeMap<String, String>) {
        metadata.insert(Self::BUCKET.into(), self.bucket.clone());
        metadata.insert(Self::KEY.into(), self.key.clone());
        metadata.insert(Self::SIZE.into(), self.size_bytes.to_string());
        if let Some(ref generation) = self.generation {
            metadata.insert(Self::GENERATION.into(), generation.clone());
        }
    }

    /// Reads a marker back from target metadata. `None` if any field is missing.
    pub fn read_from(metadata: &BTreeMap<String, String>) -> Option<Self> {
        Some(Self {
            bucket: metadata.get(Self::BUCKET)?.clone(),
            key: metadata.get(Self::KEY)?.clone(),
            size_bytes: metadata.get(Self::SIZE)?.parse().ok()?,
            generation: metadata.get(Self::GENERATION).cloned(),
        })
    }
}
