//! Staged-key to target-key mapping.
//!
//! The mapping is a plain prefix concatenation, so it is injective: two
//! distinct staged keys can never land on the same target key, and the same
//! staged key always lands on the same one.

use crate::error::{FerryError, FerryResult};
use crate::types::{ContentEncoding, StagedObject, TargetPlacement};

/// S3 rejects keys longer than this many UTF-8 bytes.
pub const MAX_TARGET_KEY_BYTES: usize = 1024;

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Deterministic naming for target objects.
#[derive(Clone, Debug, Default)]
pub struct ObjectNamingScheme {
    prefix: String,
}

impl ObjectNamingScheme {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Maps `(bucket, key)` to the target key.
    pub fn target_key(&self, bucket: &str, key: &str) -> FerryResult<String> {
        if bucket.is_empty() {
            return Err(FerryError::InvalidArgument("empty source bucket".into()));
        }
        if key.is_empty() {
            return Err(FerryError::InvalidArgument(format!(
                "empty object key in bucket {bucket}"
            )));
        }

        let target = format!("{}{key}", self.prefix);
        if target.len() > MAX_TARGET_KEY_BYTES {
            return Err(FerryError::InvalidArgument(format!(
                "target key for {key} is {} bytes, limit is {MAX_TARGET_KEY_BYTES}",
                target.len()
            )));
        }
        Ok(target)
    }

    /// Full placement for a staged object: key, encoding tag and content type.
    ///
    /// Uncompressed sources are tagged `gzip` because the worker compresses
    /// them; compressed sources keep their own encoding.
    pub fn placement(&self, object: &StagedObject) -> FerryResult<TargetPlacement> {
        let key = self.target_key(&object.bucket, &object.key)?;
        let content_encoding = match &object.content_encoding {
            ContentEncoding::Identity => ContentEncoding::Gzip,
            other => other.clone(),
        };
        Ok(TargetPlacement {
            key,
            content_encoding,
            content_type: content_type_for(&object.key, object.content_type.as_deref()),
        })
    }
}

/// Newline-delimited JSON by extension, else the staged type, else octet-stream.
pub fn content_type_for(key: &str, staged: Option<&str>) -> String {
    if key.ends_with(".jsonl") || key.ends_with(".ndjson") {
        return NDJSON_CONTENT_TYPE.to_string();
    }
    match staged {
        Some(ct) if !ct.trim().is_empty() => ct.to_string(),
        _ => DEFAULT_CONTENT_TYPE.to_string(),
    }
}
