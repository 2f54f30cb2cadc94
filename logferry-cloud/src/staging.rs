//! Staging store: where the batching sink drops log files.
//!
//! The production backend talks to the GCS JSON API. Media downloads send
//! `Accept-Encoding: gzip` so objects stored with `Content-Encoding: gzip`
//! arrive as their stored bytes instead of being transcoded on the way out.

use crate::error::{FerryError, FerryResult};
use crate::metadata::MetadataServer;
use crate::types::{ContentEncoding, ObjectPage, StagedObject};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Limit for metadata, list and delete requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest gap between two body chunks before a media read is abandoned.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// A streamed object body.
pub type ObjectStream = BoxStream<'static, FerryResult<Bytes>>;

/// Operations the pipeline needs from the staging store.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Fetches current metadata for one object. `NotFound` if it is gone.
    async fn head(&self, bucket: &str, key: &str) -> FerryResult<StagedObject>;

    /// Lists one page of objects. `page_token` is `None` for the first page.
    async fn list_page(
        &self,
        bucket: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> FerryResult<ObjectPage>;

    /// Opens a streaming read of the stored bytes (no decompression).
    async fn open_read(&self, object: &StagedObject) -> FerryResult<ObjectStream>;

    /// Deletes the object. Deleting something already gone succeeds.
    async fn delete(&self, object: &StagedObject) -> FerryResult<()>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsObject {
    bucket: String,
    name: String,
    size: String,
    time_created: DateTime<Utc>,
    #[serde(default)]
    content_encoding: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    generation: Option<String>,
}

impl GcsObject {
    fn from_listing(item: serde_json::Value) -> FerryResult<StagedObject> {
        serde_json::from_value::<GcsObject>(item)?.into_staged()
    }

    fn into_staged(self) -> FerryResult<StagedObject> {
        let size_bytes = self.size.parse().map_err(|_| {
            FerryError::InvalidArgument(format!(
                "object {} reports non-numeric size {:?}",
                self.name, self.size
            ))
        })?;
        Ok(StagedObject {
            bucket: self.bucket,
            key: self.name,
            size_bytes,
            created_at: self.time_created,
            content_encoding: ContentEncoding::from_header(self.content_encoding.as_deref()),
            content_type: self.content_type,
            generation: self.generation,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsListResponse {
    // Decoded one by one so a single malformed entry only loses itself.
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// GCS-backed staging store using the JSON API.
pub struct GcsStagingStore {
    client: Client,
    base_url: String,
    metadata: Arc<MetadataServer>,
    request_timeout: Duration,
}

impl GcsStagingStore {
    pub fn new(base_url: impl Into<String>, metadata: Arc<MetadataServer>) -> FerryResult<Self> {
        // Media reads get an idle timeout only; their total length is bounded
        // by the per-invocation deadline.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(READ_IDLE_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            metadata,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Overrides the limit for metadata, list and delete requests.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.base_url,
            urlencoding::encode(bucket),
            urlencoding::encode(key)
        )
    }

    fn send_error(what: &str, e: reqwest::Error) -> FerryError {
        FerryError::TransientUnavailable(format!("staging store {what} failed: {e}"))
    }
}

#[async_trait]
impl StagingStore for GcsStagingStore {
    async fn head(&self, bucket: &str, key: &str) -> FerryResult<StagedObject> {
        let token = self.metadata.access_token().await?;
        let resp = self
            .client
            .get(self.object_url(bucket, key))
            .bearer_auth(&token)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Self::send_error("metadata read", e))?;

        if !resp.status().is_success() {
            return Err(FerryError::from_status(resp.status(), format!("gs://{bucket}/{key}")));
        }
        resp.json::<GcsObject>().await?.into_staged()
    }

    async fn list_page(
        &self,
        bucket: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> FerryResult<ObjectPage> {
        let token = self.metadata.access_token().await?;
        let url = format!("{}/storage/v1/b/{}/o", self.base_url, urlencoding::encode(bucket));

        let mut req = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .timeout(self.request_timeout)
            .query(&[("maxResults", page_size.to_string())]);
        if let Some(page_token) = page_token {
            req = req.query(&[("pageToken", page_token)]);
        }

        let resp = req.send().await.map_err(|e| Self::send_error("list", e))?;
        if !resp.status().is_success() {
            return Err(FerryError::from_status(resp.status(), format!("list gs://{bucket}")));
        }

        let body: GcsListResponse = resp.json().await?;
        let objects: Vec<StagedObject> = body
            .items
            .into_iter()
            .filter_map(|item| match GcsObject::from_listing(item) {
                Ok(object) => Some(object),
                Err(e) => {
                    warn!(bucket, "skipping unreadable listing entry: {e}");
                    None
                }
            })
            .collect();

        debug!(
            bucket,
            count = objects.len(),
            has_more = body.next_page_token.is_some(),
            "listed staging page"
        );
        Ok(ObjectPage {
            objects,
            next_page_token: body.next_page_token,
        })
    }

    async fn open_read(&self, object: &StagedObject) -> FerryResult<ObjectStream> {
        let token = self.metadata.access_token().await?;
        let mut req = self
            .client
            .get(self.object_url(&object.bucket, &object.key))
            .bearer_auth(&token)
            .header(reqwest::header::ACCEPT_ENCODING, "gzip")
            .query(&[("alt", "media")]);
        if let Some(ref generation) = object.generation {
            req = req.query(&[("generation", generation.as_str())]);
        }

        let resp = req.send().await.map_err(|e| Self::send_error("read", e))?;
        if !resp.status().is_success() {
            return Err(FerryError::from_status(resp.status(), object.uri()));
        }

        let uri = object.uri();
        Ok(resp
            .bytes_stream()
            .map_err(move |e| {
                FerryError::TransientUnavailable(format!("read of {uri} interrupted: {e}"))
            })
            .boxed())
    }

    async fn delete(&self, object: &StagedObject) -> FerryResult<()> {
        let token = self.metadata.access_token().await?;
        let mut req = self
            .client
            .delete(self.object_url(&object.bucket, &object.key))
            .bearer_auth(&token)
            .timeout(self.request_timeout);
        // Only delete the generation that was transferred; a newer upload under
        // the same name stays for its own transfer.
        if let Some(ref generation) = object.generation {
            req = req.query(&[("ifGenerationMatch", generation.as_str())]);
        }

        let resp = req.send().await.map_err(|e| Self::send_error("delete", e))?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(object = %object.uri(), "already deleted");
                Ok(())
            }
            StatusCode::PRECONDITION_FAILED => {
                info!(object = %object.uri(), "superseded by a newer generation, left in place");
                Ok(())
            }
            s => Err(FerryError::from_status(s, format!("delete {}", object.uri()))),
        }
    }
}
