//! Target store: durable S3 destination, written with temporary credentials.
//!
//! Uploads are atomic from a reader's point of view. Bodies that fit in one
//! part go up as a single `PutObject`; larger bodies use a multipart upload
//! that only becomes visible on `CompleteMultipartUpload` and is aborted if
//! the stream fails or the upload future is dropped (timeout, cancellation).
//! An abort spawned from a drop is best effort, so the target bucket should
//! still carry a lifecycle rule that expires incomplete multipart uploads.

use crate::error::{FerryError, FerryResult};
use crate::staging::ObjectStream;
use crate::types::{ContentEncoding, CrossCloudCredential, PutOptions, TargetObjectMeta};
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Default multipart part size. S3 requires at least 5 MiB for every part but
/// the last.
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// S3 error codes that need an operator, not a retry.
const FATAL_S3_CODES: &[&str] = &[
    "AccessDenied",
    "AllAccessDisabled",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "NoSuchBucket",
];

/// Operations the pipeline needs from the target store.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Returns object metadata, or `None` if nothing is stored at `key`.
    async fn head(
        &self,
        creds: &CrossCloudCredential,
        key: &str,
    ) -> FerryResult<Option<TargetObjectMeta>>;

    /// Streams `body` to `key`, replacing any existing object. Returns the
    /// number of bytes stored. Nothing is visible at `key` unless this succeeds.
    async fn put_stream(
        &self,
        creds: &CrossCloudCredential,
        key: &str,
        options: &PutOptions,
        body: ObjectStream,
    ) -> FerryResult<u64>;
}

/// S3 target store.
pub struct S3TargetStore {
    bucket: String,
    region: String,
    endpoint_override: Option<String>,
    part_size: usize,
}

impl S3TargetStore {
    pub fn new(bucket: String, region: String, endpoint_override: Option<String>) -> Self {
        Self {
            bucket,
            region,
            endpoint_override,
            part_size: PART_SIZE,
        }
    }

    /// Overrides the size at which uploads switch to multipart, and the size
    /// of each part.
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    /// Builds an S3 client from temporary credentials.
    fn build_client(&self, creds: &CrossCloudCredential) -> FerryResult<S3Client> {
        if creds.is_expired() {
            return Err(FerryError::TransientUnavailable(
                "target credentials expired before use".into(),
            ));
        }

        let credentials = aws_credential_types::Credentials::new(
            &creds.access_key_id,
            &creds.secret_access_key,
            Some(creds.session_token.clone()),
            Some(creds.expires_at.into()),
            "logferry-sts",
        );

        let mut config_builder = aws_sdk_s3::Config::builder()
            .region(aws_types::region::Region::new(self.region.clone()))
            .credentials_provider(credentials)
            .behavior_version_latest();

        if let Some(ref endpoint) = self.endpoint_override {
            config_builder = config_builder
                .endpoint_url(endpoint)
                .force_path_style(true);
        }

        Ok(S3Client::from_conf(config_builder.build()))
    }

    async fn put_single(
        &self,
        client: &S3Client,
        key: &str,
        options: &PutOptions,
        data: Bytes,
    ) -> FerryResult<()> {
        client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .set_content_encoding(options.content_encoding.as_header().map(str::to_string))
            .content_type(&options.content_type)
            .set_metadata(Some(to_hash_map(&options.metadata)))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify_s3_error("put", key, e))?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        client: &S3Client,
        key: &str,
        options: &PutOptions,
        first_part: Bytes,
        rest: ObjectStream,
    ) -> FerryResult<u64> {
        let created = client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_content_encoding(options.content_encoding.as_header().map(str::to_string))
            .content_type(&options.content_type)
            .set_metadata(Some(to_hash_map(&options.metadata)))
            .send()
            .await
            .map_err(|e| classify_s3_error("create multipart upload", key, e))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| {
                FerryError::TransientUnavailable(format!("no upload id returned for {key}"))
            })?
            .to_string();

        let mut guard = AbortOnDrop {
            client: client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            upload_id: upload_id.clone(),
            armed: true,
        };

        let result = self
            .upload_parts(client, key, &upload_id, first_part, rest)
            .await;
        guard.armed = false;

        match result {
            Ok(total) => Ok(total),
            Err(e) => {
                if let Err(abort_err) = client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key,
                        upload_id,
                        "failed to abort multipart upload: {}",
                        DisplayErrorContext(&abort_err)
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        client: &S3Client,
        key: &str,
        upload_id: &str,
        first_part: Bytes,
        mut rest: ObjectStream,
    ) -> FerryResult<u64> {
        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut total = 0u64;
        let mut pending = Some(first_part);

        loop {
            let part = match pending.take() {
                Some(part) => part,
                None => match fill_part(&mut rest, self.part_size).await? {
                    Some(part) => part,
                    None => break,
                },
            };

            total += part.len() as u64;
            let uploaded = client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(|e| classify_s3_error("upload part", key, e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;
        }

        client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify_s3_error("complete multipart upload", key, e))?;

        debug!(key, parts = part_number - 1, "completed multipart upload");
        Ok(total)
    }
}

#[async_trait]
impl TargetStore for S3TargetStore {
    async fn head(
        &self,
        creds: &CrossCloudCredential,
        key: &str,
    ) -> FerryResult<Option<TargetObjectMeta>> {
        let client = self.build_client(creds)?;

        match client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => Ok(Some(TargetObjectMeta {
                key: key.to_string(),
                size_bytes: resp.content_length().unwrap_or(0).max(0) as u64,
                content_encoding: ContentEncoding::from_header(resp.content_encoding()),
                metadata: resp
                    .metadata()
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default(),
            })),
            Err(err) => {
                if let SdkError::ServiceError(ref ctx) = err {
                    if ctx.err().is_not_found() {
                        return Ok(None);
                    }
                }
                Err(classify_s3_error("head", key, err))
            }
        }
    }

    async fn put_stream(
        &self,
        creds: &CrossCloudCredential,
        key: &str,
        options: &PutOptions,
        mut body: ObjectStream,
    ) -> FerryResult<u64> {
        let client = self.build_client(creds)?;

        // Buffer up to one part before deciding between a single PUT and a
        // multipart upload.
        let first = fill_part(&mut body, self.part_size)
            .await?
            .unwrap_or_default();
        if first.len() < self.part_size {
            let size = first.len() as u64;
            self.put_single(&client, key, options, first).await?;
            debug!(key, size, "uploaded to s3://{}/{key}", self.bucket);
            return Ok(size);
        }

        let size = self
            .put_multipart(&client, key, options, first, body)
            .await?;
        debug!(key, size, "uploaded to s3://{}/{key}", self.bucket);
        Ok(size)
    }
}

/// Aborts a multipart upload whose future was dropped before it finished.
struct AbortOnDrop {
    client: S3Client,
    bucket: String,
    key: String,
    upload_id: String,
    armed: bool,
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, upload_id = %self.upload_id, "no runtime to abort multipart upload");
            return;
        };

        let client = self.client.clone();
        let bucket = std::mem::take(&mut self.bucket);
        let key = std::mem::take(&mut self.key);
        let upload_id = std::mem::take(&mut self.upload_id);
        runtime.spawn(async move {
            match client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                Ok(_) => debug!(key, upload_id, "aborted interrupted multipart upload"),
                Err(e) => warn!(
                    key,
                    upload_id,
                    "failed to abort interrupted multipart upload: {}",
                    DisplayErrorContext(&e)
                ),
            }
        });
    }
}

/// Reads from `stream` until one part is full or the stream ends.
/// Returns `None` once the stream is exhausted and nothing was read.
async fn fill_part(stream: &mut ObjectStream, part_size: usize) -> FerryResult<Option<Bytes>> {
    let mut buf = BytesMut::with_capacity(part_size);
    while buf.len() < part_size {
        match stream.next().await {
            Some(chunk) => buf.extend_from_slice(&chunk?),
            None if buf.is_empty() => return Ok(None),
            None => break,
        }
    }
    Ok(Some(buf.freeze()))
}

fn to_hash_map(metadata: &BTreeMap<String, String>) -> HashMap<String, String> {
    metadata
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Permission and addressing problems are fatal; everything else is retried
/// by the sweeper.
fn classify_s3_error<E, R>(op: &str, key: &str, err: SdkError<E, R>) -> FerryError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    if let SdkError::ServiceError(ref ctx) = err {
        let code = ctx.err().code().unwrap_or("Unknown");
        if FATAL_S3_CODES.contains(&code) {
            return FerryError::AuthDenied(format!("S3 {op} {key}: {code}"));
        }
    }
    FerryError::TransientUnavailable(format!("S3 {op} {key}: {}", DisplayErrorContext(&err)))
}
