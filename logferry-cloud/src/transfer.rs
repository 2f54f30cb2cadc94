//! Moves one staged object into the target store.
//!
//! Both entry points run the same operation: the event path through
//! [`TransferWorker::handle_event`], the sweeper through
//! [`TransferWorker::transfer_with_deadline`]. One call handles exactly one
//! object and never retries locally; anything that fails leaves the staged
//! copy in place for the next sweep.
//!
//! ```text
//! Received -> Fetching -> DetectingEncoding -> Uploading -> Verifying -> Deleting -> Done
//!     \__________\______________\_________________\____________\-> Failed
//! ```

use crate::compression::{counted, gzip_stream, sniff_gzip};
use crate::config::FerryConfig;
use crate::credential_broker::CredentialBroker;
use crate::error::{FerryError, FerryResult};
use crate::naming::ObjectNamingScheme;
use crate::staging::{ObjectStream, StagingStore};
use crate::target::TargetStore;
use crate::types::{
    ContentEncoding, CredentialScope, CrossCloudCredential, PutOptions, SourceMarker, StagedObject,
    TargetPlacement, TransferOutcome, TransferStage, TransferStatus, TransferTrigger, TriggerEvent,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default hard limit for one transfer.
pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(540);

const ORIGINAL_ENCODING_TAG: &str = "original-encoding";
const TRANSFERRED_BY_TAG: &str = "transferred-by";

/// Stage and byte counters of one transfer, readable after a timeout drops
/// the pipeline future.
#[derive(Debug)]
struct Progress {
    stage: Mutex<TransferStage>,
    bytes_read: Arc<AtomicU64>,
    bytes_written: AtomicU64,
    already_present: AtomicBool,
}

impl Progress {
    fn new() -> Self {
        Self {
            stage: Mutex::new(TransferStage::Received),
            bytes_read: Arc::new(AtomicU64::new(0)),
            bytes_written: AtomicU64::new(0),
            already_present: AtomicBool::new(false),
        }
    }

    fn enter(&self, stage: TransferStage) {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner) = stage;
    }

    fn stage(&self) -> TransferStage {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

/// Event-triggered transfer of staged objects.
pub struct TransferWorker {
    staging: Arc<dyn StagingStore>,
    target: Arc<dyn TargetStore>,
    naming: ObjectNamingScheme,
    broker: Arc<CredentialBroker>,
    scope: CredentialScope,
    staging_bucket: String,
    timeout: Duration,
}

impl TransferWorker {
    pub fn new(
        staging: Arc<dyn StagingStore>,
        target: Arc<dyn TargetStore>,
        naming: ObjectNamingScheme,
        broker: Arc<CredentialBroker>,
        scope: CredentialScope,
        staging_bucket: impl Into<String>,
    ) -> Self {
        Self {
            staging,
            target,
            naming,
            broker,
            scope,
            staging_bucket: staging_bucket.into(),
            timeout: DEFAULT_INVOCATION_TIMEOUT,
        }
    }

    pub fn from_config(
        staging: Arc<dyn StagingStore>,
        target: Arc<dyn TargetStore>,
        broker: Arc<CredentialBroker>,
        config: &FerryConfig,
    ) -> Self {
        Self::new(
            staging,
            target,
            ObjectNamingScheme::new(config.target_prefix.clone()),
            broker,
            config.credential_scope(),
            config.staging_bucket.clone(),
        )
        .with_timeout(config.invocation_timeout)
    }

    /// Overrides the per-invocation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn staging(&self) -> &Arc<dyn StagingStore> {
        &self.staging
    }

    pub fn staging_bucket(&self) -> &str {
        &self.staging_bucket
    }

    pub fn naming(&self) -> &ObjectNamingScheme {
        &self.naming
    }

    /// Acquires target credentials for this worker's scope.
    ///
    /// The sweeper calls this once up front so a broken trust relationship
    /// surfaces before any listing work.
    pub async fn acquire_credentials(&self) -> FerryResult<CrossCloudCredential> {
        self.broker.acquire(&self.scope).await
    }

    /// Handles one "object created" notification.
    ///
    /// Per-object problems come back as a failed outcome. Only errors that
    /// need an operator (`AuthDenied`, `Config`) are returned as `Err`.
    pub async fn handle_event(&self, event: &TriggerEvent) -> FerryResult<TransferOutcome> {
        let invocation_id = Uuid::now_v7();
        let started = Instant::now();
        let deadline = started + self.timeout;

        if event.source_bucket != self.staging_bucket {
            warn!(
                %invocation_id,
                bucket = %event.source_bucket,
                expected = %self.staging_bucket,
                "event for unexpected bucket, ignoring"
            );
            let err = FerryError::InvalidArgument(format!(
                "event bucket {} is not the staging bucket {}",
                event.source_bucket, self.staging_bucket
            ));
            let outcome = self.rejected(invocation_id, event, TransferStatus::FailedPermanent, &err);
            log_outcome(&outcome);
            return Ok(outcome);
        }

        let head = tokio::time::timeout_at(
            deadline,
            self.staging.head(&event.source_bucket, &event.object_key),
        )
        .await
        .unwrap_or_else(|_| Err(FerryError::Timeout(started.elapsed())));

        let object = match head {
            Ok(object) => object,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                let status = if e.is_transient() {
                    TransferStatus::FailedTransient
                } else {
                    TransferStatus::FailedPermanent
                };
                let outcome = self.rejected(invocation_id, event, status, &e);
                log_outcome(&outcome);
                return Ok(outcome);
            }
        };

        self.run(invocation_id, &object, TransferTrigger::Event, Some(deadline))
            .await
    }

    /// Transfers an already-listed object, bounded by the worker timeout.
    pub async fn transfer(
        &self,
        object: &StagedObject,
        trigger: TransferTrigger,
    ) -> FerryResult<TransferOutcome> {
        self.transfer_with_deadline(object, trigger, None).await
    }

    /// Like [`transfer`](Self::transfer), but also stops at `deadline` if that
    /// comes before the worker timeout.
    pub async fn transfer_with_deadline(
        &self,
        object: &StagedObject,
        trigger: TransferTrigger,
        deadline: Option<Instant>,
    ) -> FerryResult<TransferOutcome> {
        self.run(Uuid::now_v7(), object, trigger, deadline).await
    }

    async fn run(
        &self,
        invocation_id: Uuid,
        object: &StagedObject,
        trigger: TransferTrigger,
        deadline: Option<Instant>,
    ) -> FerryResult<TransferOutcome> {
        let attempted_at = Utc::now();
        let started = Instant::now();
        let progress = Progress::new();

        let mut outcome = TransferOutcome {
            invocation_id,
            trigger,
            staged_object: object.clone(),
            target_key: String::new(),
            status: TransferStatus::FailedPermanent,
            bytes_transferred: 0,
            bytes_read: 0,
            already_present: false,
            source_deleted: false,
            attempted_at,
            failed_stage: None,
            error: None,
        };

        let placement = match self.naming.placement(object) {
            Ok(placement) => placement,
            Err(e) => {
                outcome.failed_stage = Some(TransferStage::Received);
                outcome.error = Some(e.to_string());
                log_outcome(&outcome);
                return Ok(outcome);
            }
        };
        outcome.target_key = placement.key.clone();

        let limit = started + self.timeout;
        let deadline = deadline.map_or(limit, |d| d.min(limit));

        let result = match tokio::time::timeout_at(
            deadline,
            self.move_object(object, &placement, trigger, &progress),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FerryError::Timeout(started.elapsed())),
        };

        outcome.bytes_read = progress.bytes_read();
        outcome.bytes_transferred = progress.bytes_written();
        outcome.already_present = progress.already_present.load(Ordering::Relaxed);

        if let Err(e) = result {
            if matches!(e, FerryError::AuthDenied(_)) {
                self.broker.invalidate(&self.scope).await;
            }
            outcome.status = if e.is_transient() {
                TransferStatus::FailedTransient
            } else {
                TransferStatus::FailedPermanent
            };
            outcome.failed_stage = Some(progress.stage());
            outcome.error = Some(e.to_string());
            log_outcome(&outcome);
            if e.is_fatal() {
                return Err(e);
            }
            return Ok(outcome);
        }

        progress.enter(TransferStage::Deleting);
        let deleted = tokio::time::timeout_at(deadline, self.staging.delete(object))
            .await
            .unwrap_or_else(|_| Err(FerryError::Timeout(started.elapsed())));
        match deleted {
            Ok(()) => outcome.source_deleted = true,
            Err(e) => {
                // The target copy is verified; the sweeper retries the delete
                // through the idempotency marker.
                warn!(
                    %invocation_id,
                    object = %object.uri(),
                    "staging delete failed after verified upload: {e}"
                );
            }
        }

        progress.enter(TransferStage::Done);
        outcome.status = TransferStatus::Succeeded;
        log_outcome(&outcome);
        Ok(outcome)
    }

    /// Credentials through Verifying. Everything here is covered by the timeout.
    async fn move_object(
        &self,
        object: &StagedObject,
        placement: &TargetPlacement,
        trigger: TransferTrigger,
        progress: &Progress,
    ) -> FerryResult<()> {
        let creds = self.broker.acquire(&self.scope).await?;
        let marker = SourceMarker::for_object(object);

        if let Some(existing) = self.target.head(&creds, &placement.key).await? {
            if SourceMarker::read_from(&existing.metadata).as_ref() == Some(&marker) {
                debug!(
                    object = %object.uri(),
                    key = %placement.key,
                    "target already holds this source object, skipping upload"
                );
                progress.already_present.store(true, Ordering::Relaxed);
                progress
                    .bytes_written
                    .store(existing.size_bytes, Ordering::Relaxed);
                return Ok(());
            }
        }

        progress.enter(TransferStage::Fetching);
        let source = self.staging.open_read(object).await?;
        let source = counted(source, progress.bytes_read.clone());

        progress.enter(TransferStage::DetectingEncoding);
        let body = self.prepare_body(object, source).await?;

        progress.enter(TransferStage::Uploading);
        let mut metadata = BTreeMap::new();
        marker.write_to(&mut metadata);
        metadata.insert(
            ORIGINAL_ENCODING_TAG.to_string(),
            object
                .content_encoding
                .as_header()
                .unwrap_or("identity")
                .to_string(),
        );
        metadata.insert(TRANSFERRED_BY_TAG.to_string(), trigger.label().to_string());
        let options = PutOptions {
            content_encoding: placement.content_encoding.clone(),
            content_type: placement.content_type.clone(),
            metadata,
        };
        let written = self
            .target
            .put_stream(&creds, &placement.key, &options, body)
            .await?;
        progress.bytes_written.store(written, Ordering::Relaxed);

        progress.enter(TransferStage::Verifying);
        let read = progress.bytes_read();
        if read != object.size_bytes {
            return Err(FerryError::VerificationMismatch {
                key: object.uri(),
                expected: object.size_bytes,
                actual: read,
            });
        }
        let stored = self
            .target
            .head(&creds, &placement.key)
            .await?
            .ok_or_else(|| FerryError::VerificationMismatch {
                key: placement.key.clone(),
                expected: written,
                actual: 0,
            })?
            .size_bytes;
        if stored != written {
            return Err(FerryError::VerificationMismatch {
                key: placement.key.clone(),
                expected: written,
                actual: stored,
            });
        }
        Ok(())
    }

    /// Decides once whether the body is passed through or compressed.
    async fn prepare_body(
        &self,
        object: &StagedObject,
        source: ObjectStream,
    ) -> FerryResult<ObjectStream> {
        if object.content_encoding != ContentEncoding::Identity {
            debug!(object = %object.uri(), encoding = %object.content_encoding, "passing through");
            return Ok(source);
        }

        let (is_gzip, source) = sniff_gzip(source).await?;
        if is_gzip {
            debug!(object = %object.uri(), "untagged gzip payload, passing through");
            Ok(source)
        } else {
            Ok(gzip_stream(source))
        }
    }

    /// Outcome for an event that never reached the state machine.
    fn rejected(
        &self,
        invocation_id: Uuid,
        event: &TriggerEvent,
        status: TransferStatus,
        err: &FerryError,
    ) -> TransferOutcome {
        let now = Utc::now();
        TransferOutcome {
            invocation_id,
            trigger: TransferTrigger::Event,
            staged_object: StagedObject {
                bucket: event.source_bucket.clone(),
                key: event.object_key.clone(),
                size_bytes: 0,
                created_at: now,
                content_encoding: ContentEncoding::Identity,
                content_type: None,
                generation: None,
            },
            target_key: self
                .naming
                .target_key(&event.source_bucket, &event.object_key)
                .unwrap_or_default(),
            status,
            bytes_transferred: 0,
            bytes_read: 0,
            already_present: false,
            source_deleted: false,
            attempted_at: now,
            failed_stage: Some(TransferStage::Received),
            error: Some(err.to_string()),
        }
    }
}

/// Emits the structured record every transfer produces.
fn log_outcome(outcome: &TransferOutcome) {
    let object = outcome.staged_object.uri();
    if outcome.succeeded() {
        info!(
            invocation_id = %outcome.invocation_id,
            trigger = outcome.trigger.label(),
            object = %object,
            target_key = %outcome.target_key,
            status = ?outcome.status,
            bytes_read = outcome.bytes_read,
            bytes_transferred = outcome.bytes_transferred,
            already_present = outcome.already_present,
            source_deleted = outcome.source_deleted,
            "transfer outcome"
        );
    } else {
        warn!(
            invocation_id = %outcome.invocation_id,
            trigger = outcome.trigger.label(),
            object = %object,
            target_key = %outcome.target_key,
            status = ?outcome.status,
            failed_stage = ?outcome.failed_stage,
            bytes_read = outcome.bytes_read,
            error = outcome.error.as_deref().unwrap_or_default(),
            "transfer outcome"
        );
    }
}
