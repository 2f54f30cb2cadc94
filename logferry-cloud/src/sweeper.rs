//! Periodic reconciliation of the staging store.
//!
//! Anything the event path missed or failed is still in staging. A sweep
//! lists the bucket page by page and re-runs the shared transfer for every
//! object older than the staleness threshold, within a fixed time budget.

use crate::config::FerryConfig;
use crate::error::{FerryError, FerryResult};
use crate::staging::StagingStore;
use crate::transfer::TransferWorker;
use crate::types::{StagedObject, SweepReport, TransferTrigger};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Iterates over staging listing pages until the listing ends or the
/// deadline passes, whichever comes first.
pub struct PageCursor<'a> {
    store: &'a dyn StagingStore,
    bucket: &'a str,
    page_size: u32,
    deadline: Instant,
    next_token: Option<String>,
    exhausted: bool,
}

impl<'a> PageCursor<'a> {
    pub fn new(store: &'a dyn StagingStore, bucket: &'a str, page_size: u32, deadline: Instant) -> Self {
        Self {
            store,
            bucket,
            page_size,
            deadline,
            next_token: None,
            exhausted: false,
        }
    }

    /// Returns the next page, or `None` when there is nothing more to read
    /// before the deadline. Check [`is_exhausted`](Self::is_exhausted) to tell
    /// the two apart.
    pub async fn next_page(&mut self) -> FerryResult<Option<Vec<StagedObject>>> {
        if self.exhausted || Instant::now() >= self.deadline {
            return Ok(None);
        }

        let listing = self
            .store
            .list_page(self.bucket, self.next_token.as_deref(), self.page_size);
        let page = match tokio::time::timeout_at(self.deadline, listing).await {
            Ok(page) => page?,
            Err(_) => return Ok(None),
        };

        self.next_token = page.next_page_token;
        if self.next_token.is_none() {
            self.exhausted = true;
        }
        Ok(Some(page.objects))
    }

    /// True once the last page has been returned.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

/// Scheduled retry of stale staged objects.
pub struct CleanupSweeper {
    worker: Arc<TransferWorker>,
    page_size: u32,
    concurrency: usize,
    budget: Duration,
    slot: Semaphore,
}

impl CleanupSweeper {
    pub fn new(worker: Arc<TransferWorker>, page_size: u32, concurrency: usize, budget: Duration) -> Self {
        Self {
            worker,
            page_size: page_size.max(1),
            concurrency: concurrency.max(1),
            budget,
            slot: Semaphore::new(1),
        }
    }

    pub fn from_config(worker: Arc<TransferWorker>, config: &FerryConfig) -> Self {
        Self::new(
            worker,
            config.list_page_size,
            config.sweep_concurrency,
            config.sweep_budget,
        )
    }

    /// Retries every staged object created before `now - age_threshold`.
    ///
    /// Per-object failures are counted, not returned. `AuthDenied` aborts the
    /// sweep. A second sweep started while one is running gets `Busy`.
    pub async fn sweep(&self, age_threshold: Duration) -> FerryResult<SweepReport> {
        let _permit = self
            .slot
            .try_acquire()
            .map_err(|_| FerryError::Busy("a sweep is already running".into()))?;

        let started = Instant::now();
        let deadline = started + self.budget;
        let now = Utc::now();
        let bucket = self.worker.staging_bucket().to_string();

        self.worker.acquire_credentials().await?;

        let mut report = SweepReport::default();
        let mut cursor = PageCursor::new(
            self.worker.staging().as_ref(),
            &bucket,
            self.page_size,
            deadline,
        );
        let mut out_of_budget = false;
        let mut listing_failed = false;

        loop {
            let page = match cursor.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    error!(bucket = %bucket, "sweep aborted while listing: {e}");
                    return Err(e);
                }
                Err(e) => {
                    warn!(bucket = %bucket, "listing failed, ending sweep early: {e}");
                    listing_failed = true;
                    break;
                }
            };

            report.scanned += page.len() as u64;
            let stale: Vec<StagedObject> = page
                .into_iter()
                .filter(|o| o.is_older_than(age_threshold, now))
                .collect();
            debug!(bucket = %bucket, stale = stale.len(), "processing page");

            let worker = Arc::clone(&self.worker);
            let mut transfers = futures::stream::iter(stale)
                .map(move |object| {
                    let worker = Arc::clone(&worker);
                    async move {
                        if Instant::now() >= deadline {
                            return None;
                        }
                        Some(
                            worker
                                .transfer_with_deadline(&object, TransferTrigger::Sweep, Some(deadline))
                                .await,
                        )
                    }
                })
                .buffer_unordered(self.concurrency);

            while let Some(result) = transfers.next().await {
                match result {
                    None => out_of_budget = true,
                    Some(Ok(outcome)) => {
                        report.retried += 1;
                        if outcome.succeeded() {
                            report.succeeded += 1;
                        } else {
                            report.failed += 1;
                        }
                    }
                    Some(Err(e)) => {
                        report.retried += 1;
                        report.failed += 1;
                        error!(bucket = %bucket, ?report, "sweep aborted: {e}");
                        return Err(e);
                    }
                }
            }

            if out_of_budget {
                break;
            }
        }

        report.complete = cursor.is_exhausted() && !out_of_budget && !listing_failed;
        info!(
            bucket = %bucket,
            scanned = report.scanned,
            retried = report.retried,
            succeeded = report.succeeded,
            failed = report.failed,
            complete = report.complete,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sweep report"
        );
        Ok(report)
    }
}
