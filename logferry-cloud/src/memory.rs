//! In-memory staging and target stores.
//!
//! Used for local runs and tests. Both stores can be told to fail specific
//! operations so failure paths of the pipeline can be exercised without a
//! cloud account.

use crate::error::{FerryError, FerryResult};
use crate::staging::{ObjectStream, StagingStore};
use crate::target::TargetStore;
use crate::types::{ContentEncoding, CrossCloudCredential, ObjectPage, PutOptions, StagedObject, TargetObjectMeta};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Size of the chunks a staged body is streamed in.
const READ_CHUNK_SIZE: usize = 16 * 1024;

fn is_marked(set: &RwLock<HashSet<String>>, key: &str) -> bool {
    set.read().unwrap_or_else(PoisonError::into_inner).contains(key)
}

#[derive(Debug, Clone)]
struct StagedEntry {
    meta: StagedObject,
    data: Bytes,
}

/// Thread-safe staging store backed by a map.
#[derive(Debug, Default)]
pub struct MemoryStagingStore {
    objects: RwLock<BTreeMap<(String, String), StagedEntry>>,
    failing_reads: RwLock<HashSet<String>>,
    stalled_reads: RwLock<HashSet<String>>,
    failing_deletes: RwLock<HashSet<String>>,
    stalled_deletes: RwLock<HashSet<String>>,
    stalled_heads: RwLock<HashSet<String>>,
    next_generation: AtomicU64,
    delete_calls: AtomicUsize,
}

impl MemoryStagingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` under `bucket/key` and returns its metadata. Replacing an
    /// existing key assigns a new generation.
    pub fn insert(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
        created_at: DateTime<Utc>,
        content_encoding: ContentEncoding,
    ) -> StagedObject {
        let data = data.into();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let meta = StagedObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size_bytes: data.len() as u64,
            created_at,
            content_encoding,
            content_type: None,
            generation: Some(generation.to_string()),
        };
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (bucket.to_string(), key.to_string()),
                StagedEntry {
                    meta: meta.clone(),
                    data,
                },
            );
        meta
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes every read of `key` fail before the first byte.
    pub fn fail_reads_for(&self, key: &str) {
        self.failing_reads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    /// Makes reads of `key` yield one chunk and then never finish.
    pub fn stall_reads_for(&self, key: &str) {
        self.stalled_reads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    /// Makes every delete of `key` fail.
    pub fn fail_deletes_for(&self, key: &str) {
        self.failing_deletes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    /// Makes deletes of `key` never finish.
    pub fn stall_deletes_for(&self, key: &str) {
        self.stalled_deletes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    /// Makes metadata reads of `key` never finish.
    pub fn stall_heads_for(&self, key: &str) {
        self.stalled_heads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    /// Number of delete calls received, successful or not.
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn head(&self, bucket: &str, key: &str) -> FerryResult<StagedObject> {
        if is_marked(&self.stalled_heads, key) {
            futures::future::pending::<()>().await;
        }
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(bucket.to_string(), key.to_string()))
            .map(|e| e.meta.clone())
            .ok_or_else(|| FerryError::NotFound(format!("gs://{bucket}/{key}")))
    }

    async fn list_page(
        &self,
        bucket: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> FerryResult<ObjectPage> {
        // The token is the last key already returned, so objects deleted
        // between pages never shift the listing.
        let start = match page_token {
            Some(after) => Bound::Excluded((bucket.to_string(), after.to_string())),
            None => Bound::Included((bucket.to_string(), String::new())),
        };
        let page_size = page_size.max(1) as usize;

        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let mut in_bucket = objects
            .range((start, Bound::Unbounded))
            .take_while(|((b, _), _)| b == bucket)
            .map(|(_, e)| e.meta.clone());

        let page: Vec<StagedObject> = in_bucket.by_ref().take(page_size).collect();
        let more = in_bucket.next().is_some();

        Ok(ObjectPage {
            next_page_token: if more {
                page.last().map(|o| o.key.clone())
            } else {
                None
            },
            objects: page,
        })
    }

    async fn open_read(&self, object: &StagedObject) -> FerryResult<ObjectStream> {
        if is_marked(&self.failing_reads, &object.key) {
            return Err(FerryError::TransientUnavailable(format!(
                "injected read failure for {}",
                object.uri()
            )));
        }

        let entry = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(object.bucket.clone(), object.key.clone()))
            .cloned()
            .ok_or_else(|| FerryError::NotFound(object.uri()))?;

        let chunks: Vec<FerryResult<Bytes>> = entry
            .data
            .chunks(READ_CHUNK_SIZE)
            .map(|c| Ok(entry.data.slice_ref(c)))
            .collect();

        if is_marked(&self.stalled_reads, &object.key) {
            let first = chunks.into_iter().take(1);
            return Ok(futures::stream::iter(first)
                .chain(futures::stream::pending())
                .boxed());
        }
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn delete(&self, object: &StagedObject) -> FerryResult<()> {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);
        if is_marked(&self.stalled_deletes, &object.key) {
            futures::future::pending::<()>().await;
        }
        if is_marked(&self.failing_deletes, &object.key) {
            return Err(FerryError::TransientUnavailable(format!(
                "injected delete failure for {}",
                object.uri()
            )));
        }

        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let id = (object.bucket.clone(), object.key.clone());
        // Same generation guard as the real store: a newer upload survives.
        if objects
            .get(&id)
            .is_some_and(|e| e.meta.generation == object.generation)
        {
            objects.remove(&id);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct TargetEntry {
    data: Bytes,
    options: PutOptions,
}

/// Thread-safe target store backed by a map.
#[derive(Debug, Default)]
pub struct MemoryTargetStore {
    objects: RwLock<BTreeMap<String, TargetEntry>>,
    failing_puts: RwLock<HashSet<String>>,
    failing_heads: RwLock<HashSet<String>>,
    lost_writes: RwLock<HashSet<String>>,
    misreported_sizes: RwLock<HashMap<String, u64>>,
    put_delay: RwLock<Option<Duration>>,
    put_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryTargetStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored bytes at `key`.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|e| e.data.clone())
    }

    /// Upload options the object at `key` was stored with.
    pub fn options(&self, key: &str) -> Option<PutOptions> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|e| e.options.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes every upload to `key` fail after the body has been read.
    pub fn fail_puts_for(&self, key: &str) {
        self.failing_puts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    /// Makes every metadata read of `key` fail.
    pub fn fail_heads_for(&self, key: &str) {
        self.failing_heads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    /// Makes uploads to `key` report success without storing anything.
    pub fn lose_writes_for(&self, key: &str) {
        self.lost_writes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    /// Makes `head` report `size` for `key` regardless of what is stored.
    pub fn misreport_size_for(&self, key: &str, size: u64) {
        self.misreported_sizes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), size);
    }

    /// Holds every upload open for `delay` before storing it.
    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.write().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Number of uploads started.
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::Relaxed)
    }

    /// Highest number of uploads observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Relaxed)
    }
}

/// Decrements the in-flight counter even when the upload future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn head(
        &self,
        creds: &CrossCloudCredential,
        key: &str,
    ) -> FerryResult<Option<TargetObjectMeta>> {
        if creds.is_expired() {
            return Err(FerryError::TransientUnavailable("credentials expired".into()));
        }
        if is_marked(&self.failing_heads, key) {
            return Err(FerryError::TransientUnavailable(format!(
                "injected head failure for {key}"
            )));
        }

        let override_size = self
            .misreported_sizes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied();

        Ok(self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|e| TargetObjectMeta {
                key: key.to_string(),
                size_bytes: override_size.unwrap_or(e.data.len() as u64),
                content_encoding: e.options.content_encoding.clone(),
                metadata: e.options.metadata.clone(),
            }))
    }

    async fn put_stream(
        &self,
        creds: &CrossCloudCredential,
        key: &str,
        options: &PutOptions,
        mut body: ObjectStream,
    ) -> FerryResult<u64> {
        if creds.is_expired() {
            return Err(FerryError::TransientUnavailable("credentials expired".into()));
        }

        self.put_calls.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_in_flight.fetch_max(now, Ordering::Relaxed);
        let _guard = InFlight(&self.in_flight);

        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }

        let delay = *self.put_delay.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if is_marked(&self.failing_puts, key) {
            return Err(FerryError::TransientUnavailable(format!(
                "injected upload failure for {key}"
            )));
        }

        let size = buf.len() as u64;
        if is_marked(&self.lost_writes, key) {
            return Ok(size);
        }
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.to_string(),
                TargetEntry {
                    data: buf.freeze(),
                    options: options.clone(),
                },
            );
        Ok(size)
    }
}
