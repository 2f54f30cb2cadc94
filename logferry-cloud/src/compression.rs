//! Streaming gzip for object bodies.
//!
//! Compression happens chunk by chunk as the body flows from staging to the
//! target, so memory stays bounded by the chunk and flush sizes regardless of
//! object size.

use crate::error::{FerryError, FerryResult};
use crate::staging::ObjectStream;
use async_stream::stream;
use bytes::{Bytes, BytesMut};
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::{StreamExt, TryStreamExt, future};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// First two bytes of every gzip member.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compressed output is yielded once this much has accumulated.
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Wraps `input` so that the yielded bytes are its gzip compression.
///
/// An empty input still yields a valid (header and trailer only) gzip member.
pub fn gzip_stream(mut input: ObjectStream) -> ObjectStream {
    Box::pin(stream! {
        let mut encoder = GzEncoder::new(Vec::with_capacity(FLUSH_THRESHOLD), Compression::default());

        while let Some(chunk) = input.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            if let Err(e) = encoder.write_all(&chunk) {
                yield Err(FerryError::from(e));
                return;
            }
            if encoder.get_ref().len() >= FLUSH_THRESHOLD {
                let out = std::mem::take(encoder.get_mut());
                yield Ok(Bytes::from(out));
            }
        }

        match encoder.finish() {
            Ok(out) if out.is_empty() => {}
            Ok(out) => {
                yield Ok(Bytes::from(out));
            }
            Err(e) => {
                yield Err(FerryError::from(e));
            }
        }
    })
}

/// Peeks at the start of `input` to see whether it is gzip data, without
/// consuming it: the returned stream replays the peeked bytes first.
pub async fn sniff_gzip(mut input: ObjectStream) -> FerryResult<(bool, ObjectStream)> {
    let mut head = BytesMut::new();
    while head.len() < GZIP_MAGIC.len() {
        match input.next().await {
            Some(chunk) => head.extend_from_slice(&chunk?),
            None => break,
        }
    }

    let is_gzip = head.starts_with(&GZIP_MAGIC);
    if head.is_empty() {
        return Ok((false, input));
    }
    let replay = futures::stream::once(future::ready(Ok(head.freeze())));
    Ok((is_gzip, replay.chain(input).boxed()))
}

/// Adds the length of every chunk that passes through to `counter`.
pub fn counted(input: ObjectStream, counter: Arc<AtomicU64>) -> ObjectStream {
    input
        .inspect_ok(move |chunk| {
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        })
        .boxed()
}
