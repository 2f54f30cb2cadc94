//! Log transfer pipeline from a GCS staging bucket to an S3 target bucket.
//!
//! Provides:
//! - Event-triggered transfer of one staged object, with on-the-fly gzip
//! - Scheduled sweep that retries objects the event path missed
//! - Web-identity credential exchange with per-scope caching
//! - Deterministic target naming with an idempotency marker
//! - In-memory stores for local runs and tests

pub mod compression;
pub mod config;
pub mod credential_broker;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod naming;
pub mod staging;
pub mod sweeper;
pub mod target;
pub mod transfer;
pub mod trust;
pub mod types;

pub use config::FerryConfig;
pub use credential_broker::CredentialBroker;
pub use error::{FerryError, FerryResult};
pub use naming::ObjectNamingScheme;
pub use sweeper::CleanupSweeper;
pub use transfer::TransferWorker;
pub use types::*;
