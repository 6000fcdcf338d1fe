#![forbid(unsafe_code)]

//! Ingestion of Lightning node events.
//!
//! Events are pulled from node backends (routing forwards, HTLC events,
//! on-chain transactions and channel graph updates), stored exactly once per
//! natural key, and changes are announced to in-process subscribers on the
//! [`bus::EventBus`].
//!
//! The pieces:
//! - [`cache::IdentifierCache`] resolves external identities to internal ids
//! - [`store::Store`] is the persistence gateway
//! - [`subscription::run_stream`] and [`subscription::run_poll`] run workers
//! - [`backfill`] pages history from the durable watermark
//! - [`detector::ChangeDetector`] keeps the change logs
//! - [`ingest::Ingestor`] wires the workers of one backend together

pub mod backend;
pub mod backfill;
pub mod bus;
pub mod cache;
pub mod config;
pub mod detector;
pub mod ingest;
pub mod limiter;
pub mod model;
pub mod store;
pub mod subscription;
#[cfg(any(test, feature = "test_utils"))]
pub mod testing;
pub mod util;

pub use cache::{CacheError, IdentifierCache};
pub use config::{ConfigError, IngestConfig};
pub use ingest::Ingestor;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] store::Error),
    #[error("identifier cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("backend error: {0}")]
    Backend(#[from] tonic::Status),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
