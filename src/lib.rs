//! Range-addressable media cache.
//!
//! Turns arbitrary byte-range reads of upstream media into a minimal set of chunk-sized
//! upstream fetches. Fetched bytes are persisted per range and reused by later reads, concurrent
//! reads of overlapping ranges share fetches, and synchronous reads always get ahead of
//! read-ahead and background warm-up.
//!
//! ```text
//!  request_range ──► [top]     ┐
//!  read-ahead    ──► [buffer]  ├─► scheduler ──► fetch workers ──► ContentProvider
//!  warm_up       ──► [regular] ┘       │                │
//!                                      └── RangeStore ◄─┘
//! ```

mod catalog;
mod config;
pub mod error;
mod inflight;
pub mod interval;
mod manager;
mod provider;
mod queue;
mod scheduler;
mod store;

use std::sync::Arc;

#[rustfmt::skip]
pub use manager::MediaCache;
#[rustfmt::skip]
pub use catalog::{MediaCatalog, MediaRecord};
#[rustfmt::skip]
pub use config::CacheConfig;
#[rustfmt::skip]
pub use provider::{ContentProvider, HttpProvider, ProviderRegistry};
#[rustfmt::skip]
pub use queue::Priority;
#[rustfmt::skip]
pub use store::{CachedChunk, RangeStore};

/// Opaque identifier of a piece of media.
pub type MediaId = Arc<str>;

/// Tag selecting the [`ContentProvider`] responsible for a media.
pub type SourceTag = String;
