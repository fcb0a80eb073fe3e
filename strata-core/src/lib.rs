//! Strata Core - Blocklist polling and tenant index coordination
//!
//! Keeps every component of a block store in agreement about which immutable
//! blocks exist, without a central metadata database:
//! - Per-tenant indexes summarizing the bucket, rebuilt by a bounded set of builders
//! - Pollers that prefer the index and fall back to a full listing
//! - Atomically swapped, per-tenant blocklist snapshots for readers
//!
//! # Architecture
//!
//! - **Backend**: list/get/put/delete over an object store, with per-call deadlines
//! - **Index**: compressed tenant index and the builder that publishes it
//! - **Blocklist**: immutable snapshots and the poller that refreshes them
//! - **Ring**: consistent hashing that shards index building and compaction
//! - **Compaction**: time-window merging and retention of owned blocks

pub mod backend;
pub mod blocklist;
pub mod compaction;
pub mod config;
pub mod index;
pub mod metrics;
pub mod ring;

mod error;
mod types;

pub use error::{Result, StrataError};
pub use types::*;

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
