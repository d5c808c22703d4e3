//! Cache store for executed notebooks.
//!
//! Entries are keyed by [`FingerprintKey`](crate::fingerprint::FingerprintKey)
//! and hold the executed notebook plus the files the execution produced.
//! Layout:
//!
//! ```text
//! <cache_path>/
//! ├── VERSION
//! └── entries/
//!     ├── <key>.lock
//!     └── <key>/
//!         ├── record.bin
//!         └── artifacts/...
//! ```
//!
//! The cache is an optimization only: anything unreadable is a miss.

mod artifacts;
mod record;
mod store;

pub use artifacts::{FileTimes, collect_artifacts, file_times};
pub(crate) use artifacts::copy_relative;
pub use record::{ArtifactRecord, CacheEntry, CacheRecord, RECORD_VERSION};
pub use store::{CacheStore, PendingEntry};
