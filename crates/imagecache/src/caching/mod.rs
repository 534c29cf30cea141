//! # Image caching infrastructure
//!
//! This module includes all the code that deals with the different layers of caching and the
//! central [`FetchError`] type, and explains how the layers fit together.
//!
//! ## Cache Layers
//!
//! The cache consists of two tiers in front of the network:
//!
//! - An in-memory tier ([`MemoryCache`]), bounded both by the number of entries and by their
//!   total cost. It is lost when the process exits.
//! - A file-system tier ([`DiskCache`]), bounded by the number of files. It persists across
//!   process restarts, and may be shared by several processes using the same directory.
//!
//! A request goes through the following steps:
//! - First, it goes through the in-memory tier.
//! - On miss, it will try to load the item from the file-system tier. Hits are promoted into the
//!   in-memory tier.
//! - On miss, it will finally download a fresh item. Concurrent requests for the same item share a
//!   single download, see [`FetchCoordinator`](crate::services::FetchCoordinator).
//! - The freshly downloaded item is written to both tiers before it is handed out.
//!
//! Errors are never cached. A failed download is retried by the next request for the same item.
//!
//! ### Metrics
//!
//! Here is a list of metrics that are collected:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the in-memory tier.
//! - `caches.file.hit`: Accesses served by the file-system tier.
//! - `caches.file.miss`: Lookups in the file-system tier that found no file.
//! - `caches.channel.hit`: Requests that joined an already running download.
//! - `caches.channel.miss`: Requests that started a new download.
//! - `caches.computation`: Actual downloads being run, and not served by any of the tiers.
//! - `caches.cancelled`: Downloads that were cancelled because every waiter went away.
//!
//! Various other metrics are being collected as well, including:
//! - `caches.file.size`: A histogram for the size (in bytes) of the written cache files.
//! - `caches.file.write`: The number of files being written to disk.
//! - `caches.file.pruned`: The number of files deleted to stay within `max_files`.
//! - `caches.file.malformed`: Cache files that could not be decoded.
//!
//! ### Configuration
//!
//! [`Config::caches`](crate::config::Config::caches) holds the limits of both tiers. The
//! directory of the file-system tier comes from [`Config::cache_dir`](crate::config::Config),
//! or from any other [`StorageLocation`].
//!
//! ## [`CacheKey`]
//!
//! The [`CacheKey`] is used both as the key for the in-memory tier and as the file name in the
//! file-system tier. It is the SHA256 hash of the full resource identifier.
//!
//! **NOTE**: Care must be taken to make sure that identifiers are stable, as it would otherwise
//! lead to bad cache reuse.

use std::io;

mod cache_error;
mod cache_key;
mod cleanup;
mod disk;
mod fs;
mod location;
mod memory;

pub use cache_error::{DecodeError, FetchError, FetchResult, StorageError};
pub use cache_key::CacheKey;
pub use cleanup::PruneStats;
pub use disk::{DiskCache, DiskStats};
pub use location::{FixedDirectory, StorageLocation, TempDirectory, UserCacheDirectory};
pub use memory::{MemoryCache, Weigher};

/// A single cache tier, mapping [`CacheKey`]s to values.
///
/// All methods are synchronous and safe to call concurrently. Implementations for slow storage may
/// block, so they should be called from a blocking context.
pub trait Cache<V>: Send + Sync {
    /// Returns the value for `key`, or `None` if it is absent.
    ///
    /// Lookups never fail. Entries that can not be read are reported as absent.
    fn get(&self, key: &CacheKey) -> Option<V>;

    /// Stores `value` under `key`, replacing a previous value.
    fn insert(&self, key: &CacheKey, value: &V) -> Result<(), StorageError>;

    /// Removes the value for `key`, if there is one.
    fn remove(&self, key: &CacheKey);

    /// Removes all values.
    fn clear(&self);

    /// Enforces the bounds of this tier right away.
    ///
    /// Tiers that always stay within their bounds do nothing.
    fn prune(&self) -> io::Result<PruneStats> {
        Ok(PruneStats::default())
    }
}
