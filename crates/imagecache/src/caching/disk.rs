use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::fs::{EntryLock, catch_not_found, persist_tempfile, tempfile_in};
use super::location::StorageLocation;
use super::{Cache, CacheKey, PruneStats, StorageError};
use crate::codec::ValueCodec;
use crate::config::DiskCacheConfig;

/// A bounded, persistent cache tier backed by a directory.
///
/// Every entry is a single file named after its [`CacheKey::file_name`], holding exactly the
/// bytes produced by the codec. The directory may be shared by multiple processes:
///
/// - Writers stage the new contents in `<dir>/tmp` and atomically rename them into place, so a
///   reader only ever sees a complete file.
/// - Writers and deleters hold a per-entry `<file>.lock`, created exclusively.
/// - Readers take no lock. A read that races a delete reports the entry as absent.
///
/// After every insert, the oldest files are pruned until at most `max_files` remain.
pub struct DiskCache<V> {
    pub(super) cache_dir: PathBuf,
    pub(super) tmp_dir: PathBuf,
    pub(super) max_files: usize,
    pub(super) lock_stale_after: Duration,
    pub(super) codec: Arc<dyn ValueCodec<Value = V>>,
}

impl<V> fmt::Debug for DiskCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCache")
            .field("cache_dir", &self.cache_dir)
            .field("max_files", &self.max_files)
            .field("lock_stale_after", &self.lock_stale_after)
            .finish()
    }
}

/// Size information about a [`DiskCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskStats {
    /// The number of cache files.
    pub files: usize,
    /// The combined size of all cache files.
    pub bytes: u64,
}

impl<V> DiskCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Opens the cache in `cache_dir`, creating the directory if necessary.
    ///
    /// Temporary files left behind by crashed writers are removed.
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        config: &DiskCacheConfig,
        codec: Arc<dyn ValueCodec<Value = V>>,
    ) -> io::Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;
        let cache = Self {
            tmp_dir: cache_dir.join("tmp"),
            cache_dir,
            max_files: config.max_files,
            lock_stale_after: config.lock_stale_after,
            codec,
        };
        cache.clear_tmp()?;
        Ok(cache)
    }

    /// Opens the cache in the directory `location` resolves to.
    pub fn from_location(
        location: &dyn StorageLocation,
        config: &DiskCacheConfig,
        codec: Arc<dyn ValueCodec<Value = V>>,
    ) -> io::Result<Self> {
        Self::new(location.resolve()?, config, codec)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The path of the file holding the entry for `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.file_name())
    }

    /// Writes `contents` as the entry for `key`, replacing a previous entry.
    ///
    /// This prunes the cache afterwards. Pruning failures are logged but do not fail the write.
    pub fn insert_bytes(&self, key: &CacheKey, contents: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);

        {
            let _lock =
                EntryLock::acquire(&path, self.lock_stale_after)?.ok_or(StorageError::Locked)?;

            let mut temp_file = tempfile_in(&self.tmp_dir)?;
            temp_file.write_all(contents)?;
            temp_file.as_file().sync_data()?;
            persist_tempfile(temp_file, &path)?;
        }

        tracing::trace!(%key, path = %path.display(), "Wrote cache file");
        metric!(counter("caches.file.write") += 1);
        metric!(time_raw("caches.file.size") = contents.len() as u64);

        if let Err(err) = self.prune() {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                cache_dir = %self.cache_dir.display(),
                "Failed to prune disk cache",
            );
        }

        Ok(())
    }

    /// Reads the raw bytes of the entry for `key`.
    ///
    /// Returns `Ok(None)` if there is no such entry.
    pub fn get_bytes(&self, key: &CacheKey) -> io::Result<Option<Bytes>> {
        let path = self.path_for(key);
        Ok(catch_not_found(|| fs::read(&path))?.map(Bytes::from))
    }

    /// Looks up and decodes the entry for `key`.
    ///
    /// Files that can not be read or decoded are reported as absent.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let bytes = match self.get_bytes(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                metric!(counter("caches.file.miss") += 1);
                return None;
            }
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    %key,
                    "Failed to read cache file",
                );
                return None;
            }
        };

        match self.codec.decode(bytes) {
            Ok(value) => {
                metric!(counter("caches.file.hit") += 1);
                Some(value)
            }
            Err(err) => {
                tracing::warn!(error = %err, %key, "Failed to decode cache file");
                metric!(counter("caches.file.malformed") += 1);
                None
            }
        }
    }

    /// Removes the entry for `key`, if it exists.
    pub fn remove(&self, key: &CacheKey) {
        let path = self.path_for(key);
        if let Err(err) = self.remove_path(&path) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                %key,
                "Failed to remove cache file",
            );
        }
    }

    /// Removes all entries.
    ///
    /// Entries that are locked by a concurrent writer are left alone.
    pub fn clear(&self) {
        let entries = match self.list_entries() {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    cache_dir = %self.cache_dir.display(),
                    "Failed to list disk cache",
                );
                return;
            }
        };
        for entry in entries {
            if let Err(err) = self.remove_path(&entry.path) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    path = %entry.path.display(),
                    "Failed to remove cache file",
                );
            }
        }
    }

    /// Counts the files in this cache and their total size.
    pub fn stats(&self) -> io::Result<DiskStats> {
        let entries = self.list_entries()?;
        Ok(DiskStats {
            files: entries.len(),
            bytes: entries.iter().map(|e| e.size).sum(),
        })
    }

    /// Deletes the file at `path` while holding its lock.
    ///
    /// Returns whether a file was actually removed.
    fn remove_path(&self, path: &Path) -> io::Result<bool> {
        let Some(_lock) = EntryLock::acquire(path, self.lock_stale_after)? else {
            tracing::debug!(path = %path.display(), "Skipped removing locked cache file");
            return Ok(false);
        };
        Ok(catch_not_found(|| fs::remove_file(path))?.is_some())
    }
}

impl<V> Cache<V> for DiskCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &CacheKey) -> Option<V> {
        DiskCache::get(self, key)
    }

    fn insert(&self, key: &CacheKey, value: &V) -> Result<(), StorageError> {
        let bytes = self.codec.encode(value);
        self.insert_bytes(key, &bytes)
    }

    fn remove(&self, key: &CacheKey) {
        DiskCache::remove(self, key)
    }

    fn clear(&self) {
        DiskCache::clear(self)
    }

    fn prune(&self) -> io::Result<PruneStats> {
        DiskCache::prune(self)
    }
}
