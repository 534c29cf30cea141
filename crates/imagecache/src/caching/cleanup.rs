use std::fs::{self, read_dir};
use std::io;
use std::path::PathBuf;
use std::time::SystemTime;

use super::DiskCache;
use super::fs::{EntryLock, LOCK_SUFFIX, catch_not_found};

/// A cache file as seen by a directory listing.
#[derive(Debug)]
pub(super) struct DiskEntry {
    pub path: PathBuf,
    pub created: SystemTime,
    pub size: u64,
}

/// What a single [`DiskCache::prune`] pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Number of files that were deleted.
    pub removed_files: usize,
    /// Number of bytes that were freed.
    pub removed_bytes: u64,
    /// Number of files that would have been deleted but were locked.
    pub skipped_files: usize,
    /// Number of files left in the cache.
    pub retained_files: usize,
}

/// The creation time of a file, or its modification time where the file system does not
/// record creation times.
fn creation_time(metadata: &fs::Metadata) -> io::Result<SystemTime> {
    metadata.created().or_else(|_| metadata.modified())
}

impl<V> DiskCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Clear the temporary files left behind by crashed writers.
    ///
    /// We do this when opening the cache to avoid accumulating temporary files which survive a
    /// hard crash. Other processes may be writing into the same directory right now, so only
    /// files that were not touched for `lock_stale_after` are removed.
    pub fn clear_tmp(&self) -> io::Result<()> {
        fs::create_dir_all(&self.tmp_dir)?;

        let mut removed = 0;
        for entry in read_dir(&self.tmp_dir)? {
            let entry = entry?;
            let Some(metadata) = catch_not_found(|| entry.metadata())? else {
                continue;
            };
            let is_abandoned = metadata
                .modified()
                .ok()
                .and_then(|time| SystemTime::now().duration_since(time).ok())
                .is_some_and(|age| age > self.lock_stale_after);
            if !is_abandoned {
                continue;
            }

            let path = entry.path();
            let result = if metadata.is_dir() {
                catch_not_found(|| fs::remove_dir_all(&path))
            } else {
                catch_not_found(|| fs::remove_file(&path))
            };
            if result?.is_some() {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(
                tmp_dir = %self.tmp_dir.display(),
                removed,
                "Removed abandoned temporary files",
            );
        }
        Ok(())
    }

    /// Lists all cache files, oldest first.
    ///
    /// Files with equal creation times are ordered by name, so the order is deterministic for a
    /// given directory listing.
    pub(super) fn list_entries(&self) -> io::Result<Vec<DiskEntry>> {
        let Some(dir) = catch_not_found(|| read_dir(&self.cache_dir))? else {
            return Ok(vec![]);
        };

        let mut entries = Vec::new();
        for entry in dir {
            let entry = entry?;
            let path = entry.path();
            if path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(LOCK_SUFFIX))
            {
                continue;
            }

            // the file may have been deleted since listing the directory
            let Some(metadata) = catch_not_found(|| entry.metadata())? else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }

            entries.push(DiskEntry {
                path,
                created: creation_time(&metadata)?,
                size: metadata.len(),
            });
        }

        entries.sort_by(|a, b| (a.created, &a.path).cmp(&(b.created, &b.path)));
        Ok(entries)
    }

    /// Deletes the oldest files until at most `max_files` remain.
    ///
    /// Files that are currently locked by another writer are skipped in this pass, as are files
    /// that were replaced since they were listed.
    pub fn prune(&self) -> io::Result<PruneStats> {
        let entries = self.list_entries()?;
        let mut stats = PruneStats {
            retained_files: entries.len(),
            ..Default::default()
        };

        let mut excess = entries.len().saturating_sub(self.max_files);
        for entry in &entries {
            if excess == 0 {
                break;
            }

            let Some(_lock) = EntryLock::try_acquire(&entry.path, self.lock_stale_after)? else {
                stats.skipped_files += 1;
                continue;
            };

            // another writer may have replaced the file between listing and locking
            let current = catch_not_found(|| fs::metadata(&entry.path))?;
            match current {
                Some(metadata) if creation_time(&metadata)? != entry.created => {
                    stats.skipped_files += 1;
                    continue;
                }
                Some(_) => {
                    if catch_not_found(|| fs::remove_file(&entry.path))?.is_some() {
                        stats.removed_files += 1;
                        stats.removed_bytes += entry.size;
                    }
                }
                // removed by someone else, which counts towards our goal all the same
                None => {}
            }
            excess -= 1;
            stats.retained_files -= 1;
        }

        if stats.removed_files > 0 {
            tracing::debug!(
                cache_dir = %self.cache_dir.display(),
                removed_files = stats.removed_files,
                removed_bytes = stats.removed_bytes,
                "Pruned disk cache",
            );
            metric!(counter("caches.file.pruned") += stats.removed_files as i64);
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::thread::{self, sleep};
    use std::time::Duration;

    use bytes::Bytes;
    use filetime::FileTime;

    use super::*;
    use crate::caching::fs::{persist_tempfile, tempfile_in};
    use crate::caching::{Cache, CacheKey, StorageError};
    use crate::codec::BytesCodec;
    use crate::codec::tests::TextCodec;
    use crate::config::DiskCacheConfig;
    use crate::test;

    fn disk_config(max_files: usize) -> DiskCacheConfig {
        DiskCacheConfig {
            max_files,
            ..Default::default()
        }
    }

    fn file_names(cache: &DiskCache<Bytes>) -> Vec<String> {
        let mut names: Vec<_> = cache
            .list_entries()
            .unwrap()
            .into_iter()
            .map(|e| e.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_prunes_oldest_files() {
        test::setup();
        let dir = test::tempdir();
        let cache = DiskCache::new(dir.path(), &disk_config(5), Arc::new(BytesCodec)).unwrap();

        for i in 1..=7 {
            let key = CacheKey::from(format!("img{i}").as_str());
            cache.insert(&key, &Bytes::from(format!("image {i}"))).unwrap();
            // make sure the file system records distinct creation times
            sleep(Duration::from_millis(25));
        }

        let mut expected: Vec<_> = (3..=7)
            .map(|i| CacheKey::from(format!("img{i}").as_str()).file_name())
            .collect();
        expected.sort();
        assert_eq!(file_names(&cache), expected);

        for i in 1..=2 {
            let key = CacheKey::from(format!("img{i}").as_str());
            assert_eq!(cache.get(&key), None);
        }
        assert_eq!(
            cache.get(&CacheKey::from("img7")),
            Some(Bytes::from("image 7"))
        );
    }

    #[test]
    fn test_never_exceeds_max_files() {
        test::setup();
        let dir = test::tempdir();
        let cache = DiskCache::new(dir.path(), &disk_config(3), Arc::new(BytesCodec)).unwrap();

        for i in 0..20 {
            let key = CacheKey::from(format!("https://x/{i}.png").as_str());
            cache.insert(&key, &Bytes::from_static(b"png")).unwrap();
            assert!(cache.stats().unwrap().files <= 3);
        }

        let stats = cache.stats().unwrap();
        assert_eq!(stats.files, 3);
        assert_eq!(stats.bytes, 9);
    }

    #[test]
    fn test_prune_skips_locked_entries() {
        test::setup();
        let dir = test::tempdir();
        let cache = DiskCache::new(dir.path(), &disk_config(10), Arc::new(BytesCodec)).unwrap();

        let oldest = CacheKey::from("oldest");
        cache.insert(&oldest, &Bytes::from_static(b"1")).unwrap();
        sleep(Duration::from_millis(25));
        let newer = CacheKey::from("newer");
        cache.insert(&newer, &Bytes::from_static(b"2")).unwrap();

        let lock = EntryLock::try_acquire(&cache.path_for(&oldest), cache.lock_stale_after)
            .unwrap()
            .unwrap();

        let cache = DiskCache {
            max_files: 1,
            ..cache
        };
        let stats = cache.prune().unwrap();
        assert_eq!(stats.skipped_files, 1);
        assert_eq!(stats.removed_files, 1);
        assert_eq!(cache.get(&oldest), Some(Bytes::from_static(b"1")));
        assert_eq!(cache.get(&newer), None);

        // the locked entry counted as retained, so there is nothing left to do
        drop(lock);
        let stats = cache.prune().unwrap();
        assert_eq!(stats.removed_files, 0);
        assert_eq!(stats.retained_files, 1);
    }

    #[test]
    fn test_insert_fails_when_locked() {
        test::setup();
        let dir = test::tempdir();
        let config = DiskCacheConfig {
            max_files: 10,
            lock_stale_after: Duration::from_secs(3600),
        };
        let cache = DiskCache::new(dir.path(), &config, Arc::new(BytesCodec)).unwrap();
        let key = CacheKey::from("contended");

        let _lock = EntryLock::try_acquire(&cache.path_for(&key), cache.lock_stale_after)
            .unwrap()
            .unwrap();
        let result = cache.insert(&key, &Bytes::from_static(b"data"));
        assert!(matches!(result, Err(StorageError::Locked)));
        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn test_overwrite_replaces_contents() {
        test::setup();
        let dir = test::tempdir();
        let cache = DiskCache::new(dir.path(), &disk_config(5), Arc::new(BytesCodec)).unwrap();
        let key = CacheKey::from("https://x/y.png");

        cache.insert(&key, &Bytes::from_static(b"a much longer first version")).unwrap();
        cache.insert(&key, &Bytes::from_static(b"short")).unwrap();

        assert_eq!(cache.get(&key), Some(Bytes::from_static(b"short")));
        assert_eq!(cache.stats().unwrap().files, 1);
    }

    #[test]
    fn test_corrupt_file_is_absent() {
        test::setup();
        let dir = test::tempdir();
        let cache = DiskCache::new(dir.path(), &disk_config(5), Arc::new(TextCodec)).unwrap();
        let key = CacheKey::from("https://x/y.txt");

        fs::write(cache.path_for(&key), [0xff, 0xfe, 0xfd]).unwrap();
        assert_eq!(cache.get(&key), None);

        cache.insert(&key, &"valid".to_owned()).unwrap();
        assert_eq!(cache.get(&key).as_deref(), Some("valid"));
    }

    #[test]
    fn test_remove_and_clear() {
        test::setup();
        let dir = test::tempdir();
        let cache = DiskCache::new(dir.path(), &disk_config(5), Arc::new(BytesCodec)).unwrap();
        let a = CacheKey::from("a");
        let b = CacheKey::from("b");
        cache.insert(&a, &Bytes::from_static(b"a")).unwrap();
        cache.insert(&b, &Bytes::from_static(b"b")).unwrap();

        cache.remove(&a);
        assert_eq!(cache.get(&a), None);
        // removing an absent entry is not an error
        cache.remove(&a);

        cache.clear();
        assert_eq!(cache.get(&b), None);
        assert_eq!(cache.stats().unwrap(), Default::default());
        // the directory survives a clear and can be written to again
        cache.insert(&a, &Bytes::from_static(b"a")).unwrap();
        assert_eq!(cache.get(&a), Some(Bytes::from_static(b"a")));
    }

    #[test]
    fn test_clears_abandoned_tmp_files_on_open() {
        test::setup();
        let dir = test::tempdir();
        let tmp = dir.path().join("tmp");
        fs::create_dir_all(&tmp).unwrap();

        let leftover = tmp.join("tmp-leftover");
        fs::write(&leftover, b"half written").unwrap();
        let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
        filetime::set_file_mtime(&leftover, FileTime::from_system_time(an_hour_ago)).unwrap();

        let in_progress = tmp.join("tmp-in-progress");
        fs::write(&in_progress, b"still writing").unwrap();

        let cache = DiskCache::new(dir.path(), &disk_config(5), Arc::new(BytesCodec)).unwrap();
        assert!(tmp.is_dir());
        assert!(!leftover.exists());
        assert!(in_progress.exists());
        // the tmp directory is not counted as an entry
        assert_eq!(cache.stats().unwrap().files, 0);
    }

    #[test]
    fn test_open_keeps_concurrent_writes() {
        test::setup();
        let dir = test::tempdir();
        let writer = DiskCache::new(dir.path(), &disk_config(5), Arc::new(BytesCodec)).unwrap();
        let key = CacheKey::from("https://x/y.png");

        let mut staged = tempfile_in(&writer.tmp_dir).unwrap();
        staged.write_all(b"staged by the first cache").unwrap();

        // another process opens the same directory while the write is in flight
        let reader = DiskCache::new(dir.path(), &disk_config(5), Arc::new(BytesCodec)).unwrap();

        persist_tempfile(staged, &writer.path_for(&key)).unwrap();
        assert_eq!(
            reader.get(&key),
            Some(Bytes::from_static(b"staged by the first cache"))
        );
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        test::setup();
        let dir = test::tempdir();
        let cache = DiskCache::new(dir.path(), &disk_config(3), Arc::new(BytesCodec)).unwrap();
        let key = CacheKey::from("https://x/shared.png");
        let payloads: Vec<_> = (0..8u8)
            .map(|i| Bytes::from(vec![i; 256 * 1024]))
            .collect();

        thread::scope(|scope| {
            for (i, payload) in payloads.iter().enumerate() {
                let (cache, key, payloads) = (&cache, &key, &payloads);
                scope.spawn(move || {
                    for round in 0..5 {
                        cache.insert(key, payload).unwrap();
                        // distinct entries make the writers prune concurrently as well
                        let other = CacheKey::from(format!("https://x/{i}/{round}.png").as_str());
                        cache.insert(&other, payload).unwrap();

                        // the entry may have been pruned, but it is never half written
                        if let Some(read) = cache.get(key) {
                            assert!(payloads.contains(&read));
                        }
                    }
                });
            }
        });

        assert!(cache.stats().unwrap().files <= 3);
        assert_eq!(fs::read_dir(&cache.tmp_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_survives_reopen() {
        test::setup();
        let dir = test::tempdir();
        let key = CacheKey::from("https://x/y.png");
        {
            let cache =
                DiskCache::new(dir.path(), &disk_config(5), Arc::new(BytesCodec)).unwrap();
            cache.insert(&key, &Bytes::from_static(b"persisted")).unwrap();
        }

        let cache = DiskCache::new(dir.path(), &disk_config(5), Arc::new(BytesCodec)).unwrap();
        assert_eq!(cache.get(&key), Some(Bytes::from_static(b"persisted")));
    }

    #[test]
    fn test_missing_directory() {
        test::setup();
        let dir = test::tempdir();
        let cache_dir = dir.path().join("images");
        let cache = DiskCache::new(&cache_dir, &disk_config(5), Arc::new(BytesCodec)).unwrap();

        fs::remove_dir_all(&cache_dir).unwrap();
        let key = CacheKey::from("a");
        assert_eq!(cache.get(&key), None);
        assert_eq!(cache.stats().unwrap().files, 0);

        // writing recreates the directory on demand
        cache.insert(&key, &Bytes::from_static(b"a")).unwrap();
        assert_eq!(cache.get(&key), Some(Bytes::from_static(b"a")));
    }
}
