use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tempfile::NamedTempFile;

/// The suffix of per-entry lock files.
pub(super) const LOCK_SUFFIX: &str = ".lock";

/// How long a writer waits for another writer to release an entry.
const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

const LOCK_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(2);
const LOCK_RETRY_MAX_DELAY: Duration = Duration::from_millis(100);

/// The `cleanup` process could potentially remove the directories we are operating in,
/// so we retry the fs operations this many times.
const MAX_RETRIES: usize = 2;

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

/// Creates a new temporary file in `tmp_dir`.
///
/// Writing into a sibling directory and then moving the file into place guarantees that readers
/// never observe a partially written cache file.
pub(super) fn tempfile_in(tmp_dir: &Path) -> io::Result<NamedTempFile> {
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(tmp_dir) {
            sentry::with_scope(
                |scope| scope.set_extra("path", tmp_dir.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match tempfile::Builder::new().prefix("tmp").tempfile_in(tmp_dir) {
            Ok(temp_file) => return Ok(temp_file),
            Err(e) => {
                sentry::with_scope(
                    |scope| scope.set_extra("path", tmp_dir.display().to_string().into()),
                    || tracing::error!("Failed to create cache file: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }
        }
    }
}

/// Atomically moves `temp_file` to `cache_path`, replacing whatever was there before.
pub(super) fn persist_tempfile(
    mut temp_file: NamedTempFile,
    cache_path: &Path,
) -> io::Result<fs::File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", cache_path.display().to_string().into()),
                    || tracing::error!("Failed to create cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    };
    Ok(file)
}

/// Returns the path of the lock file guarding `data_path`.
pub(super) fn lock_path_for(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_owned();
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

/// An exclusive lock on a single cache entry, shared between processes.
///
/// The lock is a sibling file created with `O_EXCL`. It is removed again when this guard is
/// dropped. Locks left behind by a crashed process are broken once they are older than the
/// configured staleness threshold.
#[derive(Debug)]
pub(super) struct EntryLock {
    path: PathBuf,
}

impl EntryLock {
    /// Acquires the lock for `data_path`, waiting for a concurrent holder to release it.
    ///
    /// Returns `Ok(None)` if the lock is still held after waiting.
    pub fn acquire(data_path: &Path, stale_after: Duration) -> io::Result<Option<Self>> {
        Self::acquire_within(data_path, stale_after, LOCK_WAIT_TIMEOUT)
    }

    /// Acquires the lock for `data_path` only if nobody else holds it right now.
    pub fn try_acquire(data_path: &Path, stale_after: Duration) -> io::Result<Option<Self>> {
        Self::acquire_within(data_path, stale_after, Duration::ZERO)
    }

    fn acquire_within(
        data_path: &Path,
        stale_after: Duration,
        max_wait: Duration,
    ) -> io::Result<Option<Self>> {
        let lock_path = lock_path_for(data_path);
        let deadline = Instant::now() + max_wait;
        let mut delay = LOCK_RETRY_INITIAL_DELAY;
        let mut retries = 0;

        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    // the pid is informational only
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Some(EntryLock { path: lock_path }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if break_stale_lock(&lock_path, stale_after)? {
                        tracing::debug!("Broke stale cache lock `{}`", lock_path.display());
                        continue;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(delay.min(deadline - now));
                    delay = (delay * 2).min(LOCK_RETRY_MAX_DELAY);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound && retries < MAX_RETRIES => {
                    // The cache directory was removed underneath us.
                    retries += 1;
                    if let Some(parent) = lock_path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %self.path.display(),
                    "Failed to release cache lock",
                );
            }
        }
    }
}

/// Checks whether some process currently holds the lock for `data_path`.
pub(super) fn is_locked(data_path: &Path, stale_after: Duration) -> bool {
    let lock_path = lock_path_for(data_path);
    lock_path.exists() && !is_stale(&lock_path, stale_after)
}

fn is_stale(lock_path: &Path, stale_after: Duration) -> bool {
    let Ok(metadata) = fs::metadata(lock_path) else {
        return false;
    };
    metadata
        .modified()
        .ok()
        .and_then(|time| SystemTime::now().duration_since(time).ok())
        .is_some_and(|age| age > stale_after)
}

/// Removes the lock file at `lock_path` if it is stale.
///
/// Contenders serialize through `<lock>.lock`, and staleness is checked again while holding it.
/// Without that, two contenders could both find the lock stale, and the second would delete the
/// fresh lock the first one created in the meantime.
fn break_stale_lock(lock_path: &Path, stale_after: Duration) -> io::Result<bool> {
    if !is_stale(lock_path, stale_after) {
        return Ok(false);
    }

    let breaker_path = lock_path_for(lock_path);
    let _breaker = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&breaker_path)
    {
        Ok(_) => EntryLock { path: breaker_path },
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            // somebody else is breaking the lock, unless they crashed while doing so
            if is_stale(&breaker_path, stale_after) {
                clear_lock_file(&breaker_path);
            }
            return Ok(false);
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    Ok(is_stale(lock_path, stale_after) && clear_lock_file(lock_path))
}

fn clear_lock_file(lock_path: &Path) -> bool {
    match fs::remove_file(lock_path) {
        Ok(()) => true,
        Err(err) => err.kind() == io::ErrorKind::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use filetime::FileTime;

    use super::*;
    use crate::test;

    #[test]
    fn test_lock_is_exclusive() {
        test::setup();
        let dir = test::tempdir();
        let data_path = dir.path().join("entry");
        let stale_after = Duration::from_secs(30);

        let lock = EntryLock::try_acquire(&data_path, stale_after)
            .unwrap()
            .expect("the first lock succeeds");
        assert!(is_locked(&data_path, stale_after));
        assert!(lock_path_for(&data_path).exists());

        let second = EntryLock::try_acquire(&data_path, stale_after).unwrap();
        assert!(second.is_none());

        drop(lock);
        assert!(!is_locked(&data_path, stale_after));
        assert!(!lock_path_for(&data_path).exists());

        let third = EntryLock::try_acquire(&data_path, stale_after).unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn test_stale_lock_is_broken() {
        test::setup();
        let dir = test::tempdir();
        let data_path = dir.path().join("entry");
        let lock_path = lock_path_for(&data_path);

        fs::write(&lock_path, "12345").unwrap();
        let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
        filetime::set_file_mtime(&lock_path, FileTime::from_system_time(an_hour_ago)).unwrap();

        let stale_after = Duration::from_secs(30);
        assert!(!is_locked(&data_path, stale_after));

        let lock = EntryLock::try_acquire(&data_path, stale_after).unwrap();
        assert!(lock.is_some());
    }

    #[test]
    fn test_fresh_lock_is_not_broken() {
        test::setup();
        let dir = test::tempdir();
        let data_path = dir.path().join("entry");
        let lock_path = lock_path_for(&data_path);
        let stale_after = Duration::from_secs(30);

        // a contender that found the lock stale earlier must not remove its replacement
        let _fresh = EntryLock::try_acquire(&data_path, stale_after)
            .unwrap()
            .unwrap();
        assert!(!break_stale_lock(&lock_path, stale_after).unwrap());
        assert!(lock_path.exists());
    }

    #[test]
    fn test_breaking_is_exclusive() {
        test::setup();
        let dir = test::tempdir();
        let data_path = dir.path().join("entry");
        let lock_path = lock_path_for(&data_path);
        let breaker_path = lock_path_for(&lock_path);
        let stale_after = Duration::from_secs(30);

        fs::write(&lock_path, "12345").unwrap();
        let an_hour_ago = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(3600));
        filetime::set_file_mtime(&lock_path, an_hour_ago).unwrap();

        // another contender is currently breaking the lock
        fs::write(&breaker_path, "").unwrap();
        assert!(!break_stale_lock(&lock_path, stale_after).unwrap());
        assert!(lock_path.exists());
        assert!(breaker_path.exists());

        // a breaker that crashed is cleaned up, and the next attempt succeeds
        filetime::set_file_mtime(&breaker_path, an_hour_ago).unwrap();
        assert!(!break_stale_lock(&lock_path, stale_after).unwrap());
        assert!(!breaker_path.exists());
        assert!(break_stale_lock(&lock_path, stale_after).unwrap());
        assert!(!lock_path.exists());
        assert!(!breaker_path.exists());
    }

    #[test]
    fn test_persist_replaces_existing_file() {
        test::setup();
        let dir = test::tempdir();
        let tmp_dir = dir.path().join("tmp");
        let cache_path = dir.path().join("nested").join("entry");

        let mut first = tempfile_in(&tmp_dir).unwrap();
        first.write_all(b"first version").unwrap();
        persist_tempfile(first, &cache_path).unwrap();

        let mut second = tempfile_in(&tmp_dir).unwrap();
        second.write_all(b"second").unwrap();
        persist_tempfile(second, &cache_path).unwrap();

        assert_eq!(fs::read(&cache_path).unwrap(), b"second");
        assert_eq!(fs::read_dir(&tmp_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_catch_not_found() {
        let dir = test::tempdir();
        let missing = dir.path().join("missing");

        let result = catch_not_found(|| fs::read(&missing)).unwrap();
        assert!(result.is_none());

        fs::write(&missing, b"hi").unwrap();
        let result = catch_not_found(|| fs::read(&missing)).unwrap();
        assert_eq!(result.as_deref(), Some(&b"hi"[..]));
    }
}
