use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Resolves the directory the on-disk cache tier stores its files in.
///
/// The [`DiskCache`](super::DiskCache) never decides on a path scheme itself. The directory does
/// not need to exist yet; it is created when the cache is opened.
pub trait StorageLocation: fmt::Debug + Send + Sync {
    fn resolve(&self) -> io::Result<PathBuf>;
}

/// An explicitly configured directory.
#[derive(Debug, Clone)]
pub struct FixedDirectory(PathBuf);

impl FixedDirectory {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self(path.as_ref().to_owned())
    }
}

impl StorageLocation for FixedDirectory {
    fn resolve(&self) -> io::Result<PathBuf> {
        Ok(self.0.clone())
    }
}

/// A subdirectory of the system temp directory.
///
/// Files here usually survive process restarts, but not necessarily reboots.
#[derive(Debug, Clone)]
pub struct TempDirectory(String);

impl TempDirectory {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl StorageLocation for TempDirectory {
    fn resolve(&self) -> io::Result<PathBuf> {
        Ok(std::env::temp_dir().join(&self.0))
    }
}

/// A subdirectory of the platform's per-user cache directory.
///
/// This is `$XDG_CACHE_HOME` (or `~/.cache`) on Linux and `~/Library/Caches` on macOS.
#[derive(Debug, Clone)]
pub struct UserCacheDirectory(String);

impl UserCacheDirectory {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl StorageLocation for UserCacheDirectory {
    fn resolve(&self) -> io::Result<PathBuf> {
        let base = dirs::cache_dir().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                "could not determine the user cache directory",
            )
        })?;
        Ok(base.join(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_directory() {
        let location = TempDirectory::new("imagecache-test");
        let path = location.resolve().unwrap();
        assert!(path.starts_with(std::env::temp_dir()));
        assert!(path.ends_with("imagecache-test"));
    }

    #[test]
    fn test_fixed_directory() {
        let location = FixedDirectory::new("/srv/images");
        assert_eq!(location.resolve().unwrap(), PathBuf::from("/srv/images"));
    }
}
