use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// The key under which a resource is cached in every tier.
///
/// Keys are derived from the full resource identifier by hashing it, so two equal identifiers
/// always produce equal keys, across process restarts as well. Equality and hashing only consider
/// the digest; the identifier is kept around for fetching and diagnostics.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    identifier: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates the [`CacheKey`] for the given resource identifier.
    pub fn for_identifier(identifier: &str) -> Self {
        let hash: [u8; 32] = Sha256::digest(identifier.as_bytes()).into();

        CacheKey {
            identifier: identifier.into(),
            hash,
        }
    }

    /// Returns the identifier this key was derived from.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Returns the file name for this key inside a cache directory.
    ///
    /// The file name is the full sha-256 hash, hex-formatted. It never contains path separators
    /// or dots, so it is safe on every file system we support.
    pub fn file_name(&self) -> String {
        let mut name = String::with_capacity(64);
        for b in &self.hash {
            // writing into a `String` can not fail
            let _ = write!(name, "{b:02x}");
        }
        name
    }
}

impl From<&str> for CacheKey {
    fn from(identifier: &str) -> Self {
        Self::for_identifier(identifier)
    }
}
