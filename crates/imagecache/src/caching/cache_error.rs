use std::io;
use std::time::Duration;

use thiserror::Error;

/// An error that happens when fetching a resource.
///
/// Every waiter of a coalesced fetch receives its own clone of the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The resource was not found at the remote location.
    #[error("not found")]
    NotFound,
    /// The resource could not be fetched due to missing permissions.
    ///
    /// The attached string contains the remote server's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The resource could not be fetched due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The resource could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The resource was fetched successfully, but could not be decoded.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The fetch was cancelled before it produced a result.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}

impl FetchError {
    /// A short, stable name for this error kind, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            FetchError::NotFound => "notfound",
            FetchError::PermissionDenied(_) => "permissiondenied",
            FetchError::Timeout(_) => "timeout",
            FetchError::DownloadError(_) => "downloaderror",
            FetchError::Malformed(_) => "malformed",
            FetchError::Cancelled => "cancelled",
            FetchError::InternalError => "internal",
        }
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

impl From<io::Error> for FetchError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<DecodeError> for FetchError {
    fn from(err: DecodeError) -> Self {
        Self::Malformed(err.0)
    }
}

/// The outcome of a fetch, delivered exactly once to every waiter.
pub type FetchResult<V> = Result<V, FetchError>;

/// A value could not be decoded from its byte representation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Writing an entry to the disk cache failed.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Creating, writing or moving the cache file failed.
    #[error("failed to write cache file")]
    Io(#[from] io::Error),
    /// Another writer held the entry's lock for longer than we were willing to wait.
    #[error("cache entry is locked by another writer")]
    Locked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_is_malformed() {
        let err = FetchError::from(DecodeError::new("not a png"));
        assert_eq!(err, FetchError::Malformed("not a png".into()));
        assert_eq!(err.to_string(), "malformed: not a png");
        assert_eq!(err.metrics_tag(), "malformed");
    }

    #[test]
    fn test_io_error_is_internal() {
        let err = FetchError::from(io::Error::other("disk on fire"));
        assert_eq!(err, FetchError::InternalError);
    }
}
