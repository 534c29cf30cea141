//! Downloading of resources from their remote locations.
//!
//! The caches only depend on the [`Fetcher`] trait. [`HttpFetcher`] is the implementation used
//! for `http` and `https` URLs.

use std::error::Error;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::caching::FetchError;

mod http;

pub use self::http::HttpFetcher;
pub use crate::utils::http::USER_AGENT;

/// Downloads the raw bytes of a resource.
///
/// The returned future is started by spawning it and cancelled by dropping it. It resolves exactly
/// once, either with the complete contents or with the reason the download failed. Implementations
/// should not retry internally for longer than their configured timeouts.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch(&self, identifier: &str) -> BoxFuture<'static, Result<Bytes, FetchError>>;
}

impl FetchError {
    /// Creates a [`FetchError::DownloadError`] from the innermost source of `error`.
    pub fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::DownloadError(error_string)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}
