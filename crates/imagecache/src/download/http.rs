//! Support to download from HTTP sources.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use reqwest::{Client, StatusCode, Url};

use super::Fetcher;
use crate::caching::FetchError;
use crate::config::Config;
use crate::utils::http::{DownloadTimeouts, create_client};

/// Fetcher implementation for `http` and `https` URLs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    timeouts: DownloadTimeouts,
}

impl HttpFetcher {
    pub fn new(client: Client, timeouts: DownloadTimeouts) -> Self {
        Self { client, timeouts }
    }

    /// Creates a fetcher with its own client, using the timeouts from `config`.
    pub fn from_config(config: &Config) -> reqwest::Result<Arc<Self>> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = create_client(&timeouts)?;
        Ok(Arc::new(Self::new(client, timeouts)))
    }

    /// Downloads the resource at `url`.
    pub async fn download(&self, url: &str) -> Result<Bytes, FetchError> {
        let url = Url::parse(url).map_err(|_| FetchError::NotFound)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::NotFound);
        }

        tracing::debug!("Fetching image from `{}`", url);

        let request = self.client.get(url.clone()).send();
        let response = tokio::time::timeout(self.timeouts.head, request)
            .await
            .map_err(|_| FetchError::Timeout(self.timeouts.head))?
            .map_err(|err| self.map_error(err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(&url, status));
        }

        tracing::trace!("Success hitting `{url}`");
        let body = response.bytes();
        let bytes = tokio::time::timeout(self.timeouts.max_download, body)
            .await
            .map_err(|_| FetchError::Timeout(self.timeouts.max_download))?
            .map_err(|err| self.map_error(err))?;

        metric!(time_raw("download.size") = bytes.len() as u64);
        Ok(bytes)
    }

    fn map_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            self.timeout_error(err.is_connect())
        } else {
            FetchError::from(err)
        }
    }

    /// The timeout reqwest enforced: the connect timeout while connecting, the overall one after.
    fn timeout_error(&self, connecting: bool) -> FetchError {
        if connecting {
            FetchError::Timeout(self.timeouts.connect)
        } else {
            FetchError::Timeout(self.timeouts.max_download)
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, identifier: &str) -> BoxFuture<'static, Result<Bytes, FetchError>> {
        let this = self.clone();
        let identifier = identifier.to_owned();
        async move {
            let result = this.download(&identifier).await;
            if let Err(err) = &result {
                tracing::debug!(
                    error = err as &dyn std::error::Error,
                    url = %identifier,
                    "failed to download file"
                );
                metric!(counter("download.failed") += 1, "reason" => err.metrics_tag());
            }
            result
        }
        .boxed()
    }
}

/// Converts an unsuccessful status code to an error.
///
/// This works for any HTTP server, but does not consider API specific responses.
fn status_error(url: &Url, status: StatusCode) -> FetchError {
    debug_assert!(!status.is_success());

    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to download `{url}`: {status}");
        FetchError::PermissionDenied(status.to_string())
    } else if status.is_client_error() {
        // If it's a client error, chances are it's a 404.
        tracing::debug!("Unexpected client error status code from `{url}`: {status}");
        FetchError::NotFound
    } else if status == StatusCode::FOUND {
        tracing::debug!("Potential login page detected when downloading from `{url}`: {status}");
        FetchError::PermissionDenied("Potential login page detected".to_string())
    } else {
        tracing::debug!("Unexpected status code from `{url}`: {status}");
        FetchError::DownloadError(status.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test;

    fn fetcher() -> HttpFetcher {
        let timeouts = DownloadTimeouts {
            head: Duration::from_millis(500),
            ..Default::default()
        };
        HttpFetcher::new(create_client(&timeouts).unwrap(), timeouts)
    }

    #[tokio::test]
    async fn test_download() {
        test::setup();
        let server = test::Server::new().await;

        let bytes = fetcher().fetch(&server.url("/image.png")).await.unwrap();
        assert_eq!(&bytes[..], test::PNG_BYTES);
    }

    #[tokio::test]
    async fn test_download_missing() {
        test::setup();
        let server = test::Server::new().await;

        let result = fetcher().fetch(&server.url("/i-do-not-exist.png")).await;
        assert_eq!(result, Err(FetchError::NotFound));
    }

    #[tokio::test]
    async fn test_download_forbidden() {
        test::setup();
        let server = test::Server::new().await;

        let result = fetcher().fetch(&server.url("/respond_statuscode/403")).await;
        assert_eq!(
            result,
            Err(FetchError::PermissionDenied("403 Forbidden".into()))
        );
    }

    #[tokio::test]
    async fn test_download_server_error() {
        test::setup();
        let server = test::Server::new().await;

        let result = fetcher().fetch(&server.url("/respond_statuscode/500")).await;
        assert_eq!(
            result,
            Err(FetchError::DownloadError(
                "500 Internal Server Error".into()
            ))
        );
    }

    #[tokio::test]
    async fn test_download_login_redirect() {
        test::setup();
        let server = test::Server::new().await;

        let result = fetcher().fetch(&server.url("/login_redirect")).await;
        assert_eq!(
            result,
            Err(FetchError::PermissionDenied(
                "Potential login page detected".into()
            ))
        );
    }

    #[tokio::test]
    async fn test_download_head_timeout() {
        test::setup();
        let server = test::Server::new().await;

        let result = fetcher().fetch(&server.url("/delay/5000")).await;
        assert_eq!(result, Err(FetchError::Timeout(Duration::from_millis(500))));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        test::setup();

        let result = fetcher().fetch("not a url").await;
        assert_eq!(result, Err(FetchError::NotFound));

        let result = fetcher().fetch("ftp://example.com/image.png").await;
        assert_eq!(result, Err(FetchError::NotFound));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        test::setup();

        // nothing listens on port 1 on the loopback interface
        let result = fetcher().fetch("http://127.0.0.1:1/image.png").await;
        assert!(matches!(result, Err(FetchError::DownloadError(_))));
    }

    #[test]
    fn test_timeout_reports_the_expired_limit() {
        let timeouts = DownloadTimeouts {
            connect: Duration::from_millis(250),
            max_download: Duration::from_secs(60),
            ..Default::default()
        };
        let fetcher = HttpFetcher::new(Client::new(), timeouts);

        assert_eq!(
            fetcher.timeout_error(true),
            FetchError::Timeout(Duration::from_millis(250))
        );
        assert_eq!(
            fetcher.timeout_error(false),
            FetchError::Timeout(Duration::from_secs(60))
        );
    }
}
