use std::time::Duration;

use reqwest::{StatusCode, redirect};

use crate::config::Config;

/// The user agent sent with every download.
pub const USER_AGENT: &str = concat!("imagecache/", env!("CARGO_PKG_VERSION"));

/// Various timeouts for downloads.
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for receiving the first headers.
    pub head: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            head: config.head_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(500),
            head: Duration::from_secs(5),
            max_download: Duration::from_secs(60),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// The client does not follow temporary redirects (`302 Found`). Image hosts answer with those to
/// send unauthenticated clients to a login page, which we must never cache as an image.
pub fn create_client(timeouts: &DownloadTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(USER_AGENT)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::custom(|attempt: redirect::Attempt| {
            if attempt.status() == StatusCode::FOUND {
                return attempt.stop();
            }
            redirect::Policy::default().redirect(attempt)
        }))
        .build()
}
