//! Helpers for testing the caches.
//!
//! This module is only compiled for tests.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::extract::Path;
use axum::http::{StatusCode, header};
use axum::routing::get;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

/// The first bytes of a PNG file, served as `/image.png` by the test [`Server`].
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `imagecache` crate and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("imagecache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A local HTTP server for download tests.
///
/// The server is aborted when this is dropped.
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Starts a server with these routes:
    ///
    /// - `/image.png` serves [`PNG_BYTES`].
    /// - `/respond_statuscode/:num` responds with an empty body and the given status.
    /// - `/login_redirect` redirects to `/login` with `302 Found`.
    /// - `/delay/:millis` responds with `OK` after the given delay.
    pub async fn new() -> Self {
        let router = Router::new()
            .route("/image.png", get(|| async { PNG_BYTES }))
            .route(
                "/respond_statuscode/:num",
                get(|Path(num): Path<u16>| async move {
                    StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }),
            )
            .route(
                "/login_redirect",
                get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/login")]) }),
            )
            .route("/login", get(|| async { "<html>please log in</html>" }))
            .route(
                "/delay/:millis",
                get(|Path(millis): Path<u64>| async move {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    "OK"
                }),
            );

        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.socket.port(), path)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
