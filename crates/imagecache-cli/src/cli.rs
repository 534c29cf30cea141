//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use console::style;
use imagecache::caching::CacheKey;
use imagecache::codec::BytesCodec;
use imagecache::config::Config;
use imagecache::download::HttpFetcher;
use imagecache::metrics;
use imagecache::services::ImageService;

use crate::logging;

/// Image cache commands.
#[derive(Subcommand)]
enum Command {
    /// Fetch images through the cache, downloading them if necessary.
    Fetch {
        /// The URLs of the images.
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Check whether an image is cached, without downloading it.
    Peek {
        /// The URL of the image.
        url: String,
    },

    /// Delete the oldest cache files until the configured limit is met.
    Prune,

    /// Delete all cache files.
    Clear,
}

/// Command line interface parser.
#[derive(Parser)]
#[command(bin_name = "imagecache", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: This is called before the runtime is started, so we are still single-threaded.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure metrics")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("imagecache")
        .build()
        .context("failed to create tokio runtime")?;

    let fetcher = HttpFetcher::from_config(&config).context("failed to create HTTP client")?;
    let service = ImageService::new(&config, fetcher, Arc::new(BytesCodec))
        .context("failed to open the image cache")?;

    match cli.command {
        Command::Fetch { urls } => runtime.block_on(fetch(&service, &urls)),
        Command::Peek { url } => peek(&service, &url),
        Command::Prune => {
            let stats = service.prune().context("failed to prune the image cache")?;
            println!(
                "removed {} files ({} bytes), {} files remain",
                stats.removed_files, stats.removed_bytes, stats.retained_files
            );
            Ok(())
        }
        Command::Clear => {
            service.clear_disk();
            println!("cleared the image cache");
            Ok(())
        }
    }
}

async fn fetch(service: &ImageService<Bytes>, urls: &[String]) -> Result<()> {
    let results = futures::future::join_all(urls.iter().map(|url| service.fetch(url))).await;

    let mut failed = 0;
    for (url, result) in urls.iter().zip(results) {
        match result {
            Ok(bytes) => println!("{} {url} ({} bytes)", style("ok").green(), bytes.len()),
            Err(err) => {
                failed += 1;
                println!("{} {url}: {err}", style("error").red());
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} fetches failed", urls.len());
    }
    Ok(())
}

fn peek(service: &ImageService<Bytes>, url: &str) -> Result<()> {
    let key = CacheKey::for_identifier(url);
    match service.peek(url) {
        Some(bytes) => println!(
            "{} {url} ({} bytes, {})",
            style("cached").green(),
            bytes.len(),
            key.file_name()
        ),
        None => println!("{} {url}", style("absent").yellow()),
    }
    Ok(())
}
