//! A two-tier cache for remote images.
//!
//! Resources are addressed by an identifier (usually a URL) and served from an in-memory tier,
//! then from a persistent on-disk tier, and finally from the network. Concurrent requests for the
//! same resource share a single network fetch. See the [`caching`] module for how the tiers work
//! and [`services::ImageService`] for the entry point.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod codec;
pub mod config;
pub mod download;
pub mod logging;
pub mod services;
pub mod utils;

#[cfg(test)]
mod test;
