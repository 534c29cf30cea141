//! Services that put the caches to work.
//!
//! [`ImageService`] is the facade applications use. It relies on the [`FetchCoordinator`] to
//! make sure every resource is downloaded at most once at a time.

mod coordinator;
mod image;

pub use coordinator::{FetchCoordinator, FetchWaiter, WaiterToken};
pub use image::{ImageRequest, ImageService};
