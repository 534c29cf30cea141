//! Command line access to the image cache.
//!
//! Loads the same configuration file an application would use and fetches, inspects or cleans up
//! the cache it describes.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
