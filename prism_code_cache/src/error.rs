//! Construction errors for the code cache.
//!
//! Only cache creation is fallible in the `Result` sense. Once a cache
//! exists, exhaustion is reported as `None` from the allocating operations
//! and callers fall back to the interpreter.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Reasons a [`CodeCache`](crate::CodeCache) could not be created.
#[derive(Debug, Error)]
pub enum CodeCacheError {
    /// The configuration was rejected before any memory was touched.
    #[error("invalid code cache configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// After rounding to whole pages there was nothing left to allocate from.
    #[error("code cache capacity {requested} is below the minimum of {minimum} bytes")]
    CapacityTooSmall {
        /// Requested capacity in bytes.
        requested: usize,
        /// Smallest usable capacity on this platform.
        minimum: usize,
    },

    /// The address reservation failed.
    #[error("failed to create read write execute cache of {size} bytes: {source}")]
    MapFailed {
        /// Size of the attempted reservation.
        size: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}
