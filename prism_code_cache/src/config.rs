//! Code cache configuration parameters.
//!
//! Capacities are resolved once at startup and handed to
//! [`CodeCache::create`](crate::CodeCache::create). Defaults match a typical
//! interactive workload: a small initial footprint that grows on demand.

use thiserror::Error;

/// One kibibyte.
pub const KB: usize = 1024;
/// One mebibyte.
pub const MB: usize = 1024 * KB;
/// One gibibyte.
pub const GB: usize = 1024 * MB;

/// Hard upper bound on `max_capacity`.
///
/// Method headers store 32-bit offsets from code to the auxiliary tables in
/// the data half of the reservation, so the whole reservation must stay far
/// below 4GB.
pub const MAX_CODE_CACHE_CAPACITY: usize = GB;

/// Below this capacity growth doubles; above it growth is linear.
pub const GROWTH_DOUBLING_LIMIT: usize = MB;

/// Linear growth increment once the capacity reaches [`GROWTH_DOUBLING_LIMIT`].
pub const GROWTH_STEP: usize = MB;

/// Environment variable overriding the initial capacity.
pub const ENV_INITIAL_CAPACITY: &str = "PRISM_JIT_CODE_CACHE_INITIAL_CAPACITY";

/// Environment variable overriding the maximum capacity.
pub const ENV_MAX_CAPACITY: &str = "PRISM_JIT_CODE_CACHE_MAX_CAPACITY";

// =============================================================================
// CodeCacheConfig
// =============================================================================

/// Configuration for the JIT code cache.
///
/// # Example
///
/// ```ignore
/// use prism_code_cache::CodeCacheConfig;
///
/// let config = CodeCacheConfig {
///     initial_capacity: 256 * 1024,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeCacheConfig {
    /// Capacity committed to the allocators at startup, split evenly
    /// between the code and data halves.
    ///
    /// Default: 64KB
    pub initial_capacity: usize,

    /// Size of the address reservation. The cache never grows past this.
    ///
    /// Default: 64MB
    pub max_capacity: usize,
}

impl Default for CodeCacheConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 64 * KB,
            max_capacity: 64 * MB,
        }
    }
}

impl CodeCacheConfig {
    /// Fixed 64KB cache with no room to grow.
    pub fn for_testing() -> Self {
        Self {
            initial_capacity: 64 * KB,
            max_capacity: 64 * KB,
        }
    }

    /// Configuration for memory-constrained hosts.
    pub fn low_memory() -> Self {
        Self {
            initial_capacity: 32 * KB,
            max_capacity: 4 * MB,
        }
    }

    /// Apply `PRISM_JIT_CODE_CACHE_*` environment overrides to the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides resolved through `lookup`.
    ///
    /// Unset keys keep the current value.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_INITIAL_CAPACITY) {
            self.initial_capacity = parse_size(ENV_INITIAL_CAPACITY, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_CAPACITY) {
            self.max_capacity = parse_size(ENV_MAX_CAPACITY, &raw)?;
        }
        Ok(self)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_capacity > MAX_CODE_CACHE_CAPACITY {
            return Err(ConfigError::MaxCapacityTooLarge(self.max_capacity));
        }
        if self.initial_capacity > self.max_capacity {
            return Err(ConfigError::InitialExceedsMax {
                initial: self.initial_capacity,
                max: self.max_capacity,
            });
        }
        if self.initial_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `max_capacity` exceeds the relative-offset limit.
    #[error(
        "maximum code cache capacity is limited to {limit} bytes, {0} is too big",
        limit = MAX_CODE_CACHE_CAPACITY
    )]
    MaxCapacityTooLarge(usize),
    /// `initial_capacity` is larger than `max_capacity`.
    #[error("initial capacity {initial} exceeds maximum capacity {max}")]
    InitialExceedsMax {
        /// Requested initial capacity.
        initial: usize,
        /// Requested maximum capacity.
        max: usize,
    },
    /// The cache would start with no usable space.
    #[error("initial code cache capacity must be non-zero")]
    ZeroCapacity,
    /// An override could not be parsed as a size.
    #[error("invalid size {value:?} for {key}")]
    InvalidSize {
        /// Environment key that carried the value.
        key: &'static str,
        /// Raw value.
        value: String,
    },
}

/// Parse `4096`, `64K`, `16M` or `1G` (case-insensitive, optional `B`).
fn parse_size(key: &'static str, raw: &str) -> Result<usize, ConfigError> {
    let invalid = || ConfigError::InvalidSize {
        key,
        value: raw.to_string(),
    };

    let trimmed = raw.trim();
    let upper = trimmed.to_ascii_uppercase();
    let digits = upper.strip_suffix('B').unwrap_or(&upper);
    let (digits, scale) = match digits.chars().last() {
        Some('K') => (&digits[..digits.len() - 1], KB),
        Some('M') => (&digits[..digits.len() - 1], MB),
        Some('G') => (&digits[..digits.len() - 1], GB),
        _ => (digits, 1),
    };

    let value: usize = digits.trim().parse().map_err(|_| invalid())?;
    value.checked_mul(scale).ok_or_else(invalid)
}
