//! Code cache statistics and the human-readable dump.
//!
//! # Metrics
//!
//! - Commits and failed commit attempts
//! - Data reservations and failures
//! - Collections: sweeping cycles, growth-only cycles, coalesced requests
//! - Entries freed by sweeping
//! - Time spent collecting

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// =============================================================================
// StatsCounters
// =============================================================================

/// Live counters owned by the cache.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    commits: AtomicU64,
    commit_failures: AtomicU64,
    data_reservations: AtomicU64,
    data_failures: AtomicU64,
    collections: AtomicU64,
    growths: AtomicU64,
    coalesced: AtomicU64,
    entries_freed: AtomicU64,
    collection_time_ns: AtomicU64,
    max_collection_time_ns: AtomicU64,
}

impl StatsCounters {
    #[inline]
    pub(crate) fn record_commit(&self, success: bool) {
        let counter = if success { &self.commits } else { &self.commit_failures };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_data_reservation(&self, success: bool) {
        let counter = if success {
            &self.data_reservations
        } else {
            &self.data_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_growth(&self) {
        self.growths.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_collection(&self, duration: Duration, freed: usize) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.entries_freed.fetch_add(freed as u64, Ordering::Relaxed);
        let nanos = duration.as_nanos() as u64;
        self.collection_time_ns.fetch_add(nanos, Ordering::Relaxed);

        let mut current = self.max_collection_time_ns.load(Ordering::Relaxed);
        while nanos > current {
            match self.max_collection_time_ns.compare_exchange_weak(
                current,
                nanos,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn snapshot(&self) -> CodeCacheStats {
        CodeCacheStats {
            commits: self.commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            data_reservations: self.data_reservations.load(Ordering::Relaxed),
            data_failures: self.data_failures.load(Ordering::Relaxed),
            collections: self.collections.load(Ordering::Relaxed),
            growths: self.growths.load(Ordering::Relaxed),
            coalesced_collections: self.coalesced.load(Ordering::Relaxed),
            entries_freed: self.entries_freed.load(Ordering::Relaxed),
            total_collection_time: Duration::from_nanos(
                self.collection_time_ns.load(Ordering::Relaxed),
            ),
            max_collection_time: Duration::from_nanos(
                self.max_collection_time_ns.load(Ordering::Relaxed),
            ),
        }
    }
}

// =============================================================================
// CodeCacheStats
// =============================================================================

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeCacheStats {
    /// Successful commits.
    pub commits: u64,
    /// Commit attempts that found no space or could never fit, including
    /// ones that later succeeded on retry.
    pub commit_failures: u64,
    /// Successful data reservations (tables and profiling records).
    pub data_reservations: u64,
    /// Data reservations that found no space or could never fit.
    pub data_failures: u64,
    /// Collections that swept.
    pub collections: u64,
    /// Collections that grew capacity instead of sweeping.
    pub growths: u64,
    /// Collection requests that waited on one already in progress.
    pub coalesced_collections: u64,
    /// Compiled entries freed by sweeping.
    pub entries_freed: u64,
    /// Time spent in sweeping collections.
    pub total_collection_time: Duration,
    /// Longest sweeping collection.
    pub max_collection_time: Duration,
}

impl CodeCacheStats {
    /// Mean duration of a sweeping collection.
    pub fn average_collection_time(&self) -> Duration {
        if self.collections == 0 {
            Duration::ZERO
        } else {
            let total = self.total_collection_time.as_nanos() / u128::from(self.collections);
            Duration::from_nanos(u64::try_from(total).unwrap_or(u64::MAX))
        }
    }
}

// =============================================================================
// CodeCacheInfo
// =============================================================================

/// Summary printed by diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeCacheInfo {
    /// Bytes held by live compiled entries.
    pub code_cache_size: usize,
    /// Bytes held by live data allocations.
    pub data_cache_size: usize,
    /// Entries in the catalog.
    pub compiled_code: usize,
    /// Current capacity of both halves together.
    pub current_capacity: usize,
    /// Hard ceiling.
    pub max_capacity: usize,
    /// Sweeping collections so far.
    pub collections: u64,
}

impl fmt::Display for CodeCacheInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Code cache size={}", PrettySize(self.code_cache_size))?;
        writeln!(f, "Data cache size={}", PrettySize(self.data_cache_size))?;
        writeln!(f, "Number of compiled code={}", self.compiled_code)?;
        writeln!(
            f,
            "Capacity={} of max {}",
            PrettySize(self.current_capacity),
            PrettySize(self.max_capacity)
        )?;
        write!(f, "Total number of JIT code cache collections={}", self.collections)
    }
}

// =============================================================================
// PrettySize
// =============================================================================

/// Byte count rendered with the largest unit that divides it evenly.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PrettySize(pub usize);

impl fmt::Display for PrettySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(usize, &str); 3] = [(1 << 30, "GB"), (1 << 20, "MB"), (1 << 10, "KB")];
        let bytes = self.0;
        for (unit, suffix) in UNITS {
            if bytes >= unit && bytes % unit == 0 {
                return write!(f, "{}{}", bytes / unit, suffix);
            }
        }
        if bytes >= 1 << 10 {
            write!(f, "{}KB", bytes >> 10)
        } else {
            write!(f, "{bytes}B")
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
