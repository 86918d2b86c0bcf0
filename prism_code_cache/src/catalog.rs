//! Ordered index of committed code.
//!
//! Maps each entry's code start to the method that owns it. Lookups for an
//! arbitrary pc find the greatest start not above it and then check the
//! recorded length, the same shape as a stack-map registry keyed by return
//! address.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::method::{MethodId, MethodRef, OwnerId};

/// One committed method.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// Owning method.
    pub method: MethodRef,
    /// Native instruction bytes.
    pub code_size: usize,
}

impl CatalogEntry {
    /// Check whether `pc` falls in `[code, code + code_size]`.
    #[inline]
    fn covers(&self, code: usize, pc: usize) -> bool {
        pc >= code && pc <= code + self.code_size
    }
}

// =============================================================================
// CodeCatalog
// =============================================================================

/// Committed entries keyed by code start.
#[derive(Debug, Default)]
pub struct CodeCatalog {
    entries: BTreeMap<usize, CatalogEntry>,
}

impl CodeCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a committed entry.
    pub fn insert(&mut self, code: usize, method: MethodRef, code_size: usize) {
        let previous = self.entries.insert(code, CatalogEntry { method, code_size });
        debug_assert!(previous.is_none(), "code 0x{code:x} committed twice");
    }

    /// Entry whose code contains `pc`, as `(code start, entry)`.
    pub fn lookup(&self, pc: usize) -> Option<(usize, &CatalogEntry)> {
        let (&code, entry) = self.entries.range(..=pc).next_back()?;
        entry.covers(code, pc).then_some((code, entry))
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending code order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &CatalogEntry)> {
        self.entries.iter().map(|(&code, entry)| (code, entry))
    }

    /// Remove and return every entry matching `predicate(code, entry)`.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Vec<(usize, CatalogEntry)>
    where
        F: FnMut(usize, &CatalogEntry) -> bool,
    {
        let doomed: Vec<usize> = self
            .entries
            .iter()
            .filter(|(code, entry)| predicate(**code, entry))
            .map(|(&code, _)| code)
            .collect();
        doomed
            .into_iter()
            .filter_map(|code| self.entries.remove(&code).map(|entry| (code, entry)))
            .collect()
    }

    /// Check whether some entry belongs to `method`.
    pub fn contains_method(&self, method: MethodId) -> bool {
        self.entries.values().any(|entry| entry.method.id() == method)
    }

    /// Methods with code in the catalog that belong to `owner`.
    pub fn methods_owned_by(&self, owner: OwnerId) -> Vec<MethodRef> {
        self.entries
            .values()
            .filter(|entry| entry.method.owner() == owner)
            .map(|entry| Arc::clone(&entry.method))
            .collect()
    }

    /// Freeze the current code ranges for lock-free lookups.
    pub fn snapshot(&self) -> CatalogSnapshot {
        CatalogSnapshot {
            ranges: self
                .entries
                .iter()
                .map(|(&code, entry)| (code, entry.code_size))
                .collect(),
        }
    }
}

// =============================================================================
// CatalogSnapshot
// =============================================================================

/// Immutable copy of the catalog's code ranges.
///
/// Marking checkpoints resolve return addresses against it on mutator
/// threads without touching the cache lock.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    /// `(code start, code size)`, ascending.
    ranges: Box<[(usize, usize)]>,
}

impl CatalogSnapshot {
    /// Code start of the range containing `pc`.
    pub fn lookup(&self, pc: usize) -> Option<usize> {
        let idx = self.ranges.partition_point(|&(code, _)| code <= pc);
        let (code, size) = *self.ranges.get(idx.checked_sub(1)?)?;
        (pc <= code + size).then_some(code)
    }

    /// Number of ranges.
    #[inline]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Check if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
