//! The runtime's view of a compilable method.
//!
//! The code cache never owns methods. It holds shared references to them in
//! its catalog and drives their dispatch slot: pointing it at committed code,
//! back at the interpreter bridge during a collection, and at the code again
//! if the method survives.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use crate::profiling::ProfilingRecord;

/// Stable identifier of a method.
pub type MethodId = u64;

/// Shared handle to a method stored in the catalog.
pub type MethodRef = Arc<dyn JitMethod>;

/// Identifier of the class-loading scope that defines a method.
///
/// Discarding a scope removes every method it owns from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

// =============================================================================
// JitMethod
// =============================================================================

/// Hooks the code cache needs on a runtime method.
pub trait JitMethod: Send + Sync + fmt::Debug {
    /// Stable identifier.
    fn id(&self) -> MethodId;

    /// Scope that defines the method.
    fn owner(&self) -> OwnerId;

    /// Current dispatch target.
    fn entry_point(&self) -> usize;

    /// Rewrite the dispatch target.
    fn update_entry_point(&self, entry: usize);

    /// Reset the hotness counter after the method's code is discarded.
    fn clear_counter(&self);

    /// Attached profiling record, if any.
    fn profiling_record(&self) -> Option<NonNull<ProfilingRecord>>;

    /// Attach or detach the profiling record.
    fn set_profiling_record(&self, record: Option<NonNull<ProfilingRecord>>);
}

// =============================================================================
// MethodSlot
// =============================================================================

/// Atomic dispatch slot implementing [`JitMethod`].
///
/// Suitable as the per-method state of an embedding runtime: the interpreter
/// bumps [`increment_counter`](Self::increment_counter) and jumps through
/// [`entry_point`](JitMethod::entry_point).
pub struct MethodSlot {
    id: MethodId,
    owner: OwnerId,
    entry_point: AtomicUsize,
    counter: AtomicU32,
    profiling: AtomicPtr<ProfilingRecord>,
}

impl MethodSlot {
    /// Create a slot that initially dispatches to `interpreter_bridge`.
    pub fn new(id: MethodId, owner: OwnerId, interpreter_bridge: usize) -> Self {
        Self {
            id,
            owner,
            entry_point: AtomicUsize::new(interpreter_bridge),
            counter: AtomicU32::new(0),
            profiling: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Bump the hotness counter and return the new value.
    #[inline]
    pub fn increment_counter(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current hotness counter.
    #[inline]
    pub fn counter(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl JitMethod for MethodSlot {
    #[inline]
    fn id(&self) -> MethodId {
        self.id
    }

    #[inline]
    fn owner(&self) -> OwnerId {
        self.owner
    }

    #[inline]
    fn entry_point(&self) -> usize {
        self.entry_point.load(Ordering::Acquire)
    }

    #[inline]
    fn update_entry_point(&self, entry: usize) {
        self.entry_point.store(entry, Ordering::Release);
    }

    #[inline]
    fn clear_counter(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }

    #[inline]
    fn profiling_record(&self) -> Option<NonNull<ProfilingRecord>> {
        NonNull::new(self.profiling.load(Ordering::Acquire))
    }

    #[inline]
    fn set_profiling_record(&self, record: Option<NonNull<ProfilingRecord>>) {
        let raw = record.map_or(ptr::null_mut(), NonNull::as_ptr);
        self.profiling.store(raw, Ordering::Release);
    }
}

impl fmt::Debug for MethodSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodSlot")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("entry_point", &format_args!("0x{:x}", self.entry_point()))
            .field("counter", &self.counter())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BRIDGE: usize = 0xB000;

    #[test]
    fn test_slot_starts_interpreted() {
        let slot = MethodSlot::new(7, OwnerId(1), BRIDGE);
        assert_eq!(slot.id(), 7);
        assert_eq!(slot.owner(), OwnerId(1));
        assert_eq!(slot.entry_point(), BRIDGE);
        assert!(slot.profiling_record().is_none());
    }

    #[test]
    fn test_counter_and_reset() {
        let slot = MethodSlot::new(1, OwnerId(0), BRIDGE);
        assert_eq!(slot.increment_counter(), 1);
        assert_eq!(slot.increment_counter(), 2);
        slot.clear_counter();
        assert_eq!(slot.counter(), 0);
    }

    #[test]
    fn test_entry_point_update() {
        let slot = MethodSlot::new(1, OwnerId(0), BRIDGE);
        slot.update_entry_point(0x1234_0000);
        assert_eq!(slot.entry_point(), 0x1234_0000);
    }
}
