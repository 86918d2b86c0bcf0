//! Capacity management and stack-scanning collection of compiled code.
//!
//! A cycle moves through
//!
//! ```text
//! Idle -> Quiescing -> Marking -> Sweeping -> Idle
//!             |
//!             +-- (grow instead) --> Idle
//! ```
//!
//! - **Quiescing**: raise the collection flag so new allocations block on
//!   the condition variable, then choose between growing and sweeping.
//! - **Marking**: point every cataloged method back at the interpreter
//!   bridge, detach profiling records, and have every thread mark the code
//!   found on its stack via a checkpoint.
//! - **Sweeping**: under the lock and a code write scope, restore marked
//!   methods and free everything else.
//!
//! Growth and sweeping alternate under sustained pressure, starting with
//! growth on a fresh cache.

use std::mem;
use std::sync::Arc;
use std::time::Instant;

use crate::bitmap::LivenessBitmap;
use crate::cache::{CacheState, CodeCache};
use crate::catalog::CatalogSnapshot;
use crate::checkpoint::{Barrier, Checkpoint, ScopedThreadSuspension, StackWalker};
use crate::config::{GROWTH_DOUBLING_LIMIT, GROWTH_STEP};
use crate::header::allocation_from_code;
use crate::stats::PrettySize;

// =============================================================================
// CollectorPhase
// =============================================================================

/// Phase of the collection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorPhase {
    /// No cycle running.
    Idle,
    /// Allocation is blocked; deciding between growth and sweeping.
    Quiescing,
    /// Threads are marking code found on their stacks.
    Marking,
    /// Unmarked code is being freed.
    Sweeping,
}

/// What a call to [`CodeCache::collect`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOutcome {
    /// Capacity was raised; nothing was freed.
    Grew {
        /// Capacity after growing.
        capacity: usize,
    },
    /// Unreachable code was freed.
    Swept {
        /// Entries freed.
        freed: usize,
        /// Entries found on a stack and kept.
        kept: usize,
    },
    /// Another thread's cycle was running; this call waited for it.
    Coalesced,
}

// =============================================================================
// MarkCodeCheckpoint
// =============================================================================

/// Marks every committed entry a thread's stack returns into.
struct MarkCodeCheckpoint {
    bitmap: Arc<LivenessBitmap>,
    snapshot: CatalogSnapshot,
    barrier: Arc<Barrier>,
}

impl Checkpoint for MarkCodeCheckpoint {
    fn run(&self, stack: &dyn StackWalker) {
        stack.walk_stack(&mut |pc| {
            if let Some(code) = self.snapshot.lookup(pc) {
                self.bitmap.atomic_test_and_set(allocation_from_code(code));
            }
        });
        self.barrier.pass();
    }
}

// =============================================================================
// Collection
// =============================================================================

impl CodeCache {
    /// Run one collection cycle.
    ///
    /// If a cycle is already running, waits for it instead of starting another.
    pub fn collect(&self) -> CollectionOutcome {
        let start = Instant::now();

        let bitmap = {
            let _suspended = ScopedThreadSuspension::new(&*self.threads);
            let mut state = self.state.lock();
            if self.wait_for_collection(&mut state) {
                self.stats.record_coalesced();
                return CollectionOutcome::Coalesced;
            }
            state.collection_in_progress = true;
            state.phase = CollectorPhase::Quiescing;

            if !state.grew_last_cycle && self.increase_capacity(&mut state) {
                state.grew_last_cycle = true;
                let capacity = state.current_capacity;
                self.notify_collection_done(&mut state);
                self.stats.record_growth();
                return CollectionOutcome::Grew { capacity };
            }

            let bitmap = Arc::new(LivenessBitmap::new(
                self.region.code_begin() as usize,
                state.code_allocator.footprint_limit(),
            ));
            state.live_bitmap = Some(Arc::clone(&bitmap));
            bitmap
        };

        log::info!(
            "Clearing code cache, code={}, data={}",
            PrettySize(self.code_cache_size()),
            PrettySize(self.data_cache_size()),
        );

        let snapshot = {
            let mut state = self.state.lock();
            state.phase = CollectorPhase::Marking;
            for (_, entry) in state.catalog.iter() {
                entry.method.update_entry_point(self.interpreter_bridge);
            }
            for entry in &state.profiling {
                entry.method.set_profiling_record(None);
            }
            state.catalog.snapshot()
        };
        self.mark_live_code(&bitmap, snapshot);

        let (freed, kept) = {
            let mut state = self.state.lock();
            state.phase = CollectorPhase::Sweeping;
            let counts = {
                let _write = self.region.scoped_code_write();
                self.sweep(&mut state, &bitmap)
            };
            self.free_profiling_records(&mut state);
            state.live_bitmap = None;
            state.has_done_one_collection = true;
            state.grew_last_cycle = false;
            self.notify_collection_done(&mut state);
            counts
        };

        let elapsed = start.elapsed();
        self.stats.record_collection(elapsed, freed);
        log::info!(
            "After clearing code cache, code={}, data={}, freed {} kept {} in {:?}",
            PrettySize(self.code_cache_size()),
            PrettySize(self.data_cache_size()),
            freed,
            kept,
            elapsed,
        );
        CollectionOutcome::Swept { freed, kept }
    }

    /// Have every thread mark the code on its stack and wait until all have.
    fn mark_live_code(&self, bitmap: &Arc<LivenessBitmap>, snapshot: CatalogSnapshot) {
        let barrier = Arc::new(Barrier::new(0));
        let checkpoint = Arc::new(MarkCodeCheckpoint {
            bitmap: Arc::clone(bitmap),
            snapshot,
            barrier: Arc::clone(&barrier),
        });
        let threads_running = self.threads.run_checkpoint(checkpoint);

        let _suspended = ScopedThreadSuspension::new(&*self.threads);
        if threads_running != 0 {
            barrier.increment(threads_running);
        }
        log::trace!(
            "marked {} live entries across {} threads",
            bitmap.marked_count(),
            threads_running
        );
    }

    /// Restore marked entries and free the rest. Returns `(freed, kept)`.
    fn sweep(&self, state: &mut CacheState, bitmap: &LivenessBitmap) -> (usize, usize) {
        let mut kept = 0;
        for (code, entry) in state.catalog.iter() {
            if bitmap.test(allocation_from_code(code)) {
                entry.method.update_entry_point(code);
                kept += 1;
            }
        }

        let dead = state
            .catalog
            .remove_where(|code, _| !bitmap.test(allocation_from_code(code)));
        for (code, entry) in &dead {
            entry.method.clear_counter();
            self.free_code(state, *code);
            log::trace!("freed method {} at 0x{:x}", entry.method.id(), code);
        }
        (dead.len(), kept)
    }

    /// Free every profiling record. Methods were detached during marking.
    fn free_profiling_records(&self, state: &mut CacheState) {
        for entry in mem::take(&mut state.profiling) {
            state.data_allocator.free(entry.record.cast());
        }
    }

    /// Raise the capacity one step. Returns `false` at the maximum.
    fn increase_capacity(&self, state: &mut CacheState) -> bool {
        if state.current_capacity >= self.max_capacity {
            return false;
        }
        let grown = if state.current_capacity < GROWTH_DOUBLING_LIMIT {
            state.current_capacity * 2
        } else {
            state.current_capacity + GROWTH_STEP
        };
        let capacity = grown.min(self.max_capacity);
        log::info!("Increasing code cache capacity to {}", PrettySize(capacity));
        state.current_capacity = capacity;
        Self::set_footprint_limit(state, capacity);
        true
    }

    /// Split `footprint` evenly between the two allocators.
    fn set_footprint_limit(state: &mut CacheState, footprint: usize) {
        let per_space = footprint / 2;
        debug_assert_eq!(per_space * 2, footprint);
        state.data_allocator.set_footprint_limit(per_space);
        state.code_allocator.set_footprint_limit(per_space);
    }
}

// =============================================================================
// Tests
// =============================================================================
