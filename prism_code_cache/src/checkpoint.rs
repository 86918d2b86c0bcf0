//! Per-thread checkpoints used to find code on live stacks.
//!
//! A collection never stops the world. It hands a [`Checkpoint`] to the
//! runtime's [`ThreadList`], which arranges for every mutator thread to run
//! it exactly once:
//!
//! 1. Runnable threads queue it and run it at their next safe point
//! 2. Suspended threads have it run on their behalf by the requester
//! 3. The requesting thread runs it on itself immediately
//!
//! Each run ends with [`Barrier::pass`]; the requester waits on the barrier
//! for the count returned by [`ThreadList::run_checkpoint`].
//!
//! [`ThreadRegistry`] is a complete `ThreadList` for embedders without one.

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

// =============================================================================
// Runtime hooks
// =============================================================================

/// Walks one thread's stack.
pub trait StackWalker: Send + Sync {
    /// Visit the return address of every frame, innermost first.
    fn walk_stack(&self, visitor: &mut dyn FnMut(usize));
}

/// Work a thread runs against its own stack.
pub trait Checkpoint: Send + Sync {
    /// Run against `stack`. Must not block on the code cache lock.
    fn run(&self, stack: &dyn StackWalker);
}

/// The runtime's set of mutator threads.
pub trait ThreadList: Send + Sync {
    /// Request `checkpoint` on every live thread.
    ///
    /// Returns how many threads ran or will run it, including any run
    /// synchronously before returning.
    fn run_checkpoint(&self, checkpoint: Arc<dyn Checkpoint>) -> usize;

    /// The calling thread is about to block; checkpoints may be run for it.
    fn transition_to_suspended(&self) {}

    /// The calling thread stopped blocking.
    fn transition_to_runnable(&self) {}
}

// =============================================================================
// ScopedThreadSuspension
// =============================================================================

/// Marks the current thread suspended for the guard's lifetime.
///
/// Held around every wait that may last for a whole collection so that the
/// collector never waits on a thread that is itself waiting on it.
pub struct ScopedThreadSuspension<'a> {
    threads: &'a dyn ThreadList,
}

impl<'a> ScopedThreadSuspension<'a> {
    /// Suspend the current thread.
    pub fn new(threads: &'a dyn ThreadList) -> Self {
        threads.transition_to_suspended();
        Self { threads }
    }
}

impl Drop for ScopedThreadSuspension<'_> {
    fn drop(&mut self) {
        self.threads.transition_to_runnable();
    }
}

// =============================================================================
// Barrier
// =============================================================================

/// Counting barrier.
///
/// Passes may arrive before the waiter announces how many it expects, so the
/// count is allowed to go negative.
#[derive(Debug)]
pub struct Barrier {
    count: Mutex<isize>,
    cond: Condvar,
}

impl Barrier {
    /// Create a barrier with an initial count.
    pub fn new(count: isize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Decrement the count and wake waiters.
    pub fn pass(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    /// Add `delta` to the count and block until it reaches zero.
    pub fn increment(&self, delta: usize) {
        let mut count = self.count.lock();
        *count += delta as isize;
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }

    /// Current count.
    pub fn count(&self) -> isize {
        *self.count.lock()
    }
}

// =============================================================================
// ThreadState
// =============================================================================

/// State of a registered thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Running managed code; checkpoints wait for the next safe point.
    Runnable,
    /// Blocked; the stack is stable and may be walked by other threads.
    Suspended,
    /// Left the registry.
    Detached,
}

struct ThreadSlot {
    state: ThreadState,
    suspend_depth: u32,
    pending: SmallVec<[Arc<dyn Checkpoint>; 2]>,
}

// =============================================================================
// MutatorThread
// =============================================================================

/// A thread registered with a [`ThreadRegistry`].
pub struct MutatorThread {
    id: u64,
    registry: u64,
    stack: Arc<dyn StackWalker>,
    slot: Mutex<ThreadSlot>,
}

impl MutatorThread {
    /// Thread id within its registry.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> ThreadState {
        self.slot.lock().state
    }

    /// Number of checkpoints waiting for the next safe point.
    pub fn pending_checkpoints(&self) -> usize {
        self.slot.lock().pending.len()
    }

    /// Safe point poll: run every queued checkpoint.
    pub fn check_safepoint(&self) {
        loop {
            let pending = mem::take(&mut self.slot.lock().pending);
            if pending.is_empty() {
                return;
            }
            for checkpoint in pending {
                checkpoint.run(&*self.stack);
            }
        }
    }

    /// Enter the suspended state, first draining queued checkpoints.
    pub fn transition_to_suspended(&self) {
        loop {
            let pending = {
                let mut slot = self.slot.lock();
                if slot.pending.is_empty() {
                    slot.suspend_depth += 1;
                    if slot.state == ThreadState::Runnable {
                        slot.state = ThreadState::Suspended;
                    }
                    return;
                }
                mem::take(&mut slot.pending)
            };
            for checkpoint in pending {
                checkpoint.run(&*self.stack);
            }
        }
    }

    /// Leave the suspended state.
    ///
    /// Blocks while another thread is running a checkpoint on this one.
    pub fn transition_to_runnable(&self) {
        let mut slot = self.slot.lock();
        debug_assert!(slot.suspend_depth > 0, "unbalanced thread suspension");
        slot.suspend_depth = slot.suspend_depth.saturating_sub(1);
        if slot.suspend_depth == 0 && slot.state == ThreadState::Suspended {
            slot.state = ThreadState::Runnable;
        }
    }

    /// Queue or run `checkpoint` for this thread. Returns whether it counts
    /// toward the barrier.
    fn request_checkpoint(&self, checkpoint: &Arc<dyn Checkpoint>) -> bool {
        let mut slot = self.slot.lock();
        match slot.state {
            ThreadState::Runnable => {
                slot.pending.push(Arc::clone(checkpoint));
                true
            }
            ThreadState::Suspended => {
                // The slot lock keeps the thread from resuming mid-walk.
                checkpoint.run(&*self.stack);
                true
            }
            ThreadState::Detached => false,
        }
    }
}

impl fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("MutatorThread")
            .field("id", &self.id)
            .field("state", &slot.state)
            .field("pending", &slot.pending.len())
            .finish()
    }
}

thread_local! {
    static CURRENT_THREADS: RefCell<SmallVec<[Arc<MutatorThread>; 1]>> =
        RefCell::new(SmallVec::new());
}

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// ThreadRegistry
// =============================================================================

/// Checkpoint-capable registry of mutator threads.
///
/// Threads attach themselves with a [`StackWalker`] describing their stack
/// and must call [`check_safepoint`](MutatorThread::check_safepoint)
/// regularly while runnable.
pub struct ThreadRegistry {
    id: u64,
    next_thread_id: AtomicU64,
    threads: RwLock<FxHashMap<u64, Arc<MutatorThread>>>,
}

impl ThreadRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            next_thread_id: AtomicU64::new(1),
            threads: RwLock::new(FxHashMap::default()),
        }
    }

    /// Register the calling thread. Attaching twice returns the existing entry.
    pub fn attach_current_thread(&self, stack: Arc<dyn StackWalker>) -> Arc<MutatorThread> {
        if let Some(existing) = self.current() {
            return existing;
        }
        let thread = Arc::new(MutatorThread {
            id: self.next_thread_id.fetch_add(1, Ordering::Relaxed),
            registry: self.id,
            stack,
            slot: Mutex::new(ThreadSlot {
                state: ThreadState::Runnable,
                suspend_depth: 0,
                pending: SmallVec::new(),
            }),
        });
        self.threads.write().insert(thread.id, Arc::clone(&thread));
        CURRENT_THREADS.with(|current| current.borrow_mut().push(Arc::clone(&thread)));
        log::trace!("thread {} attached to registry {}", thread.id, self.id);
        thread
    }

    /// Unregister the calling thread after draining its queued checkpoints.
    pub fn detach_current_thread(&self) {
        let Some(thread) = self.current() else {
            return;
        };
        thread.check_safepoint();
        {
            let mut slot = thread.slot.lock();
            // Anything queued after the drain above still owes a pass.
            for checkpoint in mem::take(&mut slot.pending) {
                checkpoint.run(&*thread.stack);
            }
            slot.state = ThreadState::Detached;
        }
        self.threads.write().remove(&thread.id);
        CURRENT_THREADS.with(|current| {
            current
                .borrow_mut()
                .retain(|t| !Arc::ptr_eq(t, &thread));
        });
        log::trace!("thread {} detached from registry {}", thread.id, self.id);
    }

    /// Entry for the calling thread, if attached.
    pub fn current(&self) -> Option<Arc<MutatorThread>> {
        CURRENT_THREADS.with(|current| {
            current
                .borrow()
                .iter()
                .find(|t| t.registry == self.id)
                .cloned()
        })
    }

    /// Safe point poll for the calling thread.
    pub fn check_safepoint(&self) {
        if let Some(thread) = self.current() {
            thread.check_safepoint();
        }
    }

    /// Number of attached threads.
    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadList for ThreadRegistry {
    fn run_checkpoint(&self, checkpoint: Arc<dyn Checkpoint>) -> usize {
        let threads: Vec<Arc<MutatorThread>> = self.threads.read().values().cloned().collect();
        let current = self.current();
        let mut count = 0;

        for thread in &threads {
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, thread)) {
                continue;
            }
            if thread.request_checkpoint(&checkpoint) {
                count += 1;
            }
        }

        if let Some(current) = current {
            checkpoint.run(&*current.stack);
            count += 1;
        }
        count
    }

    fn transition_to_suspended(&self) {
        if let Some(thread) = self.current() {
            thread.transition_to_suspended();
        }
    }

    fn transition_to_runnable(&self) {
        if let Some(thread) = self.current() {
            thread.transition_to_runnable();
        }
    }
}

impl fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("id", &self.id)
            .field("threads", &self.thread_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
