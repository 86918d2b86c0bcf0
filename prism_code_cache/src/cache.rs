//! The code cache facade.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           CodeCache                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ReservedRegion  [ data half (RW) | code half (RX, RWX in scope) ]│
//! │                                                                  │
//! │  Mutex<CacheState>                                               │
//! │    code allocator ── data allocator ── catalog ── profiling      │
//! │    collection flag / phase / capacity / liveness bitmap          │
//! │                                                                  │
//! │  Condvar  (allocators wait here while a collection runs)         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation that can allocate runs at most one collection and one
//! retry before reporting exhaustion as `None`. Callers fall back to the
//! interpreter.

use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::allocator::{RegionAllocator, RegionKind, align_down, checked_align_up};
use crate::bitmap::LivenessBitmap;
use crate::catalog::CodeCatalog;
use crate::checkpoint::{ScopedThreadSuspension, ThreadList};
use crate::collector::CollectorPhase;
use crate::config::CodeCacheConfig;
use crate::error::CodeCacheError;
use crate::header::{
    FrameInfo, HEADER_ALLOCATION_SIZE, HeaderRef, INSTRUCTION_ALIGNMENT, MethodHeader,
    allocation_from_code, code_from_allocation, header_from_code,
};
use crate::method::{JitMethod, MethodRef, OwnerId};
use crate::profiling::{ProfilingRecord, ProfilingRecordRef};
use crate::region::{ReservedRegion, flush_instruction_cache, page_size};
use crate::stats::{CodeCacheInfo, CodeCacheStats, PrettySize, StatsCounters};

/// Byte pattern written over freed code in debug builds.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
const TRAP_FILL: u8 = 0xCC;
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
const TRAP_FILL: u8 = 0x00;

// =============================================================================
// CompiledCode
// =============================================================================

/// Output of the compiler backend for one method.
///
/// Auxiliary tables must already live in the cache's data half, normally
/// obtained from [`CodeCache::reserve_data`] or
/// [`CodeCache::add_data_array`]. Their ownership passes to the committed
/// entry.
#[derive(Debug, Clone, Copy)]
pub struct CompiledCode<'a> {
    /// Native instructions.
    pub code: &'a [u8],
    /// Native pc to bytecode offset table.
    pub mapping_table: Option<NonNull<u8>>,
    /// Register/stack value map.
    pub vmap_table: Option<NonNull<u8>>,
    /// GC map for the managed heap.
    pub gc_map: Option<NonNull<u8>>,
    /// Frame layout.
    pub frame_info: FrameInfo,
}

impl<'a> CompiledCode<'a> {
    /// Code with no auxiliary tables and an empty frame.
    pub fn new(code: &'a [u8]) -> Self {
        Self {
            code,
            mapping_table: None,
            vmap_table: None,
            gc_map: None,
            frame_info: FrameInfo::default(),
        }
    }

    /// Attach the mapping table.
    pub fn with_mapping_table(mut self, table: NonNull<u8>) -> Self {
        self.mapping_table = Some(table);
        self
    }

    /// Attach the value map.
    pub fn with_vmap_table(mut self, table: NonNull<u8>) -> Self {
        self.vmap_table = Some(table);
        self
    }

    /// Attach the GC map.
    pub fn with_gc_map(mut self, table: NonNull<u8>) -> Self {
        self.gc_map = Some(table);
        self
    }

    /// Set the frame layout.
    pub fn with_frame_info(mut self, frame_info: FrameInfo) -> Self {
        self.frame_info = frame_info;
        self
    }

    fn tables(&self) -> [Option<NonNull<u8>>; 3] {
        [self.mapping_table, self.vmap_table, self.gc_map]
    }
}

// =============================================================================
// CacheState
// =============================================================================

/// A profiling record and the method it was attached to.
pub(crate) struct ProfilingEntry {
    pub(crate) record: NonNull<ProfilingRecord>,
    pub(crate) method: MethodRef,
}

/// Everything guarded by the cache lock.
pub(crate) struct CacheState {
    pub(crate) code_allocator: RegionAllocator,
    pub(crate) data_allocator: RegionAllocator,
    pub(crate) catalog: CodeCatalog,
    pub(crate) profiling: Vec<ProfilingEntry>,
    pub(crate) collection_in_progress: bool,
    pub(crate) phase: CollectorPhase,
    /// Set once a collection has swept.
    pub(crate) has_done_one_collection: bool,
    /// The previous cycle grew instead of sweeping.
    pub(crate) grew_last_cycle: bool,
    pub(crate) current_capacity: usize,
    /// Present while a sweeping cycle is marking or sweeping.
    pub(crate) live_bitmap: Option<Arc<LivenessBitmap>>,
    pub(crate) last_update_time_ns: u64,
}

// Record pointers refer into the reservation and are only touched under the
// cache lock.
unsafe impl Send for CacheState {}

// =============================================================================
// CodeCache
// =============================================================================

/// Executable memory for JIT-compiled methods.
///
/// Construct one per runtime and share it by reference (or `Arc`) with the
/// compiler, the interpreter and the class unloader.
pub struct CodeCache {
    pub(crate) region: ReservedRegion,
    pub(crate) max_capacity: usize,
    pub(crate) interpreter_bridge: usize,
    pub(crate) threads: Arc<dyn ThreadList>,
    pub(crate) state: Mutex<CacheState>,
    pub(crate) collection_done: Condvar,
    pub(crate) stats: StatsCounters,
    created_at: Instant,
}

impl CodeCache {
    /// Reserve the address range and set up both allocators.
    ///
    /// Capacities are rounded down to a multiple of two pages so that each
    /// half starts page aligned. `interpreter_bridge` is installed as the
    /// entry point of methods whose code is being collected.
    pub fn create(
        config: CodeCacheConfig,
        interpreter_bridge: usize,
        threads: Arc<dyn ThreadList>,
    ) -> Result<Self, CodeCacheError> {
        config.validate()?;

        let two_pages = 2 * page_size();
        let initial_capacity = align_down(config.initial_capacity, two_pages);
        let max_capacity = align_down(config.max_capacity, two_pages);
        if initial_capacity == 0 {
            return Err(CodeCacheError::CapacityTooSmall {
                requested: config.initial_capacity,
                minimum: two_pages,
            });
        }

        let region = ReservedRegion::reserve(max_capacity)?;
        let data_capacity = initial_capacity / 2;
        let code_capacity = initial_capacity - data_capacity;

        // SAFETY: a live mapping never starts at null.
        let data_base = unsafe { NonNull::new_unchecked(region.data_begin()) };
        let code_base = unsafe { NonNull::new_unchecked(region.code_begin() as *mut u8) };
        let data_allocator =
            RegionAllocator::new(RegionKind::Data, data_base, region.data_size(), data_capacity);
        let code_allocator =
            RegionAllocator::new(RegionKind::Code, code_base, region.code_size(), code_capacity);

        log::info!(
            "Created jit code cache: initial data size={}, initial code size={}, max capacity={}",
            PrettySize(data_capacity),
            PrettySize(code_capacity),
            PrettySize(max_capacity),
        );

        Ok(Self {
            region,
            max_capacity,
            interpreter_bridge,
            threads,
            state: Mutex::new(CacheState {
                code_allocator,
                data_allocator,
                catalog: CodeCatalog::new(),
                profiling: Vec::new(),
                collection_in_progress: false,
                phase: CollectorPhase::Idle,
                has_done_one_collection: false,
                grew_last_cycle: false,
                current_capacity: initial_capacity,
                live_bitmap: None,
                last_update_time_ns: 0,
            }),
            collection_done: Condvar::new(),
            stats: StatsCounters::default(),
            created_at: Instant::now(),
        })
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Copy compiled code into the cache and make it the method's entry point.
    ///
    /// Returns `None` if the code does not fit even after one collection.
    /// Code larger than the whole code half fails without collecting.
    pub fn commit(&self, method: &MethodRef, compiled: &CompiledCode<'_>) -> Option<HeaderRef<'_>> {
        let fits = compiled
            .code
            .len()
            .checked_add(HEADER_ALLOCATION_SIZE)
            .is_some_and(|total| total <= self.region.code_size());
        if !fits || u32::try_from(compiled.code.len()).is_err() {
            self.stats.record_commit(false);
            log::debug!(
                "method {} has {} bytes of code, more than the code cache can hold",
                method.id(),
                compiled.code.len()
            );
            return None;
        }

        let mut result = self.commit_internal(method, compiled);
        if result.is_none() {
            self.stats.record_commit(false);
            self.collect();
            result = self.commit_internal(method, compiled);
        }
        match result {
            Some(_) => self.stats.record_commit(true),
            None => {
                self.stats.record_commit(false);
                log::debug!(
                    "code cache full, method {} stays interpreted ({} bytes)",
                    method.id(),
                    compiled.code.len()
                );
            }
        }
        result
    }

    fn commit_internal(
        &self,
        method: &MethodRef,
        compiled: &CompiledCode<'_>,
    ) -> Option<HeaderRef<'_>> {
        let code_size = u32::try_from(compiled.code.len()).ok()?;
        for table in compiled.tables().into_iter().flatten() {
            debug_assert!(
                self.region.contains_data(table.as_ptr() as usize),
                "auxiliary table {table:p} is not in the data half"
            );
        }

        let total = HEADER_ALLOCATION_SIZE + compiled.code.len();
        let code = {
            let _suspended = ScopedThreadSuspension::new(&*self.threads);
            let mut state = self.state.lock();
            self.wait_for_collection(&mut state);

            let _write = self.region.scoped_code_write();
            let allocation = state
                .code_allocator
                .allocate(total, INSTRUCTION_ALIGNMENT)?
                .as_ptr();
            let code = code_from_allocation(allocation as usize);
            let header = MethodHeader::new(
                code,
                compiled.mapping_table,
                compiled.vmap_table,
                compiled.gc_map,
                compiled.frame_info,
                code_size,
            );
            // SAFETY: the allocation spans header and code, and the write
            // scope makes the code half writable.
            unsafe {
                ptr::copy_nonoverlapping(compiled.code.as_ptr(), code as *mut u8, compiled.code.len());
                (header_from_code(code) as *mut MethodHeader).write(header);
            }
            flush_instruction_cache(allocation, total);
            code
        };

        let mut state = self.state.lock();
        state.catalog.insert(code, Arc::clone(method), compiled.code.len());
        method.update_entry_point(code);
        if let Some(bitmap) = &state.live_bitmap {
            // Committed mid-collection: nothing on a stack refers to it yet,
            // but it must not be swept.
            bitmap.atomic_test_and_set(allocation_from_code(code));
        }
        state.last_update_time_ns = self.now_ns();
        log::debug!(
            "committed method {} at 0x{:x} ({} bytes), code cache size={}",
            method.id(),
            code,
            compiled.code.len(),
            PrettySize(state.code_allocator.inspect_allocated_bytes()),
        );

        // SAFETY: `code` is a committed entry of this cache.
        Some(unsafe { HeaderRef::from_code(code) })
    }

    // =========================================================================
    // Data
    // =========================================================================

    /// Reserve `size` bytes in the data half, rounded up to pointer size.
    ///
    /// Sizes larger than the whole data half fail without collecting.
    pub fn reserve_data(&self, size: usize) -> Option<NonNull<u8>> {
        let Some(size) = checked_align_up(size, mem::size_of::<usize>())
            .filter(|&size| size <= self.region.data_size())
        else {
            self.stats.record_data_reservation(false);
            return None;
        };
        let mut result = self.reserve_data_internal(size);
        if result.is_none() {
            self.stats.record_data_reservation(false);
            self.collect();
            result = self.reserve_data_internal(size);
        }
        self.stats.record_data_reservation(result.is_some());
        result
    }

    fn reserve_data_internal(&self, size: usize) -> Option<NonNull<u8>> {
        let _suspended = ScopedThreadSuspension::new(&*self.threads);
        let mut state = self.state.lock();
        self.wait_for_collection(&mut state);
        state.data_allocator.allocate(size, mem::size_of::<usize>())
    }

    /// Reserve space for `bytes` in the data half and copy them in.
    pub fn add_data_array(&self, bytes: &[u8]) -> Option<NonNull<u8>> {
        let data = self.reserve_data(bytes.len())?;
        // SAFETY: freshly reserved, at least `bytes.len()` long.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), data.as_ptr(), bytes.len()) };
        Some(data)
    }

    /// Return a data reservation that was never handed to a commit.
    pub fn clear_data(&self, data: NonNull<u8>) {
        let mut state = self.state.lock();
        state.data_allocator.free(data);
    }

    // =========================================================================
    // Profiling
    // =========================================================================

    /// Attach a profiling record with one inline cache per bytecode offset in
    /// `entries`.
    ///
    /// If the method already has a record it is returned unchanged.
    pub fn add_profiling_info(
        &self,
        method: &MethodRef,
        entries: &[u32],
    ) -> Option<ProfilingRecordRef<'_>> {
        let size = ProfilingRecord::allocation_size(entries.len())
            .filter(|&size| size <= self.region.data_size())?;
        let mut result = self.add_profiling_info_internal(method, entries, size);
        if result.is_none() {
            self.collect();
            result = self.add_profiling_info_internal(method, entries, size);
        }
        result
    }

    fn add_profiling_info_internal(
        &self,
        method: &MethodRef,
        entries: &[u32],
        size: usize,
    ) -> Option<ProfilingRecordRef<'_>> {
        let _suspended = ScopedThreadSuspension::new(&*self.threads);
        let mut state = self.state.lock();
        self.wait_for_collection(&mut state);

        if let Some(existing) = method.profiling_record() {
            // SAFETY: attached records stay allocated until the next sweep,
            // which detaches them first.
            return Some(unsafe { ProfilingRecordRef::new(existing) });
        }

        let data = state.data_allocator.allocate(size, mem::size_of::<usize>())?;
        // SAFETY: freshly allocated, sized and aligned for the record.
        let record = unsafe { ProfilingRecord::init(data, method.id(), entries) };
        method.set_profiling_record(Some(record));
        state.profiling.push(ProfilingEntry {
            record,
            method: Arc::clone(method),
        });
        Some(unsafe { ProfilingRecordRef::new(record) })
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Header of the committed entry whose code contains `pc`.
    ///
    /// When `expected` is given, debug builds check that the entry belongs to
    /// that method.
    pub fn lookup_header(&self, pc: usize, expected: Option<&dyn JitMethod>) -> Option<HeaderRef<'_>> {
        if !self.contains_address(pc) {
            return None;
        }
        let state = self.state.lock();
        let (code, entry) = state.catalog.lookup(pc)?;
        if let Some(expected) = expected {
            debug_assert_eq!(
                expected.id(),
                entry.method.id(),
                "pc 0x{pc:x} resolved to another method"
            );
        }
        // SAFETY: `code` is in the catalog, so its header is initialized.
        Some(unsafe { HeaderRef::from_code(code) })
    }

    /// Whether `pc` lies in the code half. Lock-free.
    #[inline]
    pub fn contains_address(&self, pc: usize) -> bool {
        self.region.contains_code(pc)
    }

    /// Whether `method` has committed code.
    pub fn contains_method(&self, method: &dyn JitMethod) -> bool {
        self.state.lock().catalog.contains_method(method.id())
    }

    /// Methods with committed code defined by `owner`.
    pub fn compiled_methods_owned_by(&self, owner: OwnerId) -> Vec<MethodRef> {
        self.state.lock().catalog.methods_owned_by(owner)
    }

    // =========================================================================
    // Unloading
    // =========================================================================

    /// Drop all code and profiling records of methods defined by `owner`.
    pub fn remove_methods_owned_by(&self, owner: OwnerId) {
        let mut state = self.state.lock();
        let removed = {
            let _write = self.region.scoped_code_write();
            let removed = state
                .catalog
                .remove_where(|_, entry| entry.method.owner() == owner);
            for (code, _) in &removed {
                self.free_code(&mut state, *code);
            }
            removed.len()
        };

        let mut records = 0;
        let profiling = mem::take(&mut state.profiling);
        for entry in profiling {
            if entry.method.owner() == owner {
                entry.method.set_profiling_record(None);
                state.data_allocator.free(entry.record.cast());
                records += 1;
            } else {
                state.profiling.push(entry);
            }
        }
        log::debug!("removed {removed} methods and {records} profiling records of {owner:?}");
    }

    /// Release a committed entry and its auxiliary tables.
    ///
    /// The caller holds the lock and a code write scope, and has already
    /// removed the entry from the catalog.
    pub(crate) fn free_code(&self, state: &mut CacheState, code: usize) {
        debug_assert!(self.region.is_code_writable());
        // SAFETY: the entry was committed by this cache and is not yet freed.
        let header = unsafe { HeaderRef::from_code(code).get() };
        let tables = [header.gc_map(), header.mapping_table(), header.vmap_table()];
        let allocation = allocation_from_code(code);
        let size = HEADER_ALLOCATION_SIZE + header.code_size();

        for table in tables.into_iter().flatten() {
            state.data_allocator.free(table);
        }
        if cfg!(debug_assertions) {
            // SAFETY: the whole allocation is ours and the code half is writable.
            unsafe { ptr::write_bytes(allocation as *mut u8, TRAP_FILL, size) };
        }
        if let Some(allocation) = NonNull::new(allocation as *mut u8) {
            state.code_allocator.free(allocation);
        }
    }

    // =========================================================================
    // Collection handshake
    // =========================================================================

    /// Block until no collection is running. Returns whether one was waited on.
    pub(crate) fn wait_for_collection(&self, state: &mut MutexGuard<'_, CacheState>) -> bool {
        let mut waited = false;
        while state.collection_in_progress {
            waited = true;
            self.collection_done.wait(state);
        }
        waited
    }

    /// End the current cycle and wake blocked allocators.
    pub(crate) fn notify_collection_done(&self, state: &mut CacheState) {
        state.collection_in_progress = false;
        state.phase = CollectorPhase::Idle;
        self.collection_done.notify_all();
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Bytes held by committed entries, headers included.
    pub fn code_cache_size(&self) -> usize {
        self.state.lock().code_allocator.inspect_allocated_bytes()
    }

    /// Bytes held by data reservations and profiling records.
    pub fn data_cache_size(&self) -> usize {
        self.state.lock().data_allocator.inspect_allocated_bytes()
    }

    /// Entries in the catalog.
    pub fn number_of_compiled_code(&self) -> usize {
        self.state.lock().catalog.len()
    }

    /// Profiling records currently attached.
    pub fn number_of_profiling_records(&self) -> usize {
        self.state.lock().profiling.len()
    }

    /// Capacity both allocators may use together.
    pub fn current_capacity(&self) -> usize {
        self.state.lock().current_capacity
    }

    /// Size of the reservation.
    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Entry point installed while a method's code is being collected.
    #[inline]
    pub fn interpreter_bridge(&self) -> usize {
        self.interpreter_bridge
    }

    /// Nanoseconds since creation of the last successful commit; 0 if none.
    pub fn last_update_time_ns(&self) -> u64 {
        self.state.lock().last_update_time_ns
    }

    /// Whether a collection cycle is running.
    pub fn is_collecting(&self) -> bool {
        self.state.lock().collection_in_progress
    }

    /// Phase of the running cycle, `Idle` if none.
    pub fn collection_phase(&self) -> CollectorPhase {
        self.state.lock().phase
    }

    /// Whether any collection has swept.
    pub fn has_done_one_collection(&self) -> bool {
        self.state.lock().has_done_one_collection
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CodeCacheStats {
        self.stats.snapshot()
    }

    /// Summary for diagnostics; `Display` renders the text dump.
    pub fn dump_info(&self) -> CodeCacheInfo {
        let state = self.state.lock();
        CodeCacheInfo {
            code_cache_size: state.code_allocator.inspect_allocated_bytes(),
            data_cache_size: state.data_allocator.inspect_allocated_bytes(),
            compiled_code: state.catalog.len(),
            current_capacity: state.current_capacity,
            max_capacity: self.max_capacity,
            collections: self.stats.snapshot().collections,
        }
    }

    fn now_ns(&self) -> u64 {
        (self.created_at.elapsed().as_nanos() as u64).max(1)
    }
}

impl fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeCache")
            .field("region", &self.region)
            .field("max_capacity", &self.max_capacity)
            .field("interpreter_bridge", &format_args!("0x{:x}", self.interpreter_bridge))
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ThreadRegistry;
    use crate::config::KB;
    use crate::method::MethodSlot;

    const BRIDGE: usize = 0xDEAD_0000;
    const RET: [u8; 4] = [0xC3, 0x90, 0x90, 0x90];

    fn cache(config: CodeCacheConfig) -> CodeCache {
        CodeCache::create(config, BRIDGE, Arc::new(ThreadRegistry::new())).unwrap()
    }

    fn method(id: u64) -> (Arc<MethodSlot>, MethodRef) {
        let slot = Arc::new(MethodSlot::new(id, OwnerId(id % 2), BRIDGE));
        let method: MethodRef = slot.clone();
        (slot, method)
    }

    #[test]
    fn test_create_splits_initial_capacity() {
        let cache = cache(CodeCacheConfig::for_testing());
        assert_eq!(cache.current_capacity(), 64 * KB);
        assert_eq!(cache.max_capacity(), 64 * KB);
        assert_eq!(cache.code_cache_size(), 0);
        assert_eq!(cache.last_update_time_ns(), 0);
    }

    #[test]
    fn test_create_rejects_tiny_capacity() {
        let config = CodeCacheConfig {
            initial_capacity: 1,
            max_capacity: 64 * KB,
        };
        let err = CodeCache::create(config, BRIDGE, Arc::new(ThreadRegistry::new())).unwrap_err();
        assert!(matches!(err, CodeCacheError::CapacityTooSmall { requested: 1, .. }));
    }

    #[test]
    fn test_commit_installs_entry_point() {
        let cache = cache(CodeCacheConfig::for_testing());
        let (slot, method) = method(1);
        let header = cache.commit(&method, &CompiledCode::new(&RET)).unwrap();

        let code = header.code_ptr() as usize;
        assert_eq!(slot.entry_point(), code);
        assert_eq!(code % INSTRUCTION_ALIGNMENT, 0);
        assert!(cache.contains_address(code));
        assert!(cache.contains_method(&*slot));
        assert_eq!(unsafe { header.get() }.code_size(), RET.len());
        assert_eq!(unsafe { std::slice::from_raw_parts(header.code_ptr(), 4) }, &RET);
        assert!(cache.last_update_time_ns() > 0);
    }

    #[test]
    fn test_commit_records_tables() {
        let cache = cache(CodeCacheConfig::for_testing());
        let (_, method) = method(1);
        let mapping = cache.add_data_array(&[1, 2, 3]).unwrap();
        let gc_map = cache.reserve_data(24).unwrap();

        let compiled = CompiledCode::new(&RET)
            .with_mapping_table(mapping)
            .with_gc_map(gc_map)
            .with_frame_info(FrameInfo::new(32, 0x3, 0));
        let view = cache.commit(&method, &compiled).unwrap();
        let header = unsafe { view.get() };

        assert_eq!(header.mapping_table(), Some(mapping));
        assert_eq!(header.vmap_table(), None);
        assert_eq!(header.gc_map(), Some(gc_map));
        assert_eq!(header.frame_info().frame_size_in_bytes, 32);
        assert_eq!(unsafe { *mapping.as_ptr().add(2) }, 3);
    }

    #[test]
    fn test_lookup_header_inclusive_end() {
        let cache = cache(CodeCacheConfig::for_testing());
        let (slot, method) = method(1);
        let header = cache.commit(&method, &CompiledCode::new(&RET)).unwrap();
        let code = header.code_ptr() as usize;

        assert_eq!(cache.lookup_header(code, Some(&*slot as &dyn JitMethod)), Some(header));
        assert_eq!(cache.lookup_header(code + RET.len(), None), Some(header));
        assert_eq!(cache.lookup_header(code + RET.len() + 1, None), None);
        assert_eq!(cache.lookup_header(0x10, None), None);
    }

    #[test]
    fn test_reserve_data_rounds_to_pointer_size() {
        let cache = cache(CodeCacheConfig::for_testing());
        let data = cache.reserve_data(3).unwrap();
        assert_eq!(data.as_ptr() as usize % mem::size_of::<usize>(), 0);
        assert!(cache.data_cache_size() >= mem::size_of::<usize>());
        cache.clear_data(data);
        assert_eq!(cache.data_cache_size(), 0);
    }

    #[test]
    fn test_impossible_sizes_fail_without_collecting() {
        let cache = cache(CodeCacheConfig::for_testing());
        let (slot, method) = method(1);

        assert!(cache.reserve_data(usize::MAX).is_none());
        assert!(cache.reserve_data(cache.max_capacity()).is_none());
        let oversized = vec![0x90u8; cache.max_capacity()];
        assert!(cache.commit(&method, &CompiledCode::new(&oversized)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.collections, 0);
        assert_eq!(stats.growths, 0);
        assert_eq!(stats.data_failures, 2);
        assert_eq!(stats.commit_failures, 1);
        assert_eq!(slot.entry_point(), BRIDGE);
        assert!(cache.reserve_data(64).is_some());
    }

    #[test]
    fn test_stale_header_keeps_its_address_only() {
        let cache = cache(CodeCacheConfig::for_testing());
        let (_, first) = method(1);
        let stale = cache.commit(&first, &CompiledCode::new(&RET)).unwrap();
        let code = stale.code_ptr() as usize;

        cache.collect();
        assert!(!cache.contains_method(&*first));
        assert_eq!(cache.lookup_header(code, None), None);

        // The freed block is reused; the old handle still only names the address.
        let (slot, second) = method(2);
        let fresh = cache.commit(&second, &CompiledCode::new(&[0xCC; 8])).unwrap();
        assert_eq!(fresh, stale);
        assert_eq!(stale.code_ptr() as usize, code);
        assert_eq!(slot.entry_point(), code);
        assert_eq!(unsafe { fresh.get() }.code_size(), 8);
    }

    #[test]
    fn test_profiling_attach_is_idempotent() {
        let cache = cache(CodeCacheConfig::for_testing());
        let (slot, method) = method(1);
        let first = cache.add_profiling_info(&method, &[0, 4, 12]).unwrap();
        let second = cache.add_profiling_info(&method, &[7]).unwrap();

        assert_eq!(first, second);
        assert_eq!(unsafe { second.entries() }.len(), 3);
        assert_eq!(slot.profiling_record(), Some(first.as_ptr()));
        assert_eq!(cache.number_of_profiling_records(), 1);
    }

    #[test]
    fn test_remove_methods_owned_by() {
        let cache = cache(CodeCacheConfig::for_testing());
        let methods: Vec<_> = (0..4).map(method).collect();
        for (_, method) in &methods {
            cache.commit(method, &CompiledCode::new(&RET)).unwrap();
            cache.add_profiling_info(method, &[0]).unwrap();
        }
        assert_eq!(cache.compiled_methods_owned_by(OwnerId(1)).len(), 2);

        cache.remove_methods_owned_by(OwnerId(1));

        assert_eq!(cache.number_of_compiled_code(), 2);
        assert_eq!(cache.number_of_profiling_records(), 2);
        assert!(cache.compiled_methods_owned_by(OwnerId(1)).is_empty());
        for (slot, _) in &methods {
            assert_eq!(slot.profiling_record().is_some(), slot.owner() == OwnerId(0));
        }
        assert!(!cache.region.is_code_writable());
    }

    #[test]
    fn test_dump_info() {
        let cache = cache(CodeCacheConfig::for_testing());
        let (_, method) = method(1);
        cache.commit(&method, &CompiledCode::new(&RET)).unwrap();
        let info = cache.dump_info();
        assert_eq!(info.compiled_code, 1);
        assert_eq!(info.code_cache_size, HEADER_ALLOCATION_SIZE + 16);
        assert!(info.to_string().contains("Number of compiled code=1"));
    }
}
