//! Per-method profiling records stored in the data half.
//!
//! A record is a fixed header followed by one [`InlineCache`] per profiled
//! call site:
//!
//! ```text
//! +-----------+-------------+----------------+----------------+-----
//! | method id | entry count | InlineCache 0  | InlineCache 1  | ...
//! +-----------+-------------+----------------+----------------+-----
//! ```
//!
//! Interpreter threads record receiver classes without taking the cache lock;
//! slots are claimed with a compare-exchange.

use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::allocator::checked_align_up;
use crate::method::MethodId;

/// Receiver classes tracked per call site before it is megamorphic.
pub const INLINE_CACHE_SIZE: usize = 5;

// =============================================================================
// InlineCache
// =============================================================================

/// Receiver classes observed at one call site.
#[repr(C)]
pub struct InlineCache {
    bytecode_offset: u32,
    classes: [AtomicUsize; INLINE_CACHE_SIZE],
}

impl InlineCache {
    fn new(bytecode_offset: u32) -> Self {
        Self {
            bytecode_offset,
            classes: Default::default(),
        }
    }

    /// Bytecode offset of the call site.
    #[inline]
    pub fn bytecode_offset(&self) -> u32 {
        self.bytecode_offset
    }

    /// Record `class_id` as a seen receiver. Zero is reserved for empty.
    ///
    /// Returns `false` once all slots hold other classes.
    pub fn add_class(&self, class_id: usize) -> bool {
        debug_assert_ne!(class_id, 0);
        for slot in &self.classes {
            match slot.compare_exchange(0, class_id, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(existing) if existing == class_id => return true,
                Err(_) => continue,
            }
        }
        false
    }

    /// Classes seen so far, in insertion order.
    pub fn classes(&self) -> impl Iterator<Item = usize> + '_ {
        self.classes
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .take_while(|&class| class != 0)
    }

    /// No receiver recorded yet.
    #[inline]
    pub fn is_uninitialized(&self) -> bool {
        self.classes[0].load(Ordering::Acquire) == 0
    }

    /// Exactly one receiver class.
    #[inline]
    pub fn is_monomorphic(&self) -> bool {
        !self.is_uninitialized() && self.classes[1].load(Ordering::Acquire) == 0
    }

    /// Every slot is taken.
    #[inline]
    pub fn is_megamorphic(&self) -> bool {
        self.classes[INLINE_CACHE_SIZE - 1].load(Ordering::Acquire) != 0
    }
}

// =============================================================================
// ProfilingRecord
// =============================================================================

/// Header of a profiling record. Inline caches follow it in memory.
#[repr(C)]
pub struct ProfilingRecord {
    method: MethodId,
    entry_count: u32,
    _padding: u32,
    entries: [InlineCache; 0],
}

impl ProfilingRecord {
    /// Bytes needed for a record with `entry_count` call sites, or `None`
    /// if the count does not fit a record.
    pub fn allocation_size(entry_count: usize) -> Option<usize> {
        if u32::try_from(entry_count).is_err() {
            return None;
        }
        let caches = entry_count.checked_mul(mem::size_of::<InlineCache>())?;
        let bytes = mem::size_of::<Self>().checked_add(caches)?;
        checked_align_up(bytes, mem::size_of::<usize>())
    }

    /// Initialize a record in freshly allocated memory.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `allocation_size(entries.len())`
    /// bytes, which must be `Some`, and aligned for `ProfilingRecord`.
    pub unsafe fn init(ptr: NonNull<u8>, method: MethodId, entries: &[u32]) -> NonNull<Self> {
        let record = ptr.cast::<Self>();
        unsafe {
            record.as_ptr().write(Self {
                method,
                entry_count: entries.len() as u32,
                _padding: 0,
                entries: [],
            });
            let caches = Self::caches_ptr(record);
            for (i, &offset) in entries.iter().enumerate() {
                caches.add(i).write(InlineCache::new(offset));
            }
        }
        record
    }

    #[inline]
    fn caches_ptr(record: NonNull<Self>) -> *mut InlineCache {
        unsafe { record.as_ptr().add(1) as *mut InlineCache }
    }
}

// =============================================================================
// ProfilingRecordRef
// =============================================================================

/// Handle to a profiling record in the cache's data half.
///
/// Like [`HeaderRef`](crate::HeaderRef), the handle keeps the mapping alive
/// but not the record: the next sweeping collection frees it. Reading the
/// record is `unsafe`.
///
/// ```compile_fail
/// # fn read(record: prism_code_cache::ProfilingRecordRef<'_>) -> usize {
/// record.entries().len()
/// # }
/// ```
#[derive(Clone, Copy)]
pub struct ProfilingRecordRef<'a> {
    ptr: NonNull<ProfilingRecord>,
    _cache: PhantomData<&'a ProfilingRecord>,
}

impl<'a> ProfilingRecordRef<'a> {
    /// # Safety
    /// `ptr` must point to an initialized record that outlives `'a`.
    #[inline]
    pub(crate) unsafe fn new(ptr: NonNull<ProfilingRecord>) -> Self {
        Self {
            ptr,
            _cache: PhantomData,
        }
    }

    /// Raw record pointer, as stored on the method.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<ProfilingRecord> {
        self.ptr
    }

    /// Method the record belongs to.
    ///
    /// # Safety
    /// The record must still be attached: the owning method's
    /// [`profiling_record`](crate::JitMethod::profiling_record) still returns
    /// this pointer and no collection has swept since that was checked.
    #[inline]
    pub unsafe fn method(&self) -> MethodId {
        unsafe { self.ptr.as_ref().method }
    }

    /// Per-call-site caches.
    ///
    /// # Safety
    /// Same contract as [`method`](Self::method), for as long as the slice
    /// is used.
    #[inline]
    pub unsafe fn entries(&self) -> &'a [InlineCache] {
        unsafe {
            let len = self.ptr.as_ref().entry_count as usize;
            slice::from_raw_parts(ProfilingRecord::caches_ptr(self.ptr), len)
        }
    }

    /// Cache for the call site at `bytecode_offset`.
    ///
    /// # Safety
    /// Same contract as [`entries`](Self::entries).
    pub unsafe fn inline_cache(&self, bytecode_offset: u32) -> Option<&'a InlineCache> {
        unsafe { self.entries() }
            .iter()
            .find(|cache| cache.bytecode_offset() == bytecode_offset)
    }
}

impl PartialEq for ProfilingRecordRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl Eq for ProfilingRecordRef<'_> {}

impl std::fmt::Debug for ProfilingRecordRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ProfilingRecordRef").field(&self.ptr).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
