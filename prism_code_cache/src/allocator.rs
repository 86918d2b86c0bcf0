//! First-fit allocator over one half of the reserved region.
//!
//! Bookkeeping lives out of band (ordered free list plus a live table), so the
//! allocator never touches the memory it manages. That keeps the code half
//! read-execute while blocks are carved or released; only copying code in
//! requires a write window.
//!
//! ```text
//! base                         top              limit         reserved
//!   +---------+----+------+-----+-----------------+--------------+
//!   | live    |free| live | free|  (unused)       |  (reserved)  |
//!   +---------+----+------+-----+-----------------+--------------+
//!   |<------- footprint -------->|
//! ```
//!
//! New space is carved at `top` only while it stays under the footprint
//! limit. Releasing the block that ends at `top` shrinks the footprint.

use std::collections::BTreeMap;
use std::ptr::NonNull;

use rustc_hash::FxHashMap;

/// Minimum allocation granularity. Every block starts and ends on it.
pub const ALLOCATION_GRANULE: usize = 16;

/// Round `value` up to `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// [`align_up`] that reports overflow instead of wrapping.
#[inline]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(bumped) => Some(bumped & !(align - 1)),
        None => None,
    }
}

/// Round `value` down to `align` (a power of two).
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

// =============================================================================
// RegionKind
// =============================================================================

/// Which half of the reservation an allocator manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Committed method headers and instructions.
    Code,
    /// Auxiliary tables and profiling records.
    Data,
}

// =============================================================================
// RegionAllocator
// =============================================================================

/// Allocator over `[base, base + reserved)` with a soft footprint limit.
///
/// Not internally synchronized; the code cache owns both allocators behind
/// its lock.
#[derive(Debug)]
pub struct RegionAllocator {
    kind: RegionKind,
    base: usize,
    reserved: usize,
    footprint_limit: usize,
    /// End of the carved area, relative to `base`.
    top: usize,
    /// Free blocks below `top`, keyed by offset. Never adjacent.
    free: BTreeMap<usize, usize>,
    /// Live blocks keyed by offset.
    live: FxHashMap<usize, usize>,
}

impl RegionAllocator {
    /// Create an allocator over `reserved` bytes at `base`.
    pub fn new(kind: RegionKind, base: NonNull<u8>, reserved: usize, footprint_limit: usize) -> Self {
        let base = base.as_ptr() as usize;
        debug_assert_eq!(base % ALLOCATION_GRANULE, 0);
        Self {
            kind,
            base,
            reserved,
            footprint_limit: align_down(footprint_limit.min(reserved), ALLOCATION_GRANULE),
            top: 0,
            free: BTreeMap::new(),
            live: FxHashMap::default(),
        }
    }

    /// Current soft limit.
    #[inline]
    pub fn footprint_limit(&self) -> usize {
        self.footprint_limit
    }

    /// Bytes carved so far (live plus free blocks below `top`).
    #[inline]
    pub fn footprint(&self) -> usize {
        self.top
    }

    /// Number of live blocks.
    #[inline]
    pub fn allocation_count(&self) -> usize {
        self.live.len()
    }

    /// Check whether `addr` is inside the managed range.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.reserved
    }

    /// Raise or lower the soft ceiling.
    ///
    /// Lowering below the current footprint stops growth and reuse above the
    /// limit; existing blocks are untouched.
    pub fn set_footprint_limit(&mut self, bytes: usize) {
        self.footprint_limit = align_down(bytes.min(self.reserved), ALLOCATION_GRANULE);
    }

    /// Allocate `size` bytes aligned to `alignment`.
    ///
    /// Returns `None` when the request does not fit under the footprint
    /// limit, including sizes too large to round. Never raises the limit.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        debug_assert!(alignment.is_power_of_two());
        let alignment = alignment.max(ALLOCATION_GRANULE);
        let size = checked_align_up(size.max(1), ALLOCATION_GRANULE)?;
        let limit = self.footprint_limit;

        let offset = match self.take_first_fit(size, alignment, limit) {
            Some(offset) => offset,
            None => self.carve(size, alignment, limit)?,
        };

        self.live.insert(offset, size);
        NonNull::new((self.base + offset) as *mut u8)
    }

    /// Release a block previously returned by [`allocate`](Self::allocate).
    ///
    /// Freeing a foreign or already freed pointer is a caller bug.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        debug_assert!(self.contains(addr), "{:?} freeing foreign pointer {:p}", self.kind, ptr);
        let offset = addr.wrapping_sub(self.base);
        let Some(size) = self.live.remove(&offset) else {
            debug_assert!(false, "{:?} double free of {:p}", self.kind, ptr);
            return;
        };
        self.release(offset, size);
    }

    /// Size of the live block at `ptr`, if any.
    #[inline]
    pub fn allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.base)?;
        self.live.get(&offset).copied()
    }

    /// Visit every live block as `(address, size)`.
    pub fn inspect_all<F>(&self, mut f: F)
    where
        F: FnMut(usize, usize),
    {
        for (&offset, &size) in &self.live {
            f(self.base + offset, size);
        }
    }

    /// Total bytes in live blocks. Walks the live table; does not mutate.
    pub fn inspect_allocated_bytes(&self) -> usize {
        let mut total = 0;
        self.inspect_all(|_, size| total += size);
        total
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    /// Reuse the lowest free block that fits.
    fn take_first_fit(&mut self, size: usize, alignment: usize, limit: usize) -> Option<usize> {
        let (block, block_size, start) = self.free.iter().find_map(|(&offset, &len)| {
            let start = align_up(self.base + offset, alignment) - self.base;
            let end = start.checked_add(size)?;
            (end <= offset + len && end <= limit).then_some((offset, len, start))
        })?;

        self.free.remove(&block);
        if start > block {
            self.free.insert(block, start - block);
        }
        let tail = block + block_size - (start + size);
        if tail > 0 {
            self.free.insert(start + size, tail);
        }
        Some(start)
    }

    /// Extend the footprint at `top`.
    fn carve(&mut self, size: usize, alignment: usize, limit: usize) -> Option<usize> {
        let start = checked_align_up(self.base + self.top, alignment)? - self.base;
        let end = start.checked_add(size)?;
        if end > limit {
            return None;
        }
        if start > self.top {
            // No free block ends at `top`, so the alignment gap has no
            // neighbour to merge with.
            self.free.insert(self.top, start - self.top);
        }
        self.top = end;
        Some(start)
    }

    /// Return `[offset, offset + size)` to the free list, coalescing with
    /// neighbours and trimming the footprint when the block ends at `top`.
    fn release(&mut self, mut offset: usize, mut size: usize) {
        if let Some((&prev, &prev_size)) = self.free.range(..offset).next_back() {
            if prev + prev_size == offset {
                self.free.remove(&prev);
                offset = prev;
                size += prev_size;
            }
        }
        if let Some(next_size) = self.free.remove(&(offset + size)) {
            size += next_size;
        }

        if offset + size == self.top {
            self.top = offset;
        } else {
            self.free.insert(offset, size);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x10_0000;

    fn allocator(reserved: usize, limit: usize) -> RegionAllocator {
        RegionAllocator::new(
            RegionKind::Data,
            NonNull::new(BASE as *mut u8).unwrap(),
            reserved,
            limit,
        )
    }

    fn addr(ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize
    }

    #[test]
    fn test_allocate_rounds_to_granule() {
        let mut alloc = allocator(4096, 4096);
        let a = alloc.allocate(1, 8).unwrap();
        let b = alloc.allocate(17, 8).unwrap();
        assert_eq!(addr(a), BASE);
        assert_eq!(addr(b), BASE + ALLOCATION_GRANULE);
        assert_eq!(alloc.allocation_size(b), Some(32));
        assert_eq!(alloc.inspect_allocated_bytes(), 48);
        assert_eq!(alloc.footprint(), 48);
    }

    #[test]
    fn test_alignment_respected() {
        let mut alloc = allocator(4096, 4096);
        alloc.allocate(16, 16).unwrap();
        let aligned = alloc.allocate(16, 256).unwrap();
        assert_eq!(addr(aligned) % 256, 0);
        // The alignment gap is reusable.
        let small = alloc.allocate(16, 16).unwrap();
        assert_eq!(addr(small), BASE + 16);
    }

    #[test]
    fn test_footprint_limit_is_respected() {
        let mut alloc = allocator(4096, 64);
        assert!(alloc.allocate(64, 16).is_some());
        assert!(alloc.allocate(16, 16).is_none());

        alloc.set_footprint_limit(128);
        assert!(alloc.allocate(16, 16).is_some());
        assert_eq!(alloc.footprint_limit(), 128);
    }

    #[test]
    fn test_footprint_limit_clamped_to_reserved() {
        let mut alloc = allocator(1024, 1024);
        alloc.set_footprint_limit(1 << 20);
        assert_eq!(alloc.footprint_limit(), 1024);
        assert!(alloc.allocate(2048, 16).is_none());
    }

    #[test]
    fn test_free_coalesces_and_reuses() {
        let mut alloc = allocator(4096, 4096);
        let a = alloc.allocate(32, 16).unwrap();
        let b = alloc.allocate(32, 16).unwrap();
        let _c = alloc.allocate(32, 16).unwrap();

        alloc.free(a);
        alloc.free(b);
        // a and b merged into one 64-byte hole at the base.
        let big = alloc.allocate(64, 16).unwrap();
        assert_eq!(addr(big), BASE);
        assert_eq!(alloc.footprint(), 96);
    }

    #[test]
    fn test_free_at_top_shrinks_footprint() {
        let mut alloc = allocator(4096, 4096);
        let a = alloc.allocate(32, 16).unwrap();
        let b = alloc.allocate(32, 16).unwrap();
        alloc.free(a);
        assert_eq!(alloc.footprint(), 64);
        alloc.free(b);
        assert_eq!(alloc.footprint(), 0);
        assert_eq!(alloc.inspect_allocated_bytes(), 0);
        assert_eq!(alloc.allocation_count(), 0);
    }

    #[test]
    fn test_lowered_limit_blocks_reuse_above_it() {
        let mut alloc = allocator(4096, 4096);
        let _a = alloc.allocate(64, 16).unwrap();
        let b = alloc.allocate(64, 16).unwrap();
        let _c = alloc.allocate(64, 16).unwrap();
        alloc.free(b);

        alloc.set_footprint_limit(64);
        assert!(alloc.allocate(64, 16).is_none());
    }

    #[test]
    fn test_oversized_request_fails_cleanly() {
        let mut alloc = allocator(4096, 4096);
        assert!(alloc.allocate(usize::MAX, 16).is_none());
        assert!(alloc.allocate(usize::MAX - 8, 16).is_none());
        assert_eq!(alloc.footprint(), 0);
        assert_eq!(checked_align_up(usize::MAX, 8), None);
        assert_eq!(checked_align_up(17, 16), Some(32));

        // A hole below top goes through first fit; it must not overflow either.
        let a = alloc.allocate(32, 16).unwrap();
        let _b = alloc.allocate(32, 16).unwrap();
        alloc.free(a);
        assert!(alloc.allocate(usize::MAX - 64, 16).is_none());
    }

    #[test]
    fn test_inspect_all_visits_live_blocks() {
        let mut alloc = allocator(4096, 4096);
        let a = alloc.allocate(16, 16).unwrap();
        let b = alloc.allocate(48, 16).unwrap();
        let mut seen = Vec::new();
        alloc.inspect_all(|addr, size| seen.push((addr, size)));
        seen.sort();
        assert_eq!(seen, vec![(addr(a), 16), (addr(b), 48)]);
    }
}
