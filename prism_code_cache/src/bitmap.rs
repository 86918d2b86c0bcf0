//! Lock-free liveness bitmap over the code half.
//!
//! Built fresh for every collection that sweeps and dropped at its end.
//! Mutator threads set bits concurrently from checkpoints, so every update
//! is a single `fetch_or`; this is the only lock-free write path in the cache.
//!
//! ```text
//! code half: [base, base + coverage)
//!
//!   +------+------+------+------+
//!   | W0   | W1   | W2   | ...  |   one bit per ALLOCATION_GRANULE bytes
//!   +------+------+------+------+
//!
//!   bit N of word W  ->  base + (W * 64 + N) * granularity
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::allocator::ALLOCATION_GRANULE;

/// Bits per word (AtomicU64).
const BITS_PER_WORD: usize = 64;

/// Log2 of bits per word, for shift-based division.
const LOG2_BITS_PER_WORD: u32 = 6;

/// Mask for extracting bit index within a word.
const BIT_INDEX_MASK: usize = BITS_PER_WORD - 1;

// =============================================================================
// LivenessBitmap
// =============================================================================

/// Atomic bitmap marking allocation starts found on live stacks.
pub struct LivenessBitmap {
    words: Box<[AtomicU64]>,
    base: usize,
    granule_count: usize,
    granularity_shift: u32,
}

impl LivenessBitmap {
    /// Create a bitmap covering `[base, base + size)` at allocation granularity.
    pub fn new(base: usize, size: usize) -> Self {
        Self::with_granularity(base, size, ALLOCATION_GRANULE)
    }

    /// Create a bitmap with a custom granularity.
    ///
    /// # Panics
    ///
    /// Panics if `granularity` is not a power of two or `size` is 0.
    pub fn with_granularity(base: usize, size: usize, granularity: usize) -> Self {
        assert!(size > 0, "Bitmap size must be > 0");
        assert!(
            granularity.is_power_of_two(),
            "Granularity must be a power of two"
        );

        let granularity_shift = granularity.trailing_zeros();
        let granule_count = (size + granularity - 1) >> granularity_shift;
        let word_count = (granule_count + BITS_PER_WORD - 1) >> LOG2_BITS_PER_WORD;

        let words: Vec<AtomicU64> = (0..word_count).map(|_| AtomicU64::new(0)).collect();

        Self {
            words: words.into_boxed_slice(),
            base,
            granule_count,
            granularity_shift,
        }
    }

    // =========================================================================
    // Core Operations
    // =========================================================================

    /// Set the bit for `addr` and return its previous value.
    ///
    /// Returns `None` if `addr` is outside the covered range.
    #[inline]
    pub fn atomic_test_and_set(&self, addr: usize) -> Option<bool> {
        let (word_idx, bit_mask) = self.addr_to_indices(addr)?;
        let prev = self.words[word_idx].fetch_or(bit_mask, Ordering::AcqRel);
        Some((prev & bit_mask) != 0)
    }

    /// Test the bit for `addr`. Out-of-range addresses are unmarked.
    #[inline]
    pub fn test(&self, addr: usize) -> bool {
        match self.addr_to_indices(addr) {
            Some((word_idx, bit_mask)) => {
                (self.words[word_idx].load(Ordering::Acquire) & bit_mask) != 0
            }
            None => false,
        }
    }

    /// Count set bits.
    pub fn marked_count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    // =========================================================================
    // Capacity / Info
    // =========================================================================

    /// Base address of the covered region.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Total coverage in bytes.
    #[inline]
    pub fn coverage(&self) -> usize {
        self.granule_count << self.granularity_shift
    }

    /// Check if an address is within the covered range.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.coverage()
    }

    #[inline(always)]
    fn addr_to_indices(&self, addr: usize) -> Option<(usize, u64)> {
        let offset = addr.checked_sub(self.base)?;
        let granule_idx = offset >> self.granularity_shift;
        if granule_idx >= self.granule_count {
            return None;
        }
        let word_idx = granule_idx >> LOG2_BITS_PER_WORD;
        let bit_mask = 1u64 << (granule_idx & BIT_INDEX_MASK);
        Some((word_idx, bit_mask))
    }
}

impl std::fmt::Debug for LivenessBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessBitmap")
            .field("base", &format_args!("0x{:x}", self.base))
            .field("coverage", &self.coverage())
            .field("marked", &self.marked_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
