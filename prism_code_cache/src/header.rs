//! Method header layout for committed code.
//!
//! Every compiled entry is one allocation in the code half:
//!
//! ```text
//! allocation                               code (INSTRUCTION_ALIGNMENT aligned)
//!   |<---------- HEADER_ALLOCATION_SIZE ---------->|
//!   +-------------+--------------------------------+---------------------------+
//!   |  padding    |        MethodHeader            |  native instructions ...  |
//!   +-------------+--------------------------------+---------------------------+
//! ```
//!
//! The header sits immediately before the code. It stores 32-bit offsets
//! *backwards* from the code start to the auxiliary tables in the data half,
//! which always lies below the code half. An offset of zero means absent.
//!
//! All address arithmetic between allocation, header and code goes through
//! the conversion functions in this module.

use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use crate::allocator::align_up;

// =============================================================================
// Instruction alignment
// =============================================================================

/// Alignment of the first instruction of every committed method.
#[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
pub const INSTRUCTION_ALIGNMENT: usize = 16;

/// Alignment of the first instruction of every committed method.
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
pub const INSTRUCTION_ALIGNMENT: usize = 8;

/// Bytes reserved in front of the code for the header, rounded so the code
/// stays instruction aligned.
pub const HEADER_ALLOCATION_SIZE: usize =
    align_up(mem::size_of::<MethodHeader>(), INSTRUCTION_ALIGNMENT);

/// Allocation start for a code pointer.
#[inline]
pub const fn allocation_from_code(code: usize) -> usize {
    code - HEADER_ALLOCATION_SIZE
}

/// Code pointer for an allocation start.
#[inline]
pub const fn code_from_allocation(allocation: usize) -> usize {
    allocation + HEADER_ALLOCATION_SIZE
}

/// Header address for a code pointer.
#[inline]
pub const fn header_from_code(code: usize) -> usize {
    code - mem::size_of::<MethodHeader>()
}

// =============================================================================
// FrameInfo
// =============================================================================

/// Frame layout of a compiled method, produced by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct FrameInfo {
    /// Total frame size including spills and the return address.
    pub frame_size_in_bytes: u32,
    /// Callee-saved general purpose registers spilled in the prologue.
    pub core_spill_mask: u32,
    /// Callee-saved floating point registers spilled in the prologue.
    pub fp_spill_mask: u32,
}

impl FrameInfo {
    /// Create frame info.
    #[inline]
    pub const fn new(frame_size_in_bytes: u32, core_spill_mask: u32, fp_spill_mask: u32) -> Self {
        Self {
            frame_size_in_bytes,
            core_spill_mask,
            fp_spill_mask,
        }
    }
}

// =============================================================================
// MethodHeader
// =============================================================================

/// Metadata stored in front of every committed method.
///
/// Offset fields are written once at commit time and never change until the
/// entry is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MethodHeader {
    mapping_table_offset: u32,
    vmap_table_offset: u32,
    gc_map_offset: u32,
    frame_info: FrameInfo,
    code_size: u32,
}

impl MethodHeader {
    /// Build a header for code that will live at `code`.
    ///
    /// Tables must live below `code` and within 4GB of it.
    pub fn new(
        code: usize,
        mapping_table: Option<NonNull<u8>>,
        vmap_table: Option<NonNull<u8>>,
        gc_map: Option<NonNull<u8>>,
        frame_info: FrameInfo,
        code_size: u32,
    ) -> Self {
        Self {
            mapping_table_offset: Self::offset_to(code, mapping_table),
            vmap_table_offset: Self::offset_to(code, vmap_table),
            gc_map_offset: Self::offset_to(code, gc_map),
            frame_info,
            code_size,
        }
    }

    fn offset_to(code: usize, table: Option<NonNull<u8>>) -> u32 {
        match table {
            None => 0,
            Some(table) => {
                let table = table.as_ptr() as usize;
                debug_assert!(table < code, "auxiliary table must precede code");
                let offset = code - table;
                debug_assert!(offset <= u32::MAX as usize);
                offset as u32
            }
        }
    }

    fn table_at(&self, offset: u32) -> Option<NonNull<u8>> {
        if offset == 0 {
            None
        } else {
            NonNull::new((self.code_ptr() as usize - offset as usize) as *mut u8)
        }
    }

    /// Start of the native instructions.
    #[inline]
    pub fn code_ptr(&self) -> *const u8 {
        (self as *const Self as usize + mem::size_of::<Self>()) as *const u8
    }

    /// Size of the native instructions.
    #[inline]
    pub fn code_size(&self) -> usize {
        self.code_size as usize
    }

    /// Frame layout.
    #[inline]
    pub fn frame_info(&self) -> FrameInfo {
        self.frame_info
    }

    /// Native pc to bytecode offset table.
    #[inline]
    pub fn mapping_table(&self) -> Option<NonNull<u8>> {
        self.table_at(self.mapping_table_offset)
    }

    /// Register/stack value map.
    #[inline]
    pub fn vmap_table(&self) -> Option<NonNull<u8>> {
        self.table_at(self.vmap_table_offset)
    }

    /// Native GC map for the managed heap.
    #[inline]
    pub fn gc_map(&self) -> Option<NonNull<u8>> {
        self.table_at(self.gc_map_offset)
    }

    /// Check whether `pc` belongs to this method.
    ///
    /// The end is inclusive: a call in tail position returns to the first
    /// byte past the code.
    #[inline]
    pub fn contains(&self, pc: usize) -> bool {
        let start = self.code_ptr() as usize;
        pc >= start && pc <= start + self.code_size()
    }
}

// =============================================================================
// HeaderRef
// =============================================================================

/// Handle to the header of a committed entry.
///
/// The lifetime keeps the cache, and so the mapping, alive. It does not pin
/// the entry: a sweeping collection frees every entry that was not on a
/// stack, and the memory is reused afterwards. Reading the header is
/// therefore `unsafe`; only the code address is available safely.
///
/// ```compile_fail
/// # fn read(header: prism_code_cache::HeaderRef<'_>) -> usize {
/// header.code_size()
/// # }
/// ```
#[derive(Clone, Copy)]
pub struct HeaderRef<'a> {
    ptr: NonNull<MethodHeader>,
    _cache: PhantomData<&'a MethodHeader>,
}

impl<'a> HeaderRef<'a> {
    /// Wrap the header in front of `code`.
    ///
    /// # Safety
    /// `code` must be the code pointer of a committed entry in a cache that
    /// outlives the returned reference.
    #[inline]
    pub(crate) unsafe fn from_code(code: usize) -> Self {
        Self {
            ptr: unsafe { NonNull::new_unchecked(header_from_code(code) as *mut MethodHeader) },
            _cache: PhantomData,
        }
    }

    /// Raw header pointer.
    #[inline]
    pub fn as_ptr(&self) -> *const MethodHeader {
        self.ptr.as_ptr()
    }

    /// Start of the native instructions. Does not read the header.
    #[inline]
    pub fn code_ptr(&self) -> *const u8 {
        (self.ptr.as_ptr() as usize + mem::size_of::<MethodHeader>()) as *const u8
    }

    /// The header itself.
    ///
    /// # Safety
    /// The entry must not have been freed since this handle was obtained.
    /// That holds while no sweeping collection has run since, or while a
    /// stack that collections walk returns into the code.
    #[inline]
    pub unsafe fn get(&self) -> &'a MethodHeader {
        unsafe { self.ptr.as_ref() }
    }
}

impl PartialEq for HeaderRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl Eq for HeaderRef<'_> {}

impl std::fmt::Debug for HeaderRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HeaderRef").field(&self.code_ptr()).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
