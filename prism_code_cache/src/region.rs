//! Reserved executable memory for the code cache.
//!
//! One mapping of `max_capacity` bytes is reserved at startup and split in
//! two halves:
//!
//! ```text
//! begin                      divider                        end
//!   +---------------------------+-----------------------------+
//!   |   data (read-write)       |   code (read-execute)       |
//!   +---------------------------+-----------------------------+
//! ```
//!
//! The data half is always writable. The code half is read-execute except
//! while a [`ScopedCodeWrite`] is alive, during which it is
//! read-write-execute so committed code can be copied in or freed.
//!
//! # Safety
//! A failed protection change leaves the cache in a state where executable
//! code may be writable (or unexecutable), so it aborts the process.

use std::io;
use std::ptr::NonNull;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::error::CodeCacheError;

// =============================================================================
// Platform-specific imports
// =============================================================================

/// Page protection for one half of the reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Read-write, used for the data half.
    Data,
    /// Read-execute, the resting state of the code half.
    Code,
    /// Read-write-execute, only inside a [`ScopedCodeWrite`].
    All,
}

#[cfg(windows)]
mod platform {
    use std::{io, mem, ptr};
    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
        PAGE_READWRITE, VirtualAlloc, VirtualFree, VirtualProtect,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    use super::Protection;

    pub fn page_size() -> usize {
        unsafe {
            let mut info: SYSTEM_INFO = mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        }
    }

    /// Reserve and commit `size` bytes of read-write memory.
    pub unsafe fn map(size: usize) -> io::Result<*mut u8> {
        let ptr = unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) as *mut u8
        };
        if ptr.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr)
        }
    }

    pub unsafe fn unmap(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }

    pub unsafe fn protect(ptr: *mut u8, size: usize, prot: Protection) -> io::Result<()> {
        let flags = match prot {
            Protection::Data => PAGE_READWRITE,
            Protection::Code => PAGE_EXECUTE_READ,
            Protection::All => PAGE_EXECUTE_READWRITE,
        };
        let mut old_protect = 0;
        if unsafe { VirtualProtect(ptr as *mut _, size, flags, &mut old_protect) } != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    pub unsafe fn flush_instruction_cache(ptr: *const u8, size: usize) {
        unsafe {
            FlushInstructionCache(GetCurrentProcess(), ptr as *const _, size);
        }
    }
}

#[cfg(unix)]
mod platform {
    use std::{io, ptr};

    use super::Protection;

    pub fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }

    /// Reserve `size` bytes of read-write memory.
    pub unsafe fn map(size: usize) -> io::Result<*mut u8> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as *mut u8)
        }
    }

    pub unsafe fn unmap(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }

    pub unsafe fn protect(ptr: *mut u8, size: usize, prot: Protection) -> io::Result<()> {
        let flags = match prot {
            Protection::Data => libc::PROT_READ | libc::PROT_WRITE,
            Protection::Code => libc::PROT_READ | libc::PROT_EXEC,
            Protection::All => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        };
        if unsafe { libc::mprotect(ptr as *mut _, size, flags) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub unsafe fn flush_instruction_cache(_ptr: *const u8, _size: usize) {
        // Instruction and data caches are coherent on x86.
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    pub unsafe fn flush_instruction_cache(ptr: *const u8, size: usize) {
        unsafe extern "C" {
            fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
        }
        unsafe {
            __clear_cache(
                ptr as *mut libc::c_char,
                ptr.add(size) as *mut libc::c_char,
            );
        }
    }
}

/// OS page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(platform::page_size)
}

/// Make freshly written code at `[ptr, ptr + size)` visible to instruction fetch.
pub fn flush_instruction_cache(ptr: *const u8, size: usize) {
    unsafe { platform::flush_instruction_cache(ptr, size) }
}

/// Change protection or abort the process.
fn protect_or_abort(ptr: *mut u8, size: usize, prot: Protection) {
    if let Err(err) = unsafe { platform::protect(ptr, size, prot) } {
        log::error!(
            "Failed to change jit code cache protection to {:?} at {:p}+{:#x}: {}",
            prot,
            ptr,
            size,
            err
        );
        std::process::abort();
    }
}

// =============================================================================
// ReservedRegion
// =============================================================================

/// The code cache's address reservation.
///
/// Address-stable for its whole lifetime. The split between the data and
/// code halves is fixed at construction.
pub struct ReservedRegion {
    /// Start of the mapping (and of the data half).
    begin: NonNull<u8>,
    /// Total mapped size.
    size: usize,
    /// Size of the data half; the code half starts here.
    data_size: usize,
    /// Number of live [`ScopedCodeWrite`] guards. Held across every
    /// protection change so a guard never observes a half-made flip.
    write_depth: Mutex<usize>,
}

impl ReservedRegion {
    /// Reserve `size` bytes and apply the resting protections.
    ///
    /// `size` must be a multiple of two pages so both halves are page aligned.
    pub fn reserve(size: usize) -> Result<Self, CodeCacheError> {
        debug_assert_eq!(size % (2 * page_size()), 0);

        let begin = unsafe { platform::map(size) }
            .and_then(|ptr| {
                NonNull::new(ptr).ok_or_else(|| io::Error::other("mapping returned null"))
            })
            .map_err(|source| CodeCacheError::MapFailed { size, source })?;

        let region = Self {
            begin,
            size,
            data_size: size / 2,
            write_depth: Mutex::new(0),
        };
        protect_or_abort(region.code_begin_mut(), region.code_size(), Protection::Code);
        protect_or_abort(region.begin.as_ptr(), region.data_size, Protection::Data);
        Ok(region)
    }

    /// Start of the data half.
    #[inline]
    pub fn data_begin(&self) -> *mut u8 {
        self.begin.as_ptr()
    }

    /// Size of the data half.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Start of the code half.
    #[inline]
    pub fn code_begin(&self) -> *const u8 {
        self.code_begin_mut()
    }

    #[inline]
    fn code_begin_mut(&self) -> *mut u8 {
        unsafe { self.begin.as_ptr().add(self.data_size) }
    }

    /// Size of the code half.
    #[inline]
    pub fn code_size(&self) -> usize {
        self.size - self.data_size
    }

    /// Total reserved size.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check whether `addr` lies inside the code half. Lock-free.
    #[inline]
    pub fn contains_code(&self, addr: usize) -> bool {
        let begin = self.code_begin() as usize;
        addr >= begin && addr < begin + self.code_size()
    }

    /// Check whether `addr` lies inside the data half.
    #[inline]
    pub fn contains_data(&self, addr: usize) -> bool {
        let begin = self.data_begin() as usize;
        addr >= begin && addr < begin + self.data_size
    }

    /// Whether the code half is currently writable.
    #[inline]
    pub fn is_code_writable(&self) -> bool {
        *self.write_depth.lock() > 0
    }

    /// Open a write window over the code half.
    ///
    /// Guards may be opened from any thread and nest; the code half stays
    /// writable until the last one drops.
    #[inline]
    pub fn scoped_code_write(&self) -> ScopedCodeWrite<'_> {
        ScopedCodeWrite::new(self)
    }
}

impl Drop for ReservedRegion {
    fn drop(&mut self) {
        debug_assert!(!self.is_code_writable());
        unsafe {
            platform::unmap(self.begin.as_ptr(), self.size);
        }
    }
}

impl std::fmt::Debug for ReservedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservedRegion")
            .field("begin", &self.begin)
            .field("size", &self.size)
            .field("data_size", &self.data_size)
            .field("code_writable", &self.is_code_writable())
            .finish()
    }
}

// The mapping is owned exclusively; mutation of its contents is
// synchronized by the cache lock.
unsafe impl Send for ReservedRegion {}
unsafe impl Sync for ReservedRegion {}

// =============================================================================
// ScopedCodeWrite
// =============================================================================

/// RAII guard that keeps the code half read-write-execute.
///
/// Restores read-execute on drop, including on early return.
pub struct ScopedCodeWrite<'a> {
    region: &'a ReservedRegion,
}

impl<'a> ScopedCodeWrite<'a> {
    fn new(region: &'a ReservedRegion) -> Self {
        let mut depth = region.write_depth.lock();
        if *depth == 0 {
            protect_or_abort(region.code_begin_mut(), region.code_size(), Protection::All);
        }
        *depth += 1;
        Self { region }
    }
}

impl Drop for ScopedCodeWrite<'_> {
    fn drop(&mut self) {
        let region = self.region;
        let mut depth = region.write_depth.lock();
        *depth -= 1;
        if *depth == 0 {
            protect_or_abort(region.code_begin_mut(), region.code_size(), Protection::Code);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
