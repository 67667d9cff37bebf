//! Executable memory and W^X page protection.
//!
//! Live patch targets need two things from the OS: a home
//! ([`ExecutableRegion`], allocated writable, sealed executable once code
//! has been copied in) and a way to briefly reopen pages for patching
//! ([`PageProtector`]). A page is never left both writable and executable;
//! every patch runs inside a writable window that is closed again before
//! the patcher returns, followed by a full fence so the new bytes are
//! visible before any thread can be steered onto them.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};

// =============================================================================
// Platform
// =============================================================================

#[cfg(unix)]
mod platform {
    use std::ptr;

    pub fn page_size() -> usize {
        // SAFETY: sysconf is safe to call with _SC_PAGESIZE
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    /// Allocate `size` bytes of read-write memory.
    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        // SAFETY: anonymous private mapping with no fixed address
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
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    /// Free memory allocated with `alloc_rw`.
    pub unsafe fn free(ptr: *mut u8, size: usize) {
        // SAFETY: caller passes a live alloc_rw mapping
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }

    /// Make `[addr, addr + len)` read-write. Page-aligned input required.
    pub unsafe fn protect_rw(addr: *mut u8, len: usize) -> bool {
        // SAFETY: caller guarantees the span is mapped and page-aligned
        unsafe { libc::mprotect(addr as *mut _, len, libc::PROT_READ | libc::PROT_WRITE) == 0 }
    }

    /// Make `[addr, addr + len)` read-execute. Page-aligned input required.
    pub unsafe fn protect_rx(addr: *mut u8, len: usize) -> bool {
        // SAFETY: caller guarantees the span is mapped and page-aligned
        unsafe { libc::mprotect(addr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) == 0 }
    }
}

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READ, PAGE_READWRITE,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    pub fn page_size() -> usize {
        // SAFETY: SYSTEM_INFO can be zero-initialized and GetSystemInfo always succeeds
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }

    /// Allocate `size` bytes of read-write memory.
    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        // SAFETY: committing a fresh reservation at no fixed address
        unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) as *mut u8
        }
    }

    /// Free memory allocated with `alloc_rw`.
    pub unsafe fn free(ptr: *mut u8, _size: usize) {
        // SAFETY: caller passes a live VirtualAlloc base address
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }

    /// Make `[addr, addr + len)` read-write. Page-aligned input required.
    pub unsafe fn protect_rw(addr: *mut u8, len: usize) -> bool {
        let mut old_protect = 0;
        // SAFETY: caller guarantees the span is mapped and page-aligned
        unsafe { VirtualProtect(addr as *mut _, len, PAGE_READWRITE, &mut old_protect) != 0 }
    }

    /// Make `[addr, addr + len)` read-execute. Page-aligned input required.
    pub unsafe fn protect_rx(addr: *mut u8, len: usize) -> bool {
        let mut old_protect = 0;
        // SAFETY: caller guarantees the span is mapped and page-aligned
        unsafe { VirtualProtect(addr as *mut _, len, PAGE_EXECUTE_READ, &mut old_protect) != 0 }
    }
}

// =============================================================================
// Page Protector
// =============================================================================

/// Opens a temporary writable window over executable pages.
///
/// The window covers every page touched by the requested span. The pages go
/// back to read-execute before `with_writable` returns, whether or not the
/// patch closure succeeded, and a `SeqCst` fence publishes the written
/// bytes.
#[derive(Debug)]
pub struct PageProtector {
    page_size: usize,
}

impl Default for PageProtector {
    fn default() -> Self {
        Self::new()
    }
}

impl PageProtector {
    /// Create a protector for the system page size.
    pub fn new() -> Self {
        Self {
            page_size: platform::page_size(),
        }
    }

    /// The page size used for alignment.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Run `patch` while the pages covering `[addr, addr + len)` are
    /// writable, then restore them to read-execute.
    ///
    /// # Safety
    /// The span must lie inside a live executable mapping (an
    /// [`ExecutableRegion`] or equivalent), and no thread may be executing
    /// the bytes being rewritten unless the caller holds them at a
    /// safepoint.
    pub unsafe fn with_writable<R>(
        &self,
        addr: *mut u8,
        len: usize,
        patch: impl FnOnce() -> R,
    ) -> io::Result<R> {
        let (span_start, span_len) = self.page_span(addr as usize, len);

        // SAFETY: caller guarantees the span is mapped; the span is
        // page-aligned by construction
        if !unsafe { platform::protect_rw(span_start as *mut u8, span_len) } {
            return Err(io::Error::last_os_error());
        }

        let result = patch();

        // SAFETY: same span as above
        let restored = unsafe { platform::protect_rx(span_start as *mut u8, span_len) };

        fence(Ordering::SeqCst);

        if !restored {
            return Err(io::Error::last_os_error());
        }
        Ok(result)
    }

    /// Page-aligned start and length covering `[addr, addr + len)`.
    fn page_span(&self, addr: usize, len: usize) -> (usize, usize) {
        let start = addr & !(self.page_size - 1);
        let end = addr + len.max(1);
        let end_aligned = (end + self.page_size - 1) & !(self.page_size - 1);
        (start, end_aligned - start)
    }
}

// =============================================================================
// Executable Region
// =============================================================================

/// A region of memory holding live code, with a write-then-seal lifecycle.
///
/// The region is allocated read-write, filled by the image writer or the
/// runtime, and sealed read-execute before anything jumps into it. After
/// sealing, individual patches reopen pages through a [`PageProtector`];
/// the region itself never becomes wholesale writable again.
pub struct ExecutableRegion {
    ptr: NonNull<u8>,
    capacity: usize,
    len: usize,
    sealed: bool,
}

impl ExecutableRegion {
    /// Allocate a region of at least `min_capacity` bytes, rounded up to
    /// the page size.
    pub fn new(min_capacity: usize) -> io::Result<Self> {
        let page_size = platform::page_size();
        let capacity = (min_capacity.max(1) + page_size - 1) & !(page_size - 1);

        // SAFETY: fresh anonymous allocation of a page-rounded size
        let ptr = unsafe { platform::alloc_rw(capacity) };
        let ptr = NonNull::new(ptr).ok_or_else(io::Error::last_os_error)?;

        Ok(Self {
            ptr,
            capacity,
            len: 0,
            sealed: false,
        })
    }

    /// Bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been written yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total page-rounded capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the region has been sealed executable.
    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Base address of the region.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Address of a byte offset inside the region.
    ///
    /// # Panics
    /// Panics if `offset` is past the written length.
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.len, "offset past the written region");
        // SAFETY: offset is within the allocation
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    /// The written bytes. Readable before and after sealing.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: [0, len) is initialized and the mapping stays readable
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Append bytes and return their start offset.
    ///
    /// # Panics
    /// Panics when the region is sealed or the bytes do not fit.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        assert!(!self.sealed, "cannot write to a sealed region");
        assert!(
            self.len + bytes.len() <= self.capacity,
            "executable region overflow"
        );

        let offset = self.len;
        // SAFETY: destination is in-bounds, region is writable until sealed
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(offset),
                bytes.len(),
            );
        }
        self.len += bytes.len();
        offset
    }

    /// Reserve `count` zeroed bytes and return their start offset.
    ///
    /// # Panics
    /// Panics when the region is sealed or the bytes do not fit.
    pub fn reserve(&mut self, count: usize) -> usize {
        assert!(!self.sealed, "cannot reserve in a sealed region");
        assert!(self.len + count <= self.capacity, "executable region overflow");
        let offset = self.len;
        self.len += count;
        offset
    }

    /// Seal the region read-execute. Idempotent.
    pub fn seal(&mut self) -> io::Result<()> {
        if self.sealed {
            return Ok(());
        }
        // SAFETY: sealing the whole page-rounded allocation
        if !unsafe { platform::protect_rx(self.ptr.as_ptr(), self.capacity) } {
            return Err(io::Error::last_os_error());
        }
        fence(Ordering::SeqCst);
        self.sealed = true;
        Ok(())
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/capacity came from alloc_rw and are dropped once
        unsafe {
            platform::free(self.ptr.as_ptr(), self.capacity);
        }
    }
}

// SAFETY: the region is a plain allocation; concurrent access is governed
// by the patching protocol, not by this type.
unsafe impl Send for ExecutableRegion {}
unsafe impl Sync for ExecutableRegion {}

// =============================================================================
// Tests
// =============================================================================
