use std::ptr::NonNull;

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(not(target_os = "linux"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;
    }

    /// Anonymous, zero-filled, read/write mapping.
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: no fixed address is requested, the kernel picks one
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// must be allocated by `anonymous_mmap` with the same length
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// Maps `size` bytes of zeroed memory for a heap region.
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }
    #[cfg(unix)]
    {
        // SAFETY: result is null-checked below
        let ptr = unsafe { unix::anonymous_mmap(size) };
        NonNull::new(ptr)
    }
    #[cfg(not(unix))]
    {
        let layout = std::alloc::Layout::from_size_align(size, OS_PAGE_SIZE).ok()?;
        // SAFETY: layout has non-zero size
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }
}

/// Releases memory obtained from [`map_memory`].
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    #[cfg(unix)]
    {
        // SAFETY: ptr must be from a `map_memory` call of the same size
        unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
    }
    #[cfg(not(unix))]
    {
        if let Ok(layout) =
            std::alloc::Layout::from_size_align(size, OS_PAGE_SIZE)
        {
            // SAFETY: allocated by `map_memory` with this layout
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}
