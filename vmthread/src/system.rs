//! Page-granular memory straight from the OS, used for isolate heaps and
//! the VM heap.
use std::ptr::NonNull;

#[cfg(unix)]
mod posix {
    use core::ffi::c_void;
    use core::ptr;

    const READ_WRITE: i32 = 0x1 | 0x2;
    const PRIVATE: i32 = 0x02;
    #[cfg(target_os = "linux")]
    const ANONYMOUS: i32 = 0x20;
    #[cfg(not(target_os = "linux"))]
    const ANONYMOUS: i32 = 0x1000;

    unsafe extern "C" {
        fn mmap(
            addr: *mut c_void,
            len: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            off: isize,
        ) -> *mut c_void;
        fn munmap(addr: *mut c_void, len: usize) -> i32;
    }

    /// Returns null on failure.
    pub unsafe fn reserve(len: usize) -> *mut u8 {
        // SAFETY: anonymous private mapping, no fd involved
        let mapped = unsafe { mmap(ptr::null_mut(), len, READ_WRITE, PRIVATE | ANONYMOUS, -1, 0) };
        match mapped as isize {
            -1 => ptr::null_mut(),
            _ => mapped.cast(),
        }
    }

    pub unsafe fn release(base: *mut u8, len: usize) {
        // SAFETY: contract of the caller
        if unsafe { munmap(base.cast(), len) } != 0 {
            log::warn!("munmap of {len} bytes at {base:p} failed");
        }
    }
}

#[cfg(not(unix))]
mod fallback {
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    use super::OS_PAGE_SIZE;

    pub unsafe fn reserve(len: usize) -> *mut u8 {
        match Layout::from_size_align(len, OS_PAGE_SIZE) {
            // SAFETY: len > 0 is checked by map_memory
            Ok(layout) => unsafe { alloc_zeroed(layout) },
            Err(_) => core::ptr::null_mut(),
        }
    }

    pub unsafe fn release(ptr: *mut u8, len: usize) {
        if let Ok(layout) = Layout::from_size_align(len, OS_PAGE_SIZE) {
            // SAFETY: allocated by reserve with the same layout
            unsafe { dealloc(ptr, layout) };
        }
    }
}

#[cfg(unix)]
use posix as os;
#[cfg(not(unix))]
use fallback as os;

pub const OS_PAGE_SIZE: usize = 4096;

#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }
    // SAFETY: null is checked below
    let ptr = unsafe { os::reserve(size) };
    NonNull::new(ptr)
}

/// # Safety
/// `ptr` must come from [`map_memory`] with the same `size` and must not be
/// used afterwards.
pub unsafe fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: contract of the caller
    unsafe { os::release(ptr.as_ptr(), size) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_memory_is_zeroed_and_writable() {
        let size = OS_PAGE_SIZE * 2;
        let ptr = map_memory(size).expect("map memory");
        // SAFETY: just mapped
        unsafe {
            assert_eq!(*ptr.as_ptr(), 0);
            assert_eq!(*ptr.as_ptr().add(size - 1), 0);
            ptr.as_ptr().write(42);
            assert_eq!(*ptr.as_ptr(), 42);
            unmap_memory(ptr, size);
        }
    }

    #[test]
    fn zero_sized_mapping_is_refused() {
        assert!(map_memory(0).is_none());
    }
}
