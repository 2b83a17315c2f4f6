//! Scoped bump allocator. Everything allocated in a zone is freed at once
//! when the zone's scope ends.
use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

use crate::VmError;

const SEGMENT_ALIGNMENT: usize = 16;

#[derive(Debug)]
struct Segment {
    ptr: NonNull<u8>,
    layout: Layout,
}

#[derive(Debug)]
pub struct Zone {
    segment_size: usize,
    segments: Vec<Segment>,
    cursor: usize,
    limit: usize,
    allocated: usize,
}

impl Zone {
    pub fn new(segment_size: usize) -> Self {
        Self {
            segment_size: segment_size.max(SEGMENT_ALIGNMENT),
            segments: Vec::new(),
            cursor: 0,
            limit: 0,
            allocated: 0,
        }
    }

    pub fn alloc(&mut self, layout: Layout) -> Result<NonNull<u8>, VmError> {
        let oom = VmError::OutOfMemory {
            requested: layout.size(),
        };
        if layout.align() > SEGMENT_ALIGNMENT {
            return Err(oom);
        }
        let start = self.cursor.next_multiple_of(layout.align());
        let end = start.checked_add(layout.size()).ok_or(oom.clone())?;
        if self.segments.is_empty() || end > self.limit {
            self.grow(layout.size())?;
            return self.alloc(layout);
        }
        self.cursor = end;
        self.allocated += layout.size();
        NonNull::new(start as *mut u8).ok_or(oom)
    }

    /// Allocates a zeroed array of `len` values of `T`.
    pub fn alloc_slice<T: Copy>(&mut self, len: usize) -> Result<&mut [T], VmError> {
        let layout = Layout::array::<T>(len).map_err(|_| VmError::OutOfMemory {
            requested: len.saturating_mul(size_of::<T>()),
        })?;
        let ptr = self.alloc(layout)?;
        // SAFETY: fresh, zeroed and suitably aligned memory owned by the zone
        unsafe {
            ptr.as_ptr().write_bytes(0, layout.size());
            Ok(std::slice::from_raw_parts_mut(ptr.as_ptr().cast::<T>(), len))
        }
    }

    fn grow(&mut self, minimum: usize) -> Result<(), VmError> {
        let size = self.segment_size.max(minimum.next_multiple_of(SEGMENT_ALIGNMENT));
        let layout = Layout::from_size_align(size, SEGMENT_ALIGNMENT)
            .map_err(|_| VmError::OutOfMemory { requested: minimum })?;
        // SAFETY: size is never zero
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(VmError::OutOfMemory { requested: size })?;
        self.cursor = ptr.as_ptr() as usize;
        self.limit = self.cursor + size;
        self.segments.push(Segment { ptr, layout });
        log::trace!("zone grew by {size} bytes");
        Ok(())
    }

    /// Bytes handed out so far.
    pub fn size_in_bytes(&self) -> usize {
        self.allocated
    }

    /// Bytes reserved from the system.
    pub fn capacity_in_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.layout.size()).sum()
    }
}

impl Drop for Zone {
    fn drop(&mut self) {
        for segment in self.segments.drain(..) {
            // SAFETY: allocated in grow() with this layout
            unsafe { alloc::dealloc(segment.ptr.as_ptr(), segment.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_allocations_share_a_segment() {
        let mut zone = Zone::new(256);
        let a = zone.alloc(Layout::new::<u64>()).unwrap();
        let b = zone.alloc(Layout::new::<u64>()).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 8);
        assert_eq!(zone.size_in_bytes(), 16);
        assert_eq!(zone.capacity_in_bytes(), 256);
    }

    #[test]
    fn large_allocations_get_their_own_segment() {
        let mut zone = Zone::new(64);
        zone.alloc(Layout::from_size_align(8, 8).unwrap()).unwrap();
        zone.alloc(Layout::from_size_align(1000, 8).unwrap()).unwrap();
        assert_eq!(zone.capacity_in_bytes(), 64 + 1008);
    }

    #[test]
    fn slices_are_zeroed() {
        let mut zone = Zone::new(128);
        let slice = zone.alloc_slice::<u32>(10).unwrap();
        assert!(slice.iter().all(|&v| v == 0));
        slice[3] = 7;
        assert_eq!(slice[3], 7);
    }

    #[test]
    fn over_aligned_layouts_are_refused() {
        let mut zone = Zone::new(128);
        let layout = Layout::from_size_align(8, 64).unwrap();
        assert!(zone.alloc(layout).is_err());
    }
}
