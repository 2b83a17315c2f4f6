//! Isolate heap accelerator.
//!
//! A single mmap'd region with an atomic bump pointer. The collection
//! algorithm is not part of this crate; the heap only hands out memory and
//! answers containment queries for the write barrier.
use std::{
    alloc::Layout,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{ObjectRef, OS_PAGE_SIZE, VmError, map_memory, unmap_memory};

pub const OBJECT_ALIGNMENT: usize = 8;

#[derive(Debug)]
pub struct Heap {
    start: NonNull<u8>,
    size: usize,
    top: AtomicUsize,
    objects: AtomicUsize,
}

// SAFETY: the region is only handed out through the atomic bump pointer
unsafe impl Send for Heap {}
// SAFETY: see above
unsafe impl Sync for Heap {}

impl Heap {
    /// Maps `size` bytes, rounded up to whole pages.
    pub fn new(size: usize) -> Result<Self, VmError> {
        let size = size.div_ceil(OS_PAGE_SIZE).max(1) * OS_PAGE_SIZE;
        let start = map_memory(size).ok_or(VmError::OutOfMemory { requested: size })?;
        log::debug!("mapped heap of {size} bytes at {:p}", start.as_ptr());
        Ok(Self {
            start,
            size,
            top: AtomicUsize::new(0),
            objects: AtomicUsize::new(0),
        })
    }

    /// Bump allocates raw, zeroed memory. Safe to call from every thread
    /// that holds a reference to the heap.
    pub fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let align = layout.align().max(OBJECT_ALIGNMENT);
        let base = self.start.as_ptr() as usize;
        let mut current = self.top.load(Ordering::Relaxed);
        loop {
            let offset = (base + current).next_multiple_of(align) - base;
            let end = offset.checked_add(layout.size())?;
            if end > self.size {
                return None;
            }
            match self.top.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.objects.fetch_add(1, Ordering::Relaxed);
                    // SAFETY: offset < size, inside the mapping
                    let ptr = unsafe { self.start.as_ptr().add(offset) };
                    return NonNull::new(ptr);
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn allocate_object(&self, size: usize) -> Result<ObjectRef, VmError> {
        let layout = Layout::from_size_align(size.max(OBJECT_ALIGNMENT), OBJECT_ALIGNMENT)
            .map_err(|_| VmError::OutOfMemory { requested: size })?;
        self.allocate(layout)
            .map(ObjectRef::from_ptr)
            .ok_or(VmError::OutOfMemory { requested: size })
    }

    pub fn contains(&self, obj: ObjectRef) -> bool {
        let base = self.start.as_ptr() as usize;
        let addr = obj.addr();
        addr >= base && addr < base + self.top.load(Ordering::Acquire)
    }

    pub fn used(&self) -> usize {
        self.top.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn object_count(&self) -> usize {
        self.objects.load(Ordering::Relaxed)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // SAFETY: mapped in Heap::new with the same size
        unsafe { unmap_memory(self.start, self.size) };
    }
}
