//! Write-barrier record buffering.
//!
//! Every attached thread owns one [`StoreBufferBlock`]. Full (or released)
//! blocks are pushed into the isolate's [`StoreBuffer`], which merges their
//! entries into the global record set and recycles the block.
use std::{
    collections::HashSet,
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

use crate::ObjectRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdPolicy {
    /// Request a collection once the record set overflows.
    CheckThreshold,
    /// Merge only. Used while a collection is already running.
    IgnoreThreshold,
}

/// Bounded buffer of pending records.
///
/// `top` and `pointers` are read by generated code at fixed offsets.
#[repr(C)]
#[derive(Debug)]
pub struct StoreBufferBlock {
    top: usize,
    capacity: usize,
    pointers: NonNull<ObjectRef>,
}

// SAFETY: the block owns its entries, it moves between a thread and the pool
unsafe impl Send for StoreBufferBlock {}

impl StoreBufferBlock {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "store buffer blocks need capacity");
        let entries: Box<[ObjectRef]> = vec![ObjectRef::NULL; capacity].into_boxed_slice();
        let raw = Box::into_raw(entries) as *mut ObjectRef;
        Self {
            top: 0,
            capacity,
            // SAFETY: Box::into_raw is never null
            pointers: unsafe { NonNull::new_unchecked(raw) },
        }
    }

    #[inline]
    pub fn push(&mut self, obj: ObjectRef) {
        assert!(self.top < self.capacity, "store buffer block overflow");
        // SAFETY: top < capacity
        unsafe { self.pointers.as_ptr().add(self.top).write(obj) };
        self.top += 1;
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.top == self.capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.top
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entries(&self) -> &[ObjectRef] {
        // SAFETY: the first `top` slots are initialized
        unsafe { std::slice::from_raw_parts(self.pointers.as_ptr(), self.top) }
    }

    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.entries().contains(&obj)
    }

    pub fn reset(&mut self) {
        self.top = 0;
    }

    pub const fn top_offset() -> usize {
        mem::offset_of!(StoreBufferBlock, top)
    }

    pub const fn pointers_offset() -> usize {
        mem::offset_of!(StoreBufferBlock, pointers)
    }
}

impl Drop for StoreBufferBlock {
    fn drop(&mut self) {
        let slice = ptr::slice_from_raw_parts_mut(self.pointers.as_ptr(), self.capacity);
        // SAFETY: allocated as a boxed slice of `capacity` entries in new()
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// The isolate-global record set, in insertion order without duplicates.
#[derive(Debug, Default)]
pub struct RecordSet {
    order: Vec<ObjectRef>,
    seen: HashSet<ObjectRef, ahash::RandomState>,
}

impl RecordSet {
    fn insert(&mut self, obj: ObjectRef) {
        if self.seen.insert(obj) {
            self.order.push(obj);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.seen.contains(&obj)
    }

    pub fn as_slice(&self) -> &[ObjectRef] {
        &self.order
    }
}

#[derive(Debug)]
pub struct StoreBuffer {
    block_size: usize,
    threshold: usize,
    records: Mutex<RecordSet>,
    free_blocks: Mutex<Vec<Box<StoreBufferBlock>>>,
    overflowed: AtomicBool,
}

impl StoreBuffer {
    /// `block_size` is the per-thread flush threshold, `threshold` the number
    /// of pending records after which a collection is requested.
    pub fn new(block_size: usize, threshold: usize) -> Self {
        Self {
            block_size,
            threshold,
            records: Mutex::new(RecordSet::default()),
            free_blocks: Mutex::new(Vec::new()),
            overflowed: AtomicBool::new(false),
        }
    }

    /// Leases an empty block from the pool.
    pub fn pop_block(&self) -> Box<StoreBufferBlock> {
        let block = self.free_blocks.lock().pop();
        block.unwrap_or_else(|| Box::new(StoreBufferBlock::new(self.block_size)))
    }

    /// Merges a (possibly partial) block into the record set and returns the
    /// block to the pool.
    pub fn push_block(&self, mut block: Box<StoreBufferBlock>, policy: ThresholdPolicy) {
        let pending = {
            let mut records = self.records.lock();
            for &obj in block.entries() {
                records.insert(obj);
            }
            records.len()
        };
        log::trace!("merged {} store buffer entries, {pending} pending", block.len());
        block.reset();
        self.free_blocks.lock().push(block);

        if policy == ThresholdPolicy::CheckThreshold
            && pending > self.threshold
            && !self.overflowed.swap(true, Ordering::AcqRel)
        {
            log::debug!("store buffer overflowed ({pending} records), requesting gc");
        }
    }

    /// Set once the record set passed the threshold under
    /// [`ThresholdPolicy::CheckThreshold`]. Cleared by [`Self::take_records`].
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Hands the record set to the collector.
    pub fn take_records(&self) -> Vec<ObjectRef> {
        let records = mem::take(&mut *self.records.lock());
        self.overflowed.store(false, Ordering::Release);
        records.order
    }

    pub fn with_records<R>(&self, f: impl FnOnce(&RecordSet) -> R) -> R {
        f(&self.records.lock())
    }

    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.records.lock().contains(obj)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn pooled_blocks(&self) -> usize {
        self.free_blocks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(n: usize) -> ObjectRef {
        ObjectRef::from_addr(n * 8)
    }

    #[test]
    fn block_fills_up_to_capacity() {
        let mut block = StoreBufferBlock::new(2);
        assert!(block.is_empty());
        block.push(obj(1));
        block.push(obj(2));
        assert!(block.is_full());
        assert_eq!(block.entries(), &[obj(1), obj(2)]);
        assert!(block.contains(obj(2)));
        block.reset();
        assert!(block.is_empty());
        assert!(!block.contains(obj(2)));
    }

    #[test]
    #[should_panic(expected = "store buffer block overflow")]
    fn pushing_into_full_block_panics() {
        let mut block = StoreBufferBlock::new(1);
        block.push(obj(1));
        block.push(obj(2));
    }

    #[test]
    fn push_block_merges_without_duplicates_and_recycles() {
        let buffer = StoreBuffer::new(4, 100);
        let mut block = buffer.pop_block();
        block.push(obj(1));
        block.push(obj(2));
        block.push(obj(1));
        buffer.push_block(block, ThresholdPolicy::CheckThreshold);

        assert_eq!(buffer.len(), 2);
        assert!(buffer.contains(obj(1)));
        assert_eq!(buffer.pooled_blocks(), 1);

        let recycled = buffer.pop_block();
        assert!(recycled.is_empty());
        assert_eq!(buffer.pooled_blocks(), 0);
    }

    #[test]
    fn overflow_only_under_check_threshold() {
        let buffer = StoreBuffer::new(4, 2);
        let mut block = buffer.pop_block();
        for n in 1..=3 {
            block.push(obj(n));
        }
        buffer.push_block(block, ThresholdPolicy::IgnoreThreshold);
        assert!(!buffer.is_overflowed());

        let mut block = buffer.pop_block();
        block.push(obj(4));
        buffer.push_block(block, ThresholdPolicy::CheckThreshold);
        assert!(buffer.is_overflowed());

        let records = buffer.take_records();
        assert_eq!(records, vec![obj(1), obj(2), obj(3), obj(4)]);
        assert!(!buffer.is_overflowed());
        assert!(buffer.is_empty());
    }

    #[test]
    fn offsets_are_stable() {
        assert_eq!(StoreBufferBlock::top_offset(), StoreBufferBlock::top_offset());
        assert_eq!(StoreBufferBlock::top_offset(), 0);
        assert_ne!(StoreBufferBlock::pointers_offset(), StoreBufferBlock::top_offset());
    }
}
