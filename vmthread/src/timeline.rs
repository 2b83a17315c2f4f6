//! Diagnostic trace blocks.
//!
//! Each thread records into a chain of fixed-capacity blocks. The chain head
//! sits behind the thread's timeline lock because a coordinator thread may
//! read it while the owner keeps recording.
use std::{sync::OnceLock, time::Instant};

use parking_lot::Mutex;

use crate::ThreadId;

static START_TIME: OnceLock<Instant> = OnceLock::new();

pub fn monotonic_micros() -> u64 {
    let start = START_TIME.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEvent {
    pub label: &'static str,
    pub timestamp_micros: u64,
}

#[derive(Debug)]
pub struct TimelineEventBlock {
    thread: ThreadId,
    capacity: usize,
    events: Vec<TimelineEvent>,
    next: Option<Box<TimelineEventBlock>>,
}

impl TimelineEventBlock {
    pub fn new(thread: ThreadId, capacity: usize) -> Self {
        Self {
            thread,
            capacity,
            events: Vec::with_capacity(capacity),
            next: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.capacity
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn next(&self) -> Option<&TimelineEventBlock> {
        self.next.as_deref()
    }

    /// Walks the chain starting at this block, newest first.
    pub fn chain(&self) -> impl Iterator<Item = &TimelineEventBlock> {
        std::iter::successors(Some(self), |block| block.next())
    }

    /// Total events across the chain.
    pub fn chain_len(&self) -> usize {
        self.chain().map(|block| block.events.len()).sum()
    }
}

/// The lock-guarded head of a thread's block chain.
#[derive(Debug, Default)]
pub struct TimelineSlot {
    head: Mutex<Option<Box<TimelineEventBlock>>>,
}

impl TimelineSlot {
    pub fn record(&self, thread: ThreadId, capacity: usize, label: &'static str) {
        let event = TimelineEvent {
            label,
            timestamp_micros: monotonic_micros(),
        };
        let mut head = self.head.lock();
        let needs_block = head.as_ref().is_none_or(|block| block.is_full());
        if needs_block {
            let mut block = Box::new(TimelineEventBlock::new(thread, capacity.max(1)));
            block.next = head.take();
            *head = Some(block);
        }
        if let Some(block) = head.as_mut() {
            block.events.push(event);
        }
    }

    /// Runs `f` on the current chain while holding the lock.
    pub fn with_blocks<R>(&self, f: impl FnOnce(Option<&TimelineEventBlock>) -> R) -> R {
        let head = self.head.lock();
        f(head.as_deref())
    }

    pub fn take(&self) -> Option<Box<TimelineEventBlock>> {
        self.head.lock().take()
    }
}
