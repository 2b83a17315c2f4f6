use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of a VM thread. Ids are never reused.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
    pub const INVALID: Self = Self(0);

    pub fn next() -> Self {
        Self(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// What the thread is currently doing, readable by generated code and by
/// the profiler.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmTag {
    Idle = 1,
    Vm = 2,
    Dart = 3,
    Native = 4,
    Runtime = 5,
    Compiler = 6,
    Gc = 7,
}

impl VmTag {
    pub fn from_raw(raw: usize) -> Option<Self> {
        Some(match raw {
            1 => Self::Idle,
            2 => Self::Vm,
            3 => Self::Dart,
            4 => Self::Native,
            5 => Self::Runtime,
            6 => Self::Compiler,
            7 => Self::Gc,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, thread};

    #[test]
    fn ids_are_unique_across_threads() {
        let joins: Vec<_> = (0..4)
            .map(|_| thread::spawn(|| (0..64).map(|_| ThreadId::next()).collect::<Vec<_>>()))
            .collect();
        let ids: HashSet<ThreadId> = joins.into_iter().flat_map(|j| j.join().unwrap()).collect();
        assert_eq!(ids.len(), 256);
        assert!(!ids.contains(&ThreadId::INVALID));
    }

    #[test]
    fn vm_tags_round_trip_through_raw() {
        for tag in [VmTag::Idle, VmTag::Dart, VmTag::Gc] {
            assert_eq!(VmTag::from_raw(tag as usize), Some(tag));
        }
        assert_eq!(VmTag::from_raw(0), None);
    }
}
