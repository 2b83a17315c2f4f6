//! Sampling hook invoked by an external profiler.
//!
//! While inside a callback the following is forbidden:
//! - touching thread-local storage, the callback may run on another OS thread
//! - allocating, the allocator takes locks the interrupted thread may hold
//! - taking any lock, for the same reason
//!
//! The hook is stored in two atomics so delivering an interrupt never locks.
use std::{
    ffi::c_void,
    mem,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::ThreadId;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptedThreadState {
    pub tid: ThreadId,
    pub pc: usize,
    pub csp: usize,
    pub dsp: usize,
    pub fp: usize,
    pub lr: usize,
}

pub type ThreadInterruptCallback = fn(&InterruptedThreadState, *mut c_void);

#[derive(Debug)]
pub struct ThreadInterrupter {
    callback: AtomicPtr<()>,
    data: AtomicPtr<c_void>,
}

impl Default for ThreadInterrupter {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadInterrupter {
    pub const fn new() -> Self {
        Self {
            callback: AtomicPtr::new(ptr::null_mut()),
            data: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Installs (or with `None` removes) the hook.
    pub fn set(&self, callback: Option<ThreadInterruptCallback>, data: *mut c_void) {
        match callback {
            Some(callback) => {
                self.data.store(data, Ordering::Relaxed);
                self.callback.store(callback as *mut (), Ordering::Release);
            }
            None => {
                self.callback.store(ptr::null_mut(), Ordering::Release);
                self.data.store(ptr::null_mut(), Ordering::Relaxed);
            }
        }
    }

    pub fn get(&self) -> Option<(ThreadInterruptCallback, *mut c_void)> {
        let raw = self.callback.load(Ordering::Acquire);
        if raw.is_null() {
            return None;
        }
        // SAFETY: only ever stored from a ThreadInterruptCallback in set()
        let callback = unsafe { mem::transmute::<*mut (), ThreadInterruptCallback>(raw) };
        Some((callback, self.data.load(Ordering::Relaxed)))
    }

    pub fn is_enabled(&self) -> bool {
        !self.callback.load(Ordering::Acquire).is_null()
    }

    /// Delivers one sample. Returns false if no hook is installed.
    pub fn interrupt(&self, state: &InterruptedThreadState) -> bool {
        match self.get() {
            Some((callback, data)) => {
                callback(state, data);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering::SeqCst},
    };

    fn sample_state(pc: usize) -> InterruptedThreadState {
        InterruptedThreadState {
            tid: ThreadId::next(),
            pc,
            csp: 0,
            dsp: 0,
            fp: 0,
            lr: 0,
        }
    }

    fn count_pc(state: &InterruptedThreadState, data: *mut c_void) {
        // SAFETY: the tests pass a live AtomicUsize
        let counter = unsafe { &*(data as *const AtomicUsize) };
        counter.fetch_add(state.pc, SeqCst);
    }

    #[test]
    fn disabled_by_default() {
        let interrupter = ThreadInterrupter::new();
        assert!(!interrupter.is_enabled());
        assert!(interrupter.get().is_none());
        assert!(!interrupter.interrupt(&sample_state(1)));
    }

    #[test]
    fn installed_hook_receives_state_and_data() {
        let counter = AtomicUsize::new(0);
        let interrupter = ThreadInterrupter::new();
        interrupter.set(Some(count_pc), &counter as *const _ as *mut c_void);

        let (callback, data) = interrupter.get().expect("hook installed");
        assert_eq!(callback as usize, count_pc as ThreadInterruptCallback as usize);
        assert_eq!(data as usize, &counter as *const _ as usize);

        assert!(interrupter.interrupt(&sample_state(3)));
        assert!(interrupter.interrupt(&sample_state(4)));
        assert_eq!(counter.load(SeqCst), 7);

        interrupter.set(None, ptr::null_mut());
        assert!(!interrupter.is_enabled());
        assert!(!interrupter.interrupt(&sample_state(100)));
        assert_eq!(counter.load(SeqCst), 7);
    }

    #[test]
    fn interrupts_can_come_from_another_thread() {
        let counter = Arc::new(AtomicUsize::new(0));
        let interrupter = Arc::new(ThreadInterrupter::new());
        interrupter.set(Some(count_pc), Arc::as_ptr(&counter) as *mut c_void);

        let profiler = {
            let interrupter = interrupter.clone();
            std::thread::spawn(move || {
                for _ in 0..10 {
                    interrupter.interrupt(&sample_state(1));
                }
            })
        };
        profiler.join().unwrap();
        assert_eq!(counter.load(SeqCst), 10);
    }
}
