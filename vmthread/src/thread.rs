//! The per-OS-thread execution context.
//!
//! A [`Thread`] is created lazily by [`Thread::ensure_init`] and lives in a
//! thread-local slot until the OS thread exits (or [`Thread::clean_up`] is
//! called). While attached to an isolate it holds a strong reference to it,
//! a store buffer block leased from it and the isolate scoped state.
//!
//! The struct is `repr(C)`: generated code reads the leading fields and the
//! constants table at the offsets published in [`crate::THREAD_OFFSETS`].
use std::{
    cell::Cell,
    ffi::c_void,
    mem,
    ptr::{self, NonNull},
    sync::Arc,
};

use crate::{
    ArchivedState, CachedConstant, CachedConstants, Heap, Isolate, LongJumpScope, ObjectRef,
    ResourceNode, ReusableHandles, RootProvider, RuntimeEntryId, RuntimeEntryPoints,
    StoreBufferBlock, ThreadId, ThreadInterruptCallback, ThreadInterrupter, ThresholdPolicy,
    TimelineSlot, View, Vm, VmError, VmTag, Zone,
};

const DEFAULT_TIMELINE_BLOCK_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Detached,
    Mutator,
    Helper { bypass_safepoint: bool },
}

/// State that only has meaning while attached. Zeroed on every exit.
#[repr(C)]
#[derive(Debug)]
pub struct IsolateScopedState {
    pub(crate) zone: *mut Zone,
    pub(crate) top_exit_frame_info: usize,
    pub(crate) top_resource: *mut ResourceNode,
    pub(crate) long_jump_base: *mut LongJumpScope,
    #[cfg(debug_assertions)]
    pub(crate) no_handle_scope_depth: usize,
    #[cfg(debug_assertions)]
    pub(crate) no_safepoint_scope_depth: usize,
}

impl Default for IsolateScopedState {
    fn default() -> Self {
        Self {
            zone: ptr::null_mut(),
            top_exit_frame_info: 0,
            top_resource: ptr::null_mut(),
            long_jump_base: ptr::null_mut(),
            #[cfg(debug_assertions)]
            no_handle_scope_depth: 0,
            #[cfg(debug_assertions)]
            no_safepoint_scope_depth: 0,
        }
    }
}

impl IsolateScopedState {
    pub fn is_clear(&self) -> bool {
        let clear = self.zone.is_null()
            && self.top_exit_frame_info == 0
            && self.top_resource.is_null()
            && self.long_jump_base.is_null();
        #[cfg(debug_assertions)]
        let clear = clear && self.no_handle_scope_depth == 0 && self.no_safepoint_scope_depth == 0;
        clear
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct Thread {
    isolate: *const Isolate,
    heap: *const Heap,
    store_buffer_block: *mut StoreBufferBlock,
    vm_tag: usize,
    pub(crate) state: IsolateScopedState,
    constants: CachedConstants,

    id: ThreadId,
    attach: AttachState,
    constants_generation: usize,
    interrupter: Arc<ThreadInterrupter>,
    timeline: Arc<TimelineSlot>,
    pub(crate) reusable_handles: ReusableHandles,
}

// ── Thread-local registry ──

struct ThreadSlot {
    thread: Cell<*mut Thread>,
    #[cfg(debug_assertions)]
    cleaned_up: Cell<bool>,
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        let thread = self.thread.replace(ptr::null_mut());
        if !thread.is_null() {
            // SAFETY: published by ensure_init via Box::into_raw
            drop(unsafe { Box::from_raw(thread) });
        }
    }
}

thread_local! {
    static CURRENT: ThreadSlot = const {
        ThreadSlot {
            thread: Cell::new(ptr::null_mut()),
            #[cfg(debug_assertions)]
            cleaned_up: Cell::new(false),
        }
    };
}

impl Thread {
    /// Registers a context for the calling OS thread if it has none.
    pub fn ensure_init() -> View<Thread> {
        CURRENT.with(|slot| {
            #[cfg(debug_assertions)]
            debug_assert!(
                !slot.cleaned_up.get(),
                "thread context used after clean_up"
            );
            if let Some(thread) = View::from_ptr(slot.thread.get()) {
                return thread;
            }
            let thread = Box::into_raw(Box::new(Thread::new()));
            slot.thread.set(thread);
            // SAFETY: just allocated
            let thread = View::new(unsafe { NonNull::new_unchecked(thread) });
            log::trace!("registered thread {}", thread.id);
            thread
        })
    }

    /// The calling thread's context. Never allocates. Returns `None` while
    /// thread-local storage is being torn down.
    pub fn current() -> Option<View<Thread>> {
        CURRENT
            .try_with(|slot| slot.thread.get())
            .ok()
            .and_then(View::from_ptr)
    }

    /// Releases the calling thread's context before the OS thread exits.
    /// Calling it twice is a contract violation.
    pub fn clean_up() {
        let thread = CURRENT.with(|slot| {
            #[cfg(debug_assertions)]
            {
                debug_assert!(!slot.cleaned_up.get(), "clean_up called twice");
                slot.cleaned_up.set(true);
            }
            slot.thread.get()
        });
        let Some(view) = View::from_ptr(thread) else {
            return;
        };
        assert_eq!(
            view.attach,
            AttachState::Detached,
            "clean_up called while attached to an isolate"
        );
        assert!(
            view.state.top_resource.is_null(),
            "clean_up called with scoped resources still active"
        );
        CURRENT.with(|slot| slot.thread.set(ptr::null_mut()));
        // SAFETY: published by ensure_init via Box::into_raw, slot cleared
        drop(unsafe { Box::from_raw(thread) });
    }

    fn current_or_panic(operation: &str) -> View<Thread> {
        match Self::current() {
            Some(thread) => thread,
            None => panic!("{operation} requires Thread::ensure_init on this OS thread"),
        }
    }

    fn new() -> Self {
        let mut thread = Self {
            isolate: ptr::null(),
            heap: ptr::null(),
            store_buffer_block: ptr::null_mut(),
            vm_tag: VmTag::Idle as usize,
            state: IsolateScopedState::default(),
            constants: CachedConstants::empty(),
            id: ThreadId::next(),
            attach: AttachState::Detached,
            constants_generation: 0,
            interrupter: Arc::new(ThreadInterrupter::new()),
            timeline: Arc::new(TimelineSlot::default()),
            reusable_handles: ReusableHandles::new(),
        };
        thread.init_vm_constants();
        thread
    }

    // ── Attach / detach ──

    pub fn enter_isolate(isolate: &Arc<Isolate>) {
        let mut thread = Self::current_or_panic("enter_isolate");
        thread.schedule(isolate, AttachState::Mutator);
    }

    pub fn exit_isolate() {
        let mut thread = Self::current_or_panic("exit_isolate");
        assert_eq!(
            thread.attach,
            AttachState::Mutator,
            "exit_isolate called on a thread that is not an attached mutator"
        );
        thread.unschedule(true);
    }

    pub fn enter_isolate_as_helper(isolate: &Arc<Isolate>, bypass_safepoint: bool) {
        let mut thread = Self::current_or_panic("enter_isolate_as_helper");
        thread.schedule(isolate, AttachState::Helper { bypass_safepoint });
    }

    pub fn exit_isolate_as_helper() {
        let mut thread = Self::current_or_panic("exit_isolate_as_helper");
        assert!(
            matches!(thread.attach, AttachState::Helper { .. }),
            "exit_isolate_as_helper called on a thread that is not an attached helper"
        );
        thread.unschedule(true);
    }

    /// Flushes the write-barrier block so the collector sees every record.
    pub fn prepare_for_gc() {
        let mut thread = Self::current_or_panic("prepare_for_gc");
        assert_eq!(
            thread.attach,
            AttachState::Mutator,
            "prepare_for_gc must run on the mutator"
        );
        thread.store_buffer_release(ThresholdPolicy::IgnoreThreshold);
        thread.store_buffer_acquire();
    }

    fn schedule(&mut self, isolate: &Arc<Isolate>, attach: AttachState) {
        assert_eq!(
            self.attach,
            AttachState::Detached,
            "thread {} is already attached to an isolate",
            self.id
        );
        debug_assert!(self.state.is_clear());

        let bypass = attach == AttachState::Helper {
            bypass_safepoint: true,
        };
        match attach {
            AttachState::Mutator => {
                if let Some(archived) = isolate.schedule_mutator(self.id) {
                    self.state.top_exit_frame_info = archived.top_exit_frame_info;
                    self.vm_tag = archived.vm_tag;
                }
            }
            AttachState::Helper { .. } => isolate.register_helper(self.id),
            AttachState::Detached => unreachable!(),
        }
        // May park here until a pending safepoint operation finishes.
        if !bypass {
            isolate.safepoint().enter();
        }

        self.isolate = Arc::into_raw(isolate.clone());
        self.heap = match bypass {
            true => ptr::null(),
            false => isolate.heap(),
        };
        self.attach = attach;
        self.store_buffer_acquire();
        self.refresh_vm_constants();
        if self.vm_tag == VmTag::Idle as usize {
            self.vm_tag = VmTag::Vm as usize;
        }
        log::debug!("{} entered isolate '{}' as {:?}", self.id, isolate.name(), attach);
    }

    /// `checked` is false when a thread is torn down while still attached;
    /// remaining scoped resources are then released instead of rejected.
    fn unschedule(&mut self, checked: bool) {
        if checked {
            assert!(
                self.state.top_resource.is_null(),
                "scoped resources must be released before leaving an isolate"
            );
            assert!(
                self.state.long_jump_base.is_null(),
                "recovery points must be exited before leaving an isolate"
            );
            #[cfg(debug_assertions)]
            assert!(
                !self.is_any_reusable_handle_scope_active(),
                "reusable handles must be released before leaving an isolate"
            );
        } else {
            self.unwind_resources_to(ptr::null_mut());
            self.state.long_jump_base = ptr::null_mut();
        }

        self.store_buffer_release(ThresholdPolicy::CheckThreshold);
        // SAFETY: produced by Arc::into_raw in schedule
        let isolate = unsafe { Arc::from_raw(self.isolate) };
        if let Some(chain) = self.timeline.take() {
            isolate.retire_timeline(chain);
        }
        self.clear_reusable_handles();

        let bypass = self.bypass_safepoint();
        match self.attach {
            AttachState::Mutator => isolate.unschedule_mutator(
                self.id,
                ArchivedState {
                    top_exit_frame_info: self.state.top_exit_frame_info,
                    vm_tag: self.vm_tag,
                },
            ),
            AttachState::Helper { .. } => isolate.unregister_helper(self.id),
            AttachState::Detached => unreachable!(),
        }
        if !bypass {
            isolate.safepoint().exit();
        }

        log::debug!("{} left isolate '{}'", self.id, isolate.name());
        self.isolate = ptr::null();
        self.heap = ptr::null();
        self.state = IsolateScopedState::default();
        self.attach = AttachState::Detached;
        self.vm_tag = VmTag::Idle as usize;
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn attach_state(&self) -> AttachState {
        self.attach
    }

    pub fn is_mutator_thread(&self) -> bool {
        self.attach == AttachState::Mutator
    }

    pub fn bypass_safepoint(&self) -> bool {
        self.attach
            == AttachState::Helper {
                bypass_safepoint: true,
            }
    }

    pub fn isolate(&self) -> Option<&Isolate> {
        // SAFETY: the thread holds a strong reference while attached
        unsafe { self.isolate.as_ref() }
    }

    /// `None` while detached and for helpers that bypass the safepoint.
    pub fn heap(&self) -> Option<&Heap> {
        // SAFETY: points into the isolate this thread keeps alive
        unsafe { self.heap.as_ref() }
    }

    pub fn scoped_state(&self) -> &IsolateScopedState {
        &self.state
    }

    pub fn top_exit_frame_info(&self) -> usize {
        self.state.top_exit_frame_info
    }

    pub fn set_top_exit_frame_info(&mut self, fp: usize) {
        self.state.top_exit_frame_info = fp;
    }

    pub fn vm_tag(&self) -> VmTag {
        VmTag::from_raw(self.vm_tag).unwrap_or(VmTag::Idle)
    }

    pub fn set_vm_tag(&mut self, tag: VmTag) {
        self.vm_tag = tag as usize;
    }

    pub fn allocate(&mut self, size: usize) -> Result<ObjectRef, VmError> {
        #[cfg(debug_assertions)]
        debug_assert_eq!(
            self.state.no_safepoint_scope_depth, 0,
            "allocation inside a no-safepoint scope"
        );
        let heap = self
            .heap()
            .ok_or_else(|| VmError::Message(format!("{} has no heap access", self.id)))?;
        heap.allocate_object(size)
    }

    /// Parks the thread if a safepoint operation is pending.
    pub fn safepoint_poll(&mut self) {
        #[cfg(debug_assertions)]
        debug_assert_eq!(
            self.state.no_safepoint_scope_depth, 0,
            "safepoint poll inside a no-safepoint scope"
        );
        if self.bypass_safepoint() {
            return;
        }
        if let Some(isolate) = self.isolate() {
            isolate.safepoint().poll();
        }
    }

    // ── Write barrier ──

    fn store_buffer_acquire(&mut self) {
        assert!(self.store_buffer_block.is_null());
        let Some(isolate) = self.isolate() else {
            return;
        };
        self.store_buffer_block = Box::into_raw(isolate.store_buffer().pop_block());
    }

    /// Hands the block (partial or not) back to the isolate.
    fn store_buffer_release(&mut self, policy: ThresholdPolicy) {
        let block = mem::replace(&mut self.store_buffer_block, ptr::null_mut());
        if block.is_null() {
            return;
        }
        // SAFETY: leased in store_buffer_acquire via Box::into_raw
        let block = unsafe { Box::from_raw(block) };
        let Some(isolate) = self.isolate() else {
            return;
        };
        let store_buffer = isolate.store_buffer();
        store_buffer.push_block(block, policy);
        if policy == ThresholdPolicy::CheckThreshold && store_buffer.is_overflowed() {
            isolate.request_gc();
        }
    }

    fn store_buffer_block_mut(&mut self) -> &mut StoreBufferBlock {
        assert!(
            !self.store_buffer_block.is_null(),
            "thread {} has no store buffer block, it is not attached",
            self.id
        );
        // SAFETY: leased block, owned by this thread until released
        unsafe { &mut *self.store_buffer_block }
    }

    pub fn store_buffer_add_object(&mut self, obj: ObjectRef) {
        let block = self.store_buffer_block_mut();
        block.push(obj);
        if block.is_full() {
            self.store_buffer_block_process(ThresholdPolicy::CheckThreshold);
        }
    }

    /// Variant used while a collection runs, never requests another one.
    pub fn store_buffer_add_object_gc(&mut self, obj: ObjectRef) {
        let block = self.store_buffer_block_mut();
        block.push(obj);
        if block.is_full() {
            self.store_buffer_block_process(ThresholdPolicy::IgnoreThreshold);
        }
    }

    pub fn store_buffer_block_process(&mut self, policy: ThresholdPolicy) {
        self.store_buffer_release(policy);
        self.store_buffer_acquire();
    }

    /// Whether `obj` is buffered locally or already promoted.
    pub fn store_buffer_contains(&self, obj: ObjectRef) -> bool {
        // SAFETY: leased block, owned by this thread until released
        let local = unsafe { self.store_buffer_block.as_ref() }.is_some_and(|b| b.contains(obj));
        local
            || self
                .isolate()
                .is_some_and(|isolate| isolate.store_buffer().contains(obj))
    }

    pub fn store_buffer_block(&self) -> Option<&StoreBufferBlock> {
        // SAFETY: see above
        unsafe { self.store_buffer_block.as_ref() }
    }

    // ── Cached constants ──

    /// Copies the VM globals into this thread's constants table.
    pub fn init_vm_constants(&mut self) {
        self.constants_generation = Vm::generation();
        self.constants = match Vm::get() {
            Some(vm) => CachedConstants::from_vm(vm),
            None => CachedConstants {
                entry_points: RuntimeEntryPoints::resolve(),
                ..CachedConstants::empty()
            },
        };
    }

    /// Reloads the table if a lifecycle hook ran since it was filled.
    pub(crate) fn refresh_vm_constants(&mut self) {
        if self.constants_generation != Vm::generation() {
            self.init_vm_constants();
        }
    }

    pub fn constants(&self) -> &CachedConstants {
        &self.constants
    }

    // ── Interrupter ──

    pub fn set_thread_interrupter(&self, callback: Option<ThreadInterruptCallback>, data: *mut c_void) {
        self.interrupter.set(callback, data);
    }

    pub fn is_thread_interrupter_enabled(&self) -> Option<(ThreadInterruptCallback, *mut c_void)> {
        self.interrupter.get()
    }

    /// Shared with the profiler, which delivers samples from its own thread.
    pub fn interrupter_handle(&self) -> Arc<ThreadInterrupter> {
        self.interrupter.clone()
    }

    // ── Timeline ──

    pub fn record_timeline_event(&self, label: &'static str) {
        let capacity = Vm::get()
            .map_or(DEFAULT_TIMELINE_BLOCK_CAPACITY, |vm| vm.settings().timeline_block_capacity);
        self.timeline.record(self.id, capacity, label);
    }

    /// Shared with readers that walk the chain under its lock.
    pub fn timeline_handle(&self) -> Arc<TimelineSlot> {
        self.timeline.clone()
    }

    // ── Offsets ──

    pub const fn isolate_offset() -> usize {
        mem::offset_of!(Thread, isolate)
    }

    pub const fn heap_offset() -> usize {
        mem::offset_of!(Thread, heap)
    }

    pub const fn store_buffer_block_offset() -> usize {
        mem::offset_of!(Thread, store_buffer_block)
    }

    pub const fn vm_tag_offset() -> usize {
        mem::offset_of!(Thread, vm_tag)
    }

    pub const fn zone_offset() -> usize {
        mem::offset_of!(Thread, state) + mem::offset_of!(IsolateScopedState, zone)
    }

    pub const fn top_exit_frame_info_offset() -> usize {
        mem::offset_of!(Thread, state) + mem::offset_of!(IsolateScopedState, top_exit_frame_info)
    }

    pub const fn top_resource_offset() -> usize {
        mem::offset_of!(Thread, state) + mem::offset_of!(IsolateScopedState, top_resource)
    }

    pub const fn long_jump_base_offset() -> usize {
        mem::offset_of!(Thread, state) + mem::offset_of!(IsolateScopedState, long_jump_base)
    }

    pub const fn constant_offset(constant: CachedConstant) -> usize {
        mem::offset_of!(Thread, constants) + CachedConstants::offset_of(constant)
    }

    pub const fn runtime_entry_offset(id: RuntimeEntryId) -> usize {
        mem::offset_of!(Thread, constants)
            + CachedConstants::entry_points_offset()
            + RuntimeEntryPoints::offset_of(id)
    }
}

impl RootProvider for Thread {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut ObjectRef)) {
        self.constants.visit_objects(visitor);
        self.reusable_handles.visit(visitor);
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.attach != AttachState::Detached {
            log::warn!("{} exited while attached, detaching", self.id);
            self.unschedule(false);
        }
        log::trace!("released thread {}", self.id);
    }
}
