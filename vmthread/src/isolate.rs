//! The isolate side of the thread protocol: who is attached, the safepoint
//! participants, the global record set and the copy-on-write class table.
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    Heap, OS_PAGE_SIZE, SafepointHandler, SettingsError, StoreBuffer, Thread, ThreadId,
    TimelineEventBlock, VmError,
};

#[derive(Debug, Clone, Default)]
pub struct IsolateCreateInfo {
    pub name: Option<String>,
    pub heap_size: Option<usize>,
    pub store_buffer_block_size: Option<usize>,
    pub store_buffer_threshold: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolateSettings {
    pub name: String,
    pub heap_size: usize,
    /// Entries a thread buffers before flushing.
    pub store_buffer_block_size: usize,
    /// Pending records after which a collection is requested.
    pub store_buffer_threshold: usize,
}

impl Default for IsolateSettings {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            heap_size: 4 * 1024 * 1024,
            store_buffer_block_size: 1024,
            store_buffer_threshold: 16 * 1024,
        }
    }
}

impl IsolateSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.heap_size == 0 {
            return Err(SettingsError::Zero { field: "heap_size" });
        }
        if self.heap_size % OS_PAGE_SIZE != 0 {
            return Err(SettingsError::Unaligned { field: "heap_size" });
        }
        if self.store_buffer_block_size == 0 {
            return Err(SettingsError::Zero {
                field: "store_buffer_block_size",
            });
        }
        if self.store_buffer_threshold < self.store_buffer_block_size {
            return Err(SettingsError::ThresholdBelowBlock {
                threshold: self.store_buffer_threshold,
                block_size: self.store_buffer_block_size,
            });
        }
        Ok(())
    }
}

impl TryFrom<IsolateCreateInfo> for IsolateSettings {
    type Error = SettingsError;

    fn try_from(info: IsolateCreateInfo) -> Result<Self, Self::Error> {
        let defaults = IsolateSettings::default();
        let settings = IsolateSettings {
            name: info.name.unwrap_or(defaults.name),
            heap_size: info.heap_size.unwrap_or(defaults.heap_size),
            store_buffer_block_size: info
                .store_buffer_block_size
                .unwrap_or(defaults.store_buffer_block_size),
            store_buffer_threshold: info
                .store_buffer_threshold
                .unwrap_or(defaults.store_buffer_threshold),
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// What a secondary mutator leaves behind when it exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchivedState {
    pub top_exit_frame_info: usize,
    pub vm_tag: usize,
}

#[derive(Debug, Default)]
struct Registry {
    mutator: Option<ThreadId>,
    primary: Option<ThreadId>,
    helpers: Vec<ThreadId>,
    archived: HashMap<ThreadId, ArchivedState, ahash::RandomState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub name: String,
    pub instance_size: usize,
}

/// Immutable snapshot. Writers publish a new table, readers keep whichever
/// snapshot they loaded.
#[derive(Debug, Clone, Default)]
pub struct ClassTable {
    classes: Vec<ClassInfo>,
}

impl ClassTable {
    pub fn get(&self, id: ClassId) -> Option<&ClassInfo> {
        self.classes.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClassId, &ClassInfo)> {
        self.classes
            .iter()
            .enumerate()
            .map(|(i, info)| (ClassId(i as u32), info))
    }
}

#[derive(Debug)]
pub struct Isolate {
    settings: IsolateSettings,
    heap: Heap,
    store_buffer: StoreBuffer,
    safepoint: SafepointHandler,
    registry: Mutex<Registry>,
    class_table: RwLock<Arc<ClassTable>>,
    timeline: Mutex<Vec<Box<TimelineEventBlock>>>,
    gc_requested: AtomicBool,
}

impl Isolate {
    pub fn new(info: IsolateCreateInfo) -> Result<Arc<Self>, VmError> {
        let settings = IsolateSettings::try_from(info)?;
        let heap = Heap::new(settings.heap_size)?;
        let store_buffer = StoreBuffer::new(
            settings.store_buffer_block_size,
            settings.store_buffer_threshold,
        );
        log::debug!("created isolate '{}'", settings.name);
        Ok(Arc::new(Self {
            settings,
            heap,
            store_buffer,
            safepoint: SafepointHandler::new(),
            registry: Mutex::new(Registry::default()),
            class_table: RwLock::new(Arc::new(ClassTable::default())),
            timeline: Mutex::new(Vec::new()),
            gc_requested: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &IsolateSettings {
        &self.settings
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn store_buffer(&self) -> &StoreBuffer {
        &self.store_buffer
    }

    pub fn safepoint(&self) -> &SafepointHandler {
        &self.safepoint
    }

    // ── Thread registry ──

    /// Claims the mutator slot. The first mutator ever becomes the primary
    /// one, whose state is discarded instead of archived on exit.
    pub(crate) fn schedule_mutator(&self, id: ThreadId) -> Option<ArchivedState> {
        let mut registry = self.registry.lock();
        if let Some(current) = registry.mutator {
            panic!(
                "isolate '{}' already has mutator {current}, {id} cannot enter",
                self.settings.name
            );
        }
        registry.mutator = Some(id);
        registry.primary.get_or_insert(id);
        registry.archived.remove(&id)
    }

    pub(crate) fn unschedule_mutator(&self, id: ThreadId, archive: ArchivedState) {
        let mut registry = self.registry.lock();
        assert_eq!(registry.mutator, Some(id), "{id} is not the mutator");
        registry.mutator = None;
        if registry.primary != Some(id) {
            registry.archived.insert(id, archive);
        }
    }

    pub(crate) fn register_helper(&self, id: ThreadId) {
        self.registry.lock().helpers.push(id);
    }

    pub(crate) fn unregister_helper(&self, id: ThreadId) {
        let mut registry = self.registry.lock();
        let index = registry.helpers.iter().position(|&h| h == id);
        match index {
            Some(index) => {
                registry.helpers.swap_remove(index);
            }
            None => panic!("{id} is not a helper of isolate '{}'", self.settings.name),
        }
    }

    pub fn mutator_thread(&self) -> Option<ThreadId> {
        self.registry.lock().mutator
    }

    pub fn primary_mutator(&self) -> Option<ThreadId> {
        self.registry.lock().primary
    }

    pub fn helper_count(&self) -> usize {
        self.registry.lock().helpers.len()
    }

    pub fn archived_state(&self, id: ThreadId) -> Option<ArchivedState> {
        self.registry.lock().archived.get(&id).copied()
    }

    // ── Collection support ──

    pub(crate) fn request_gc(&self) {
        if !self.gc_requested.swap(true, Ordering::AcqRel) {
            log::debug!("isolate '{}' requested a collection", self.settings.name);
        }
    }

    pub fn is_gc_requested(&self) -> bool {
        self.gc_requested.load(Ordering::Acquire)
    }

    /// Stops every safepoint participant, runs `f` and resumes. The calling
    /// thread may itself be attached.
    pub fn safepoint_operation<R>(&self, f: impl FnOnce() -> R) -> R {
        let caller_participates = Thread::current().is_some_and(|thread| {
            thread
                .isolate()
                .is_some_and(|isolate| std::ptr::eq(isolate, self))
                && !thread.bypass_safepoint()
        });
        self.safepoint.pause(caller_participates);
        let result = f();
        self.gc_requested.store(false, Ordering::Release);
        self.safepoint.resume();
        result
    }

    // ── Class table ──

    pub fn class_table(&self) -> Arc<ClassTable> {
        self.class_table.read().clone()
    }

    /// Only the mutator may add classes. Helpers keep reading their
    /// snapshot while a new table is published.
    pub fn register_class(&self, name: &str, instance_size: usize) -> ClassId {
        let caller = Thread::current().map(|thread| thread.id());
        assert!(
            caller.is_some() && caller == self.mutator_thread(),
            "only the mutator may modify the class table"
        );
        let mut table = self.class_table.write();
        let mut next = ClassTable::clone(&table);
        let id = ClassId(next.classes.len() as u32);
        next.classes.push(ClassInfo {
            name: name.to_string(),
            instance_size,
        });
        *table = Arc::new(next);
        id
    }

    // ── Timeline sink ──

    pub(crate) fn retire_timeline(&self, chain: Box<TimelineEventBlock>) {
        self.timeline.lock().push(chain);
    }

    /// Events retired by detached threads.
    pub fn timeline_event_count(&self) -> usize {
        self.timeline
            .lock()
            .iter()
            .map(|chain| chain.chain_len())
            .sum()
    }

    pub fn with_timeline<R>(&self, f: impl FnOnce(&[Box<TimelineEventBlock>]) -> R) -> R {
        f(&self.timeline.lock())
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        log::debug!("dropping isolate '{}'", self.settings.name);
    }
}
