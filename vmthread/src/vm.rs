//! Process-wide VM state and its two lifecycle hooks.
//!
//! [`Vm::init_once_before_isolate`] runs before any isolate exists and
//! creates the special objects. [`Vm::init_once_after_object_and_stub_code`]
//! installs the stub code. Each hook bumps a generation counter so attached
//! threads know their cached constants are stale.
use std::sync::{
    OnceLock,
    atomic::{AtomicUsize, Ordering},
};

use crate::{
    Heap, OS_PAGE_SIZE, ObjectRef, RuntimeEntryId, SettingsError, Thread, VmError,
};

static VM: OnceLock<Vm> = OnceLock::new();
static GENERATION: AtomicUsize = AtomicUsize::new(0);

const SPECIAL_OBJECT_SIZE: usize = 16;
const STUB_CODE_SIZE: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct VmCreateInfo {
    pub zone_segment_size: Option<usize>,
    pub timeline_block_capacity: Option<usize>,
    pub vm_heap_size: Option<usize>,
    pub predefined_symbols: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSettings {
    pub zone_segment_size: usize,
    pub timeline_block_capacity: usize,
    pub vm_heap_size: usize,
    pub predefined_symbols: usize,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            zone_segment_size: 64 * 1024,
            timeline_block_capacity: 64,
            vm_heap_size: 64 * 1024,
            predefined_symbols: 16,
        }
    }
}

impl VmSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.zone_segment_size == 0 {
            return Err(SettingsError::Zero {
                field: "zone_segment_size",
            });
        }
        if self.timeline_block_capacity == 0 {
            return Err(SettingsError::Zero {
                field: "timeline_block_capacity",
            });
        }
        if self.vm_heap_size == 0 {
            return Err(SettingsError::Zero {
                field: "vm_heap_size",
            });
        }
        if self.vm_heap_size % OS_PAGE_SIZE != 0 {
            return Err(SettingsError::Unaligned {
                field: "vm_heap_size",
            });
        }
        Ok(())
    }
}

impl TryFrom<VmCreateInfo> for VmSettings {
    type Error = SettingsError;

    fn try_from(info: VmCreateInfo) -> Result<Self, Self::Error> {
        let defaults = VmSettings::default();
        let settings = VmSettings {
            zone_segment_size: info.zone_segment_size.unwrap_or(defaults.zone_segment_size),
            timeline_block_capacity: info
                .timeline_block_capacity
                .unwrap_or(defaults.timeline_block_capacity),
            vm_heap_size: info.vm_heap_size.unwrap_or(defaults.vm_heap_size),
            predefined_symbols: info
                .predefined_symbols
                .unwrap_or(defaults.predefined_symbols),
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialObjects {
    pub null: ObjectRef,
    pub bool_true: ObjectRef,
    pub bool_false: ObjectRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubEntry {
    pub code: ObjectRef,
    pub entry_point: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubCode {
    pub update_store_buffer: StubEntry,
    pub fix_callers_target: StubEntry,
    pub fix_allocation_stub_target: StubEntry,
    pub invoke_dart_code: StubEntry,
}

impl StubCode {
    /// Allocates the stub code objects in the VM heap. Stubs without a
    /// native counterpart enter through the unresolved-stub trap.
    pub fn bootstrap(vm: &Vm) -> Result<Self, VmError> {
        let trap = unresolved_stub as usize;
        let stub = |entry_point: usize| -> Result<StubEntry, VmError> {
            Ok(StubEntry {
                code: vm.heap.allocate_object(STUB_CODE_SIZE)?,
                entry_point,
            })
        };
        Ok(Self {
            update_store_buffer: stub(RuntimeEntryId::UpdateStoreBuffer.address())?,
            fix_callers_target: stub(trap)?,
            fix_allocation_stub_target: stub(trap)?,
            invoke_dart_code: stub(trap)?,
        })
    }
}

extern "C" fn unresolved_stub() {
    log::error!("entered a stub that has no generated code");
}

#[derive(Debug)]
pub struct Vm {
    settings: VmSettings,
    heap: Heap,
    specials: SpecialObjects,
    predefined_symbols: Box<[ObjectRef]>,
    stubs: OnceLock<StubCode>,
}

impl Vm {
    /// First lifecycle hook. Panics when called twice.
    pub fn init_once_before_isolate(info: VmCreateInfo) -> Result<&'static Vm, VmError> {
        let settings = VmSettings::try_from(info)?;
        let heap = Heap::new(settings.vm_heap_size)?;
        let specials = SpecialObjects {
            null: heap.allocate_object(SPECIAL_OBJECT_SIZE)?,
            bool_true: heap.allocate_object(SPECIAL_OBJECT_SIZE)?,
            bool_false: heap.allocate_object(SPECIAL_OBJECT_SIZE)?,
        };
        let predefined_symbols = (0..settings.predefined_symbols)
            .map(|_| heap.allocate_object(SPECIAL_OBJECT_SIZE))
            .collect::<Result<Box<[_]>, _>>()?;

        let vm = Vm {
            settings,
            heap,
            specials,
            predefined_symbols,
            stubs: OnceLock::new(),
        };
        if VM.set(vm).is_err() {
            panic!("init_once_before_isolate called twice");
        }
        GENERATION.fetch_add(1, Ordering::AcqRel);
        log::info!("vm initialized");

        let vm = Self::expect_initialized("init_once_before_isolate");
        refresh_current_thread();
        Ok(vm)
    }

    /// Second lifecycle hook. Panics when called before the first hook or
    /// twice.
    pub fn init_once_after_object_and_stub_code(stubs: StubCode) {
        let vm = Self::expect_initialized("init_once_after_object_and_stub_code");
        if vm.stubs.set(stubs).is_err() {
            panic!("init_once_after_object_and_stub_code called twice");
        }
        GENERATION.fetch_add(1, Ordering::AcqRel);
        log::info!("stub code installed");
        refresh_current_thread();
    }

    /// Runs both hooks with bootstrapped stubs.
    pub fn bootstrap(info: VmCreateInfo) -> Result<&'static Vm, VmError> {
        let vm = Self::init_once_before_isolate(info)?;
        Self::init_once_after_object_and_stub_code(StubCode::bootstrap(vm)?);
        Ok(vm)
    }

    fn expect_initialized(hook: &str) -> &'static Vm {
        match VM.get() {
            Some(vm) => vm,
            None => panic!("{hook} requires init_once_before_isolate to have run"),
        }
    }

    pub fn get() -> Option<&'static Vm> {
        VM.get()
    }

    /// Bumped by each lifecycle hook.
    pub fn generation() -> usize {
        GENERATION.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> &VmSettings {
        &self.settings
    }

    pub fn specials(&self) -> &SpecialObjects {
        &self.specials
    }

    pub fn stubs(&self) -> Option<&StubCode> {
        self.stubs.get()
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn predefined_symbols(&self) -> &[ObjectRef] {
        &self.predefined_symbols
    }

    pub fn predefined_symbols_address(&self) -> usize {
        self.predefined_symbols.as_ptr() as usize
    }
}

fn refresh_current_thread() {
    if let Some(mut thread) = Thread::current() {
        thread.init_vm_constants();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_info_defaults() {
        let settings = VmSettings::try_from(VmCreateInfo::default()).unwrap();
        assert_eq!(settings, VmSettings::default());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let info = VmCreateInfo {
            zone_segment_size: Some(0),
            ..Default::default()
        };
        assert_eq!(
            VmSettings::try_from(info),
            Err(SettingsError::Zero {
                field: "zone_segment_size"
            })
        );

        let info = VmCreateInfo {
            vm_heap_size: Some(OS_PAGE_SIZE + 1),
            ..Default::default()
        };
        assert_eq!(
            VmSettings::try_from(info),
            Err(SettingsError::Unaligned {
                field: "vm_heap_size"
            })
        );
    }

    #[test]
    fn hooks_populate_globals() {
        let vm = crate::testing::vm();
        let specials = vm.specials();
        assert!(vm.heap().contains(specials.null));
        assert_ne!(specials.bool_true, specials.bool_false);
        assert_eq!(
            vm.predefined_symbols().len(),
            vm.settings().predefined_symbols
        );

        let stubs = vm.stubs().expect("stubs installed");
        assert!(vm.heap().contains(stubs.invoke_dart_code.code));
        assert_eq!(
            stubs.update_store_buffer.entry_point,
            RuntimeEntryId::UpdateStoreBuffer.address()
        );
        assert!(Vm::generation() >= 2);
    }

    #[test]
    #[should_panic(expected = "init_once_before_isolate called twice")]
    fn first_hook_twice_panics() {
        crate::testing::vm();
        let _ = Vm::init_once_before_isolate(VmCreateInfo::default());
    }

    #[test]
    #[should_panic(expected = "init_once_after_object_and_stub_code called twice")]
    fn second_hook_twice_panics() {
        let vm = crate::testing::vm();
        let stubs = *vm.stubs().expect("stubs installed");
        Vm::init_once_after_object_and_stub_code(stubs);
    }
}
