//! The offset table consumed by the code generator.
//!
//! Every field generated code may load from a [`Thread`] is listed here with
//! its byte offset. [`THREAD_LAYOUT_VERSION`] fingerprints the table so
//! compiled code can be checked against the runtime it is loaded into.
use crate::{
    CachedConstant, CachedConstants, CachedKind, ObjectRef, RuntimeEntry, RuntimeEntryId,
    RuntimeEntryPoints, Thread, Vm,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadOffset {
    pub name: &'static str,
    pub offset: usize,
}

const CONTROL_OFFSETS: [ThreadOffset; 8] = [
    ThreadOffset { name: "isolate", offset: Thread::isolate_offset() },
    ThreadOffset { name: "heap", offset: Thread::heap_offset() },
    ThreadOffset { name: "store_buffer_block", offset: Thread::store_buffer_block_offset() },
    ThreadOffset { name: "vm_tag", offset: Thread::vm_tag_offset() },
    ThreadOffset { name: "zone", offset: Thread::zone_offset() },
    ThreadOffset { name: "top_exit_frame_info", offset: Thread::top_exit_frame_info_offset() },
    ThreadOffset { name: "top_resource", offset: Thread::top_resource_offset() },
    ThreadOffset { name: "long_jump_base", offset: Thread::long_jump_base_offset() },
];

pub const THREAD_OFFSET_COUNT: usize =
    CONTROL_OFFSETS.len() + CachedConstant::ALL.len() + RuntimeEntryId::ALL.len();

pub const THREAD_OFFSETS: [ThreadOffset; THREAD_OFFSET_COUNT] = build_offsets();

pub const THREAD_LAYOUT_VERSION: u64 = fingerprint(&THREAD_OFFSETS);

const fn build_offsets() -> [ThreadOffset; THREAD_OFFSET_COUNT] {
    let mut out = [ThreadOffset { name: "", offset: 0 }; THREAD_OFFSET_COUNT];
    let mut i = 0;
    while i < CONTROL_OFFSETS.len() {
        out[i] = CONTROL_OFFSETS[i];
        i += 1;
    }
    let mut j = 0;
    while j < CachedConstant::ALL.len() {
        let constant = CachedConstant::ALL[j];
        out[i] = ThreadOffset {
            name: constant.name(),
            offset: Thread::constant_offset(constant),
        };
        i += 1;
        j += 1;
    }
    j = 0;
    while j < RuntimeEntryId::ALL.len() {
        out[i] = ThreadOffset {
            name: RuntimeEntryPoints::FIELD_NAMES[j],
            offset: Thread::runtime_entry_offset(RuntimeEntryId::ALL[j]),
        };
        i += 1;
        j += 1;
    }
    out
}

// FNV-1a over names and offsets.
const fn fingerprint(entries: &[ThreadOffset]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut i = 0;
    while i < entries.len() {
        let name = entries[i].name.as_bytes();
        let mut b = 0;
        while b < name.len() {
            hash ^= name[b] as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
            b += 1;
        }
        let offset = (entries[i].offset as u64).to_le_bytes();
        b = 0;
        while b < offset.len() {
            hash ^= offset[b] as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
            b += 1;
        }
        i += 1;
    }
    hash
}

pub fn thread_offset(name: &str) -> Option<usize> {
    THREAD_OFFSETS
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| entry.offset)
}

impl Thread {
    /// Whether generated code can load `obj` from the thread instead of
    /// embedding it.
    pub fn can_load_from_thread(obj: ObjectRef) -> bool {
        Self::offset_from_thread(obj).is_some()
    }

    /// The thread offset holding `obj`, if it is one of the cached objects.
    pub fn offset_from_thread(obj: ObjectRef) -> Option<usize> {
        let constants = match Self::current() {
            Some(mut thread) => {
                thread.refresh_vm_constants();
                *thread.constants()
            }
            None => CachedConstants::from_vm(Vm::get()?),
        };
        let constant = constants.find_object(obj)?;
        debug_assert_eq!(constant.kind(), CachedKind::Object);
        Some(Self::constant_offset(constant))
    }

    /// Every runtime entry has a slot.
    pub fn offset_from_thread_entry(entry: &RuntimeEntry) -> usize {
        Self::runtime_entry_offset(entry.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn offsets_are_unique_and_word_aligned() {
        let mut offsets: Vec<_> = THREAD_OFFSETS.iter().map(|e| e.offset).collect();
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), THREAD_OFFSET_COUNT);
        assert!(offsets.iter().all(|o| o % size_of::<usize>() == 0));
        assert!(offsets.iter().all(|&o| o < size_of::<Thread>()));
    }

    #[test]
    fn offsets_are_stable() {
        assert_eq!(Thread::top_resource_offset(), Thread::top_resource_offset());
        assert_eq!(thread_offset("top_resource"), Some(Thread::top_resource_offset()));
        assert_eq!(
            thread_offset("bool_true"),
            Some(Thread::constant_offset(CachedConstant::BoolTrue))
        );
        assert_eq!(THREAD_LAYOUT_VERSION, fingerprint(&build_offsets()));
        assert_eq!(thread_offset("missing"), None);
    }

    #[test]
    fn generated_code_view_matches_fields() {
        testing::vm();
        let thread = Thread::ensure_init();
        let base = thread.as_ptr() as *const u8;
        let offset = Thread::constant_offset(CachedConstant::ObjectNull);
        // SAFETY: reads a field of a live thread through its published offset
        let null = unsafe { base.add(offset).cast::<ObjectRef>().read() };
        assert_eq!(null, thread.constants().object_null);

        let offset = Thread::runtime_entry_offset(RuntimeEntryId::SafepointPoll);
        // SAFETY: see above
        let entry = unsafe { base.add(offset).cast::<usize>().read() };
        assert_eq!(entry, RuntimeEntryId::SafepointPoll.address());
    }

    #[test]
    fn cached_objects_are_loadable() {
        let vm = testing::vm();
        Thread::ensure_init();
        assert!(Thread::can_load_from_thread(vm.specials().bool_true));
        assert_eq!(
            Thread::offset_from_thread(vm.specials().null),
            Some(Thread::constant_offset(CachedConstant::ObjectNull))
        );
        let stubs = vm.stubs().expect("stubs installed");
        assert!(Thread::can_load_from_thread(stubs.invoke_dart_code.code));
        assert!(!Thread::can_load_from_thread(ObjectRef::NULL));
        assert!(!Thread::can_load_from_thread(vm.predefined_symbols()[0]));
    }

    #[test]
    fn every_runtime_entry_has_an_offset() {
        for entry in crate::RUNTIME_ENTRIES {
            let offset = Thread::offset_from_thread_entry(entry);
            assert!(THREAD_OFFSETS.iter().any(|e| e.offset == offset));
        }
    }
}
