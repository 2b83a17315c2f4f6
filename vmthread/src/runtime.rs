//! Runtime entries callable from generated code.
//!
//! The list is declared once in [`runtime_entry_list`] and expanded into the
//! entry descriptors, the id enum and the per-thread entry-point cache.
use std::{
    ffi::{CStr, c_char},
    mem,
};

use crate::{ObjectRef, Thread, VmTag};

/// `(Id, entry_point_field, function, argument_count, is_leaf)`
macro_rules! runtime_entry_list {
    ($v:ident) => {
        $v! {
            (UpdateStoreBuffer, update_store_buffer_entry_point, drt_update_store_buffer, 2, true),
            (AllocateObject, allocate_object_entry_point, drt_allocate_object, 2, false),
            (SafepointPoll, safepoint_poll_entry_point, drt_safepoint_poll, 1, false),
            (PrintStopMessage, print_stop_message_entry_point, drt_print_stop_message, 1, true),
        }
    };
}

macro_rules! define_runtime_entries {
    ($(($id:ident, $field:ident, $function:ident, $argc:expr, $leaf:expr)),* $(,)?) => {
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum RuntimeEntryId {
            $($id,)*
        }

        impl RuntimeEntryId {
            pub const ALL: &'static [RuntimeEntryId] = &[$(RuntimeEntryId::$id,)*];

            /// Address of the native function implementing the entry.
            pub fn address(self) -> usize {
                match self {
                    $(Self::$id => $function as usize,)*
                }
            }

            pub fn entry(self) -> &'static RuntimeEntry {
                &RUNTIME_ENTRIES[self as usize]
            }
        }

        pub static RUNTIME_ENTRIES: &[RuntimeEntry] = &[
            $(RuntimeEntry {
                id: RuntimeEntryId::$id,
                name: stringify!($id),
                argument_count: $argc,
                is_leaf: $leaf,
            },)*
        ];

        /// Cached entry addresses, embedded in every thread.
        #[repr(C)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct RuntimeEntryPoints {
            $(pub $field: usize,)*
        }

        impl RuntimeEntryPoints {
            pub const fn empty() -> Self {
                Self { $($field: 0,)* }
            }

            pub fn resolve() -> Self {
                Self { $($field: RuntimeEntryId::$id.address(),)* }
            }

            /// Offset of the entry's slot relative to this struct.
            pub const fn offset_of(id: RuntimeEntryId) -> usize {
                match id {
                    $(RuntimeEntryId::$id => mem::offset_of!(RuntimeEntryPoints, $field),)*
                }
            }

            pub const FIELD_NAMES: &'static [&'static str] = &[$(stringify!($field),)*];
        }
    };
}

runtime_entry_list!(define_runtime_entries);

#[derive(Debug)]
pub struct RuntimeEntry {
    pub id: RuntimeEntryId,
    pub name: &'static str,
    pub argument_count: usize,
    pub is_leaf: bool,
}

impl RuntimeEntry {
    pub fn function(&self) -> usize {
        self.id.address()
    }

    pub fn by_name(name: &str) -> Option<&'static RuntimeEntry> {
        RUNTIME_ENTRIES.iter().find(|entry| entry.name == name)
    }
}

/// Runs a native function with the thread tagged as being in native code.
pub extern "C" fn native_call_wrapper(thread: *mut Thread, function: extern "C" fn(*mut Thread)) {
    // SAFETY: generated code passes its own thread
    let Some(current) = (unsafe { thread.as_mut() }) else {
        function(thread);
        return;
    };
    let saved = current.vm_tag();
    current.set_vm_tag(VmTag::Native);
    function(thread);
    // SAFETY: the thread outlives the native call
    unsafe { (*thread).set_vm_tag(saved) };
}

pub fn native_call_wrapper_address() -> usize {
    native_call_wrapper as usize
}

extern "C" fn drt_update_store_buffer(thread: *mut Thread, obj: usize) {
    // SAFETY: generated code passes its own thread
    if let Some(thread) = unsafe { thread.as_mut() } {
        thread.store_buffer_add_object(ObjectRef::from_addr(obj));
    }
}

extern "C" fn drt_allocate_object(thread: *mut Thread, size: usize) -> usize {
    // SAFETY: generated code passes its own thread
    let Some(thread) = (unsafe { thread.as_mut() }) else {
        return 0;
    };
    match thread.allocate(size) {
        Ok(obj) => obj.addr(),
        Err(err) => {
            log::warn!("runtime allocation of {size} bytes failed: {err}");
            0
        }
    }
}

extern "C" fn drt_safepoint_poll(thread: *mut Thread) {
    // SAFETY: generated code passes its own thread
    if let Some(thread) = unsafe { thread.as_mut() } {
        thread.safepoint_poll();
    }
}

extern "C" fn drt_print_stop_message(message: *const c_char) {
    if message.is_null() {
        return;
    }
    // SAFETY: generated code passes a nul terminated string
    let message = unsafe { CStr::from_ptr(message) };
    log::info!("stop message: {}", message.to_string_lossy());
}
