//! Per-thread copies of VM-global constants.
//!
//! Generated code loads these at fixed offsets from the thread pointer
//! instead of materializing them. The list below is the single source for
//! the struct layout, its initializer, the lookup used by the compiler and
//! the offset table.
use std::mem;

use crate::{ObjectRef, RuntimeEntryPoints, Vm, runtime::native_call_wrapper_address};

/// `(field, Id, vm => value)`. A value of `None` means the source does not
/// exist yet (stubs before the second lifecycle hook).
macro_rules! cached_constants_list {
    ($v:ident) => {
        $v! {
            objects {
                (object_null, ObjectNull, vm => Some(vm.specials().null)),
                (bool_true, BoolTrue, vm => Some(vm.specials().bool_true)),
                (bool_false, BoolFalse, vm => Some(vm.specials().bool_false)),
                (update_store_buffer_code, UpdateStoreBufferCode,
                    vm => vm.stubs().map(|s| s.update_store_buffer.code)),
                (fix_callers_target_code, FixCallersTargetCode,
                    vm => vm.stubs().map(|s| s.fix_callers_target.code)),
                (fix_allocation_stub_code, FixAllocationStubCode,
                    vm => vm.stubs().map(|s| s.fix_allocation_stub_target.code)),
                (invoke_dart_code_stub, InvokeDartCodeStub,
                    vm => vm.stubs().map(|s| s.invoke_dart_code.code)),
            }
            addresses {
                (update_store_buffer_entry_point, UpdateStoreBufferEntryPoint,
                    vm => vm.stubs().map(|s| s.update_store_buffer.entry_point)),
                (native_call_wrapper_entry_point, NativeCallWrapperEntryPoint,
                    _vm => Some(native_call_wrapper_address())),
                (predefined_symbols_address, PredefinedSymbolsAddress,
                    vm => Some(vm.predefined_symbols_address())),
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedKind {
    Object,
    Address,
}

macro_rules! define_cached_constants {
    (
        objects { $(($obj:ident, $obj_id:ident, $obj_vm:ident => $obj_init:expr)),* $(,)? }
        addresses { $(($addr:ident, $addr_id:ident, $addr_vm:ident => $addr_init:expr)),* $(,)? }
    ) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CachedConstant {
            $($obj_id,)*
            $($addr_id,)*
        }

        impl CachedConstant {
            pub const ALL: &'static [CachedConstant] = &[
                $(CachedConstant::$obj_id,)*
                $(CachedConstant::$addr_id,)*
            ];

            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$obj_id => stringify!($obj),)*
                    $(Self::$addr_id => stringify!($addr),)*
                }
            }

            pub const fn kind(self) -> CachedKind {
                match self {
                    $(Self::$obj_id => CachedKind::Object,)*
                    $(Self::$addr_id => CachedKind::Address,)*
                }
            }
        }

        #[repr(C)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct CachedConstants {
            $(pub $obj: ObjectRef,)*
            $(pub $addr: usize,)*
            pub entry_points: RuntimeEntryPoints,
        }

        impl CachedConstants {
            pub const fn empty() -> Self {
                Self {
                    $($obj: ObjectRef::NULL,)*
                    $($addr: 0,)*
                    entry_points: RuntimeEntryPoints::empty(),
                }
            }

            pub fn from_vm(vm: &Vm) -> Self {
                Self {
                    $($obj: {
                        let $obj_vm: &Vm = vm;
                        $obj_init
                    }
                    .unwrap_or(ObjectRef::NULL),)*
                    $($addr: {
                        let $addr_vm: &Vm = vm;
                        $addr_init
                    }
                    .unwrap_or(0),)*
                    entry_points: RuntimeEntryPoints::resolve(),
                }
            }

            /// Offset of the slot relative to this struct.
            pub const fn offset_of(constant: CachedConstant) -> usize {
                match constant {
                    $(CachedConstant::$obj_id => mem::offset_of!(CachedConstants, $obj),)*
                    $(CachedConstant::$addr_id => mem::offset_of!(CachedConstants, $addr),)*
                }
            }

            /// The object slot currently holding `obj`. Never matches null.
            pub fn find_object(&self, obj: ObjectRef) -> Option<CachedConstant> {
                if obj.is_null() {
                    return None;
                }
                $(if self.$obj == obj {
                    return Some(CachedConstant::$obj_id);
                })*
                None
            }

            pub fn address(&self, constant: CachedConstant) -> Option<usize> {
                match constant {
                    $(CachedConstant::$addr_id => Some(self.$addr),)*
                    _ => None,
                }
            }

            pub fn visit_objects(&mut self, visitor: &mut dyn FnMut(&mut ObjectRef)) {
                $(visitor(&mut self.$obj);)*
            }
        }
    };
}

cached_constants_list!(define_cached_constants);

impl Default for CachedConstants {
    fn default() -> Self {
        Self::empty()
    }
}

impl CachedConstants {
    pub const fn entry_points_offset() -> usize {
        mem::offset_of!(CachedConstants, entry_points)
    }
}
