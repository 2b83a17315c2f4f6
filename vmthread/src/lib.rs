mod constants;
mod error;
mod handles;
mod heap;
mod interrupter;
mod isolate;
mod long_jump;
mod offsets;
mod os_thread;
mod resource;
mod runtime;
mod safepoint;
mod store_buffer;
mod system;
mod thread;
mod timeline;
mod value;
mod view;
mod visitor;
mod vm;
mod zone;

#[cfg(test)]
mod testing;

pub use constants::{CachedConstant, CachedConstants, CachedKind};
pub use error::{SettingsError, VmError};
pub use handles::{ReusableHandleKind, ReusableHandleScope, ReusableHandles};
pub use heap::{Heap, OBJECT_ALIGNMENT};
pub use interrupter::{InterruptedThreadState, ThreadInterruptCallback, ThreadInterrupter};
pub use isolate::{
    ArchivedState, ClassId, ClassInfo, ClassTable, Isolate, IsolateCreateInfo, IsolateSettings,
};
pub use long_jump::{LongJumpScope, Unwind};
pub use offsets::{THREAD_LAYOUT_VERSION, THREAD_OFFSET_COUNT, THREAD_OFFSETS, ThreadOffset, thread_offset};
pub use os_thread::{ThreadId, VmTag};
pub use resource::{ResourceKind, ResourceNode, StackResource};
pub use runtime::{
    RUNTIME_ENTRIES, RuntimeEntry, RuntimeEntryId, RuntimeEntryPoints, native_call_wrapper,
};
pub use safepoint::SafepointHandler;
pub use store_buffer::{RecordSet, StoreBuffer, StoreBufferBlock, ThresholdPolicy};
pub use system::{OS_PAGE_SIZE, map_memory, unmap_memory};
pub use thread::{AttachState, IsolateScopedState, Thread};
pub use timeline::{TimelineEvent, TimelineEventBlock, TimelineSlot, monotonic_micros};
pub use value::ObjectRef;
pub use view::View;
pub use visitor::{RootProvider, RootSet};
pub use vm::{SpecialObjects, StubCode, StubEntry, Vm, VmCreateInfo, VmSettings};
pub use zone::Zone;
