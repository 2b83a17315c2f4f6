//! Reusable handles: one long-lived slot per tracked object kind, owned by
//! the thread, so hot runtime paths never allocate a handle.
//!
//! A slot is checked out with a [`ReusableHandleScope`]. Checked builds keep
//! an active flag per slot and reject a second checkout.
use crate::{ObjectRef, Thread};

/// `(Kind, accessor)`
macro_rules! reusable_handle_list {
    ($v:ident) => {
        $v! {
            (AbstractType, abstract_type_handle),
            (Array, array_handle),
            (Class, class_handle),
            (Code, code_handle),
            (Error, error_handle),
            (ExceptionHandlers, exception_handlers_handle),
            (Field, field_handle),
            (Function, function_handle),
            (GrowableObjectArray, growable_object_array_handle),
            (Instance, instance_handle),
            (Library, library_handle),
            (Object, object_handle),
            (PcDescriptors, pc_descriptors_handle),
            (String, string_handle),
            (TypeArguments, type_arguments_handle),
            (TypeParameter, type_parameter_handle),
        }
    };
}

macro_rules! define_reusable_handles {
    ($(($kind:ident, $accessor:ident)),* $(,)?) => {
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ReusableHandleKind {
            $($kind,)*
        }

        impl ReusableHandleKind {
            pub const ALL: &'static [ReusableHandleKind] = &[$(ReusableHandleKind::$kind,)*];
            pub const COUNT: usize = Self::ALL.len();

            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$kind => stringify!($kind),)*
                }
            }
        }

        impl Thread {
            $(
                pub fn $accessor(&mut self) -> ReusableHandleScope {
                    ReusableHandleScope::new(self, ReusableHandleKind::$kind)
                }
            )*
        }
    };
}

reusable_handle_list!(define_reusable_handles);

#[derive(Debug, Clone, Copy, Default)]
struct ReusableHandle {
    raw: ObjectRef,
    #[cfg(debug_assertions)]
    active: bool,
}

#[derive(Debug)]
pub struct ReusableHandles {
    handles: [ReusableHandle; ReusableHandleKind::COUNT],
}

impl Default for ReusableHandles {
    fn default() -> Self {
        Self::new()
    }
}

impl ReusableHandles {
    pub fn new() -> Self {
        Self {
            handles: [ReusableHandle::default(); ReusableHandleKind::COUNT],
        }
    }

    pub fn get(&self, kind: ReusableHandleKind) -> ObjectRef {
        self.handles[kind as usize].raw
    }

    pub(crate) fn visit(&mut self, visitor: &mut dyn FnMut(&mut ObjectRef)) {
        for handle in &mut self.handles {
            if !handle.raw.is_null() {
                visitor(&mut handle.raw);
            }
        }
    }
}

/// A checked-out reusable handle. Cleared when dropped.
#[must_use = "the handle is released when the scope drops"]
#[derive(Debug)]
pub struct ReusableHandleScope {
    thread: *mut Thread,
    kind: ReusableHandleKind,
}

impl ReusableHandleScope {
    pub fn new(thread: &mut Thread, kind: ReusableHandleKind) -> Self {
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(
                thread.state.no_handle_scope_depth, 0,
                "reusable handle checked out inside a no-handle scope"
            );
            let handle = &mut thread.reusable_handles.handles[kind as usize];
            assert!(
                !handle.active,
                "reusable handle {} is already checked out",
                kind.name()
            );
            handle.active = true;
        }
        Self { thread, kind }
    }

    fn slot(&self) -> &ReusableHandle {
        // SAFETY: the owning thread outlives scopes opened on it
        let thread = unsafe { &*self.thread };
        &thread.reusable_handles.handles[self.kind as usize]
    }

    fn slot_mut(&mut self) -> &mut ReusableHandle {
        // SAFETY: as above, and only this scope writes its slot
        let thread = unsafe { &mut *self.thread };
        &mut thread.reusable_handles.handles[self.kind as usize]
    }

    pub fn kind(&self) -> ReusableHandleKind {
        self.kind
    }

    pub fn get(&self) -> ObjectRef {
        self.slot().raw
    }

    pub fn set(&mut self, obj: ObjectRef) {
        self.slot_mut().raw = obj;
    }
}

impl Drop for ReusableHandleScope {
    fn drop(&mut self) {
        let slot = self.slot_mut();
        slot.raw = ObjectRef::NULL;
        #[cfg(debug_assertions)]
        {
            slot.active = false;
        }
    }
}

impl Thread {
    /// Empties every reusable handle.
    pub fn clear_reusable_handles(&mut self) {
        for handle in &mut self.reusable_handles.handles {
            handle.raw = ObjectRef::NULL;
        }
    }

    #[cfg(debug_assertions)]
    pub fn is_any_reusable_handle_scope_active(&self) -> bool {
        self.reusable_handles.handles.iter().any(|h| h.active)
    }

    pub fn reusable_handle(&self, kind: ReusableHandleKind) -> ObjectRef {
        self.reusable_handles.get(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn every_kind_has_a_slot() {
        assert_eq!(ReusableHandleKind::COUNT, 16);
        assert_eq!(ReusableHandleKind::ALL[0].name(), "AbstractType");
        assert_eq!(ReusableHandleKind::TypeParameter as usize, 15);
    }

    #[test]
    fn scope_clears_the_handle_on_exit() {
        thread::spawn(|| {
            let mut thread = Thread::ensure_init();
            {
                let mut array = thread.array_handle();
                array.set(ObjectRef::from_addr(0x40));
                assert_eq!(array.get(), ObjectRef::from_addr(0x40));
                assert_eq!(thread.reusable_handle(ReusableHandleKind::Array), ObjectRef::from_addr(0x40));
                #[cfg(debug_assertions)]
                assert!(thread.is_any_reusable_handle_scope_active());
            }
            assert!(thread.reusable_handle(ReusableHandleKind::Array).is_null());
            #[cfg(debug_assertions)]
            assert!(!thread.is_any_reusable_handle_scope_active());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn different_kinds_can_be_held_together() {
        thread::spawn(|| {
            let mut thread = Thread::ensure_init();
            let mut class = thread.class_handle();
            let mut code = thread.code_handle();
            class.set(ObjectRef::from_addr(8));
            code.set(ObjectRef::from_addr(16));
            assert_eq!(class.kind(), ReusableHandleKind::Class);
            assert_ne!(class.get(), code.get());
        })
        .join()
        .unwrap();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "reusable handle Function is already checked out")]
    fn double_checkout_is_rejected() {
        let mut thread = Thread::ensure_init();
        let _first = thread.function_handle();
        let _second = thread.function_handle();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "reusable handle checked out inside a no-handle scope")]
    fn checkout_inside_no_handle_scope_is_rejected() {
        let mut thread = Thread::ensure_init();
        let _scope = thread.no_handle_scope();
        let _code = thread.code_handle();
    }

    #[test]
    fn clear_empties_every_handle() {
        thread::spawn(|| {
            let mut thread = Thread::ensure_init();
            let mut string = thread.string_handle();
            let mut library = thread.library_handle();
            string.set(ObjectRef::from_addr(8));
            library.set(ObjectRef::from_addr(16));
            thread.clear_reusable_handles();
            for &kind in ReusableHandleKind::ALL {
                assert!(thread.reusable_handle(kind).is_null());
            }
        })
        .join()
        .unwrap();
    }
}
