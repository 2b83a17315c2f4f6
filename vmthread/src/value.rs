//! ObjectRef: raw, untyped reference into a garbage collected heap.
//!
//! The collector may move objects, so an ObjectRef is only stable while it is
//! reachable from a root (reusable handle, cached constant, store buffer).
use std::{fmt, ptr::NonNull};

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectRef(usize);

impl ObjectRef {
    /// The empty reference. Distinct from the VM's `null` object.
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub fn from_ptr<T>(ptr: NonNull<T>) -> Self {
        Self(ptr.as_ptr() as usize)
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn as_ptr<T>(self) -> Option<NonNull<T>> {
        NonNull::new(self.0 as *mut T)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ObjectRef(null)")
        } else {
            write!(f, "ObjectRef({:#x})", self.0)
        }
    }
}
