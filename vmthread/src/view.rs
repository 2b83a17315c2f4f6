use std::{
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

/// Unchecked, non-owning view of a VM structure that lives at a stable
/// address (a registered thread, a zone inside a resource node).
///
/// The creator guarantees the target outlives the view and that it is only
/// used from the owning OS thread.
#[derive(Debug)]
pub struct View<T>(NonNull<T>);

impl<T> Clone for View<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for View<T> {}

impl<T> PartialEq for View<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for View<T> {}

impl<T> View<T> {
    pub fn new(ptr: NonNull<T>) -> Self {
        Self(ptr)
    }

    pub fn from_ptr(ptr: *mut T) -> Option<Self> {
        let ptr = NonNull::new(ptr)?;
        Some(Self(ptr))
    }

    pub fn as_ptr(self) -> *mut T {
        self.0.as_ptr()
    }
}

impl<T> Deref for View<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        // SAFETY: creator guarantees liveness
        unsafe { self.0.as_ref() }
    }
}

impl<T> DerefMut for View<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: creator guarantees liveness and thread confinement
        unsafe { self.0.as_mut() }
    }
}
