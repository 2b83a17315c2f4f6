//! Scoped resources: an intrusive LIFO chain rooted in the thread's
//! [`IsolateScopedState`](crate::IsolateScopedState).
//!
//! Every resource is represented by a heap node so the guard can move
//! freely while the chain keeps a stable address. Releasing a node that is
//! not the top of the chain is a contract violation.
use std::{marker::PhantomData, ptr::NonNull};

use crate::{Thread, VmSettings, Zone};

#[derive(Debug)]
pub enum ResourceKind {
    Marker(&'static str),
    Zone { zone: Box<Zone>, previous: *mut Zone },
    NoSafepoint,
    NoHandles,
}

impl ResourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            ResourceKind::Marker(name) => *name,
            ResourceKind::Zone { .. } => "zone",
            ResourceKind::NoSafepoint => "no-safepoint",
            ResourceKind::NoHandles => "no-handles",
        }
    }
}

#[derive(Debug)]
pub struct ResourceNode {
    previous: *mut ResourceNode,
    thread: *mut Thread,
    released: bool,
    kind: ResourceKind,
}

impl ResourceNode {
    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn previous(&self) -> Option<&ResourceNode> {
        // SAFETY: nodes below the top outlive it
        unsafe { self.previous.as_ref() }
    }
}

/// Guard for one scoped resource. Dropping it releases the resource.
#[must_use = "dropping the guard releases the resource immediately"]
#[derive(Debug)]
pub struct StackResource {
    node: NonNull<ResourceNode>,
    _not_send: PhantomData<*mut ()>,
}

impl StackResource {
    pub fn name(&self) -> &'static str {
        // SAFETY: the node lives until this guard drops
        unsafe { self.node.as_ref() }.kind.name()
    }
}

impl Drop for StackResource {
    fn drop(&mut self) {
        let node = self.node.as_ptr();
        // SAFETY: the node is owned by this guard
        if unsafe { (*node).released } {
            // SAFETY: released by an unwind, only this guard still refers to it
            drop(unsafe { Box::from_raw(node) });
            return;
        }
        // SAFETY: the thread outlives every resource on its chain
        let thread = unsafe { &mut *(*node).thread };
        if thread.state.top_resource != node {
            if std::thread::panicking() {
                return;
            }
            panic!("scoped resources must be released in reverse order of acquisition");
        }
        thread.pop_resource();
        // SAFETY: popped above, nothing references the node anymore
        drop(unsafe { Box::from_raw(node) });
    }
}

impl Thread {
    fn push_resource(&mut self, kind: ResourceKind) -> StackResource {
        let node = Box::new(ResourceNode {
            previous: self.state.top_resource,
            thread: self,
            released: false,
            kind,
        });
        let node = Box::into_raw(node);
        self.state.top_resource = node;
        StackResource {
            // SAFETY: Box::into_raw is never null
            node: unsafe { NonNull::new_unchecked(node) },
            _not_send: PhantomData,
        }
    }

    /// Runs the release action of the top node and unlinks it.
    fn pop_resource(&mut self) {
        let node = self.state.top_resource;
        assert!(!node.is_null(), "scoped resource chain underflow");
        // SAFETY: the top node is alive until its guard frees it
        let node = unsafe { &mut *node };
        match &mut node.kind {
            ResourceKind::Marker(_) => {}
            ResourceKind::Zone { previous, .. } => self.state.zone = *previous,
            ResourceKind::NoSafepoint => {
                #[cfg(debug_assertions)]
                {
                    self.state.no_safepoint_scope_depth -= 1;
                }
            }
            ResourceKind::NoHandles => {
                #[cfg(debug_assertions)]
                {
                    self.state.no_handle_scope_depth -= 1;
                }
            }
        }
        node.released = true;
        self.state.top_resource = node.previous;
    }

    /// Releases every resource above `saved`, newest first. The guards free
    /// their nodes when they go out of scope.
    pub(crate) fn unwind_resources_to(&mut self, saved: *mut ResourceNode) {
        while self.state.top_resource != saved {
            log::trace!(
                "unwinding scoped resource '{}'",
                // SAFETY: non-null, checked by the loop and pop_resource
                unsafe { self.state.top_resource.as_ref() }.map_or("?", |n| n.kind.name())
            );
            self.pop_resource();
        }
    }

    pub fn acquire_resource(&mut self, name: &'static str) -> StackResource {
        self.push_resource(ResourceKind::Marker(name))
    }

    /// Opens a new zone. Allocation through [`Thread::zone`] goes to it
    /// until the guard drops.
    pub fn enter_zone(&mut self) -> StackResource {
        let segment_size = crate::Vm::get()
            .map_or(VmSettings::default().zone_segment_size, |vm| {
                vm.settings().zone_segment_size
            });
        let mut zone = Box::new(Zone::new(segment_size));
        let previous = self.state.zone;
        self.state.zone = &mut *zone;
        self.push_resource(ResourceKind::Zone { zone, previous })
    }

    pub fn zone(&mut self) -> Option<&mut Zone> {
        // SAFETY: owned by the zone resource on top of the chain
        unsafe { self.state.zone.as_mut() }
    }

    /// Marks a region in which the thread must not reach a safepoint.
    pub fn no_safepoint_scope(&mut self) -> StackResource {
        #[cfg(debug_assertions)]
        {
            self.state.no_safepoint_scope_depth += 1;
        }
        self.push_resource(ResourceKind::NoSafepoint)
    }

    /// Marks a region in which new reusable handles must not be checked out.
    pub fn no_handle_scope(&mut self) -> StackResource {
        #[cfg(debug_assertions)]
        {
            self.state.no_handle_scope_depth += 1;
        }
        self.push_resource(ResourceKind::NoHandles)
    }

    pub fn top_resource(&self) -> Option<&ResourceNode> {
        // SAFETY: the top node is alive until its guard frees it
        unsafe { self.state.top_resource.as_ref() }
    }

    pub fn resource_depth(&self) -> usize {
        std::iter::successors(self.top_resource(), |node| node.previous()).count()
    }
}

#[cfg(test)]
mod tests {
    use crate::Thread;
    use std::{alloc::Layout, thread};

    #[test]
    fn reverse_order_release_succeeds() {
        let mut thread = Thread::ensure_init();
        let a = thread.acquire_resource("a");
        let b = thread.acquire_resource("b");
        let c = thread.acquire_resource("c");
        assert_eq!(thread.resource_depth(), 3);
        assert_eq!(thread.top_resource().unwrap().kind().name(), "c");
        assert_eq!(b.name(), "b");
        drop(c);
        drop(b);
        assert_eq!(thread.top_resource().unwrap().kind().name(), "a");
        drop(a);
        assert!(thread.top_resource().is_none());
    }

    #[test]
    fn out_of_order_release_is_rejected() {
        let result = thread::spawn(|| {
            let mut thread = Thread::ensure_init();
            let a = thread.acquire_resource("a");
            let _b = thread.acquire_resource("b");
            drop(a);
        })
        .join();
        let panic = result.unwrap_err();
        let message = panic.downcast_ref::<&str>().copied().unwrap_or_default();
        assert_eq!(
            message,
            "scoped resources must be released in reverse order of acquisition"
        );
    }

    #[test]
    fn zones_nest_and_restore() {
        thread::spawn(|| {
            let mut thread = Thread::ensure_init();
            assert!(thread.zone().is_none());

            let outer = thread.enter_zone();
            let outer_ptr = thread.zone().unwrap() as *mut _;
            thread.zone().unwrap().alloc(Layout::new::<u64>()).unwrap();
            {
                let _inner = thread.enter_zone();
                assert_ne!(thread.zone().unwrap() as *mut _, outer_ptr);
                assert_eq!(thread.zone().unwrap().size_in_bytes(), 0);
            }
            assert_eq!(thread.zone().unwrap() as *mut _, outer_ptr);
            assert_eq!(thread.zone().unwrap().size_in_bytes(), 8);
            drop(outer);
            assert!(thread.zone().is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    #[cfg(debug_assertions)]
    fn scope_depths_are_tracked() {
        thread::spawn(|| {
            let mut thread = Thread::ensure_init();
            let a = thread.no_safepoint_scope();
            let b = thread.no_safepoint_scope();
            let c = thread.no_handle_scope();
            assert_eq!(thread.scoped_state().no_safepoint_scope_depth, 2);
            assert_eq!(thread.scoped_state().no_handle_scope_depth, 1);
            drop(c);
            drop(b);
            drop(a);
            assert!(thread.scoped_state().is_clear());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn unwinding_releases_down_to_the_saved_node() {
        thread::spawn(|| {
            let mut thread = Thread::ensure_init();
            let base = thread.acquire_resource("base");
            let saved = thread.state.top_resource;
            let zone = thread.enter_zone();
            let marker = thread.acquire_resource("marker");

            thread.unwind_resources_to(saved);
            assert_eq!(thread.resource_depth(), 1);
            assert!(thread.zone().is_none());

            drop(zone);
            drop(marker);
            drop(base);
            assert_eq!(thread.resource_depth(), 0);
        })
        .join()
        .unwrap();
    }
}
