//! Recovery points for VM-internal aborts.
//!
//! A recovery point records the top of the resource chain when it is set
//! up. [`Thread::long_jump`] releases everything acquired since then, stores
//! the error and hands back an [`Unwind`] token that the caller returns with
//! `Err(..)?` until it reaches [`Thread::with_long_jump_scope`].
use std::ptr;

use crate::{ResourceNode, Thread, VmError};

#[derive(Debug)]
pub struct LongJumpScope {
    previous: *mut LongJumpScope,
    top_resource: *mut ResourceNode,
    error: Option<VmError>,
}

/// Proof that a long jump to the innermost recovery point is in flight.
#[derive(Debug)]
#[must_use = "return the token to reach the recovery point"]
pub struct Unwind(());

impl Thread {
    /// Runs `f` with a fresh recovery point on top of the chain.
    pub fn with_long_jump_scope<T>(
        &mut self,
        f: impl FnOnce(&mut Thread) -> Result<T, Unwind>,
    ) -> Result<T, VmError> {
        let mut scope = LongJumpScope {
            previous: self.state.long_jump_base,
            top_resource: self.state.top_resource,
            error: None,
        };
        let scope_ptr: *mut LongJumpScope = &mut scope;
        self.state.long_jump_base = scope_ptr;

        let result = f(self);

        assert!(
            ptr::eq(self.state.long_jump_base, scope_ptr),
            "recovery points must be exited in reverse order"
        );
        // SAFETY: scope_ptr points at the local above
        let scope = unsafe { &mut *scope_ptr };
        self.state.long_jump_base = scope.previous;
        match result {
            Ok(value) => Ok(value),
            Err(Unwind(())) => Err(scope
                .error
                .take()
                .unwrap_or_else(|| VmError::Message("long jump without an error".to_string()))),
        }
    }

    /// Aborts to the innermost recovery point. Every scoped resource acquired
    /// after it is released before this returns.
    pub fn long_jump(&mut self, error: VmError) -> Unwind {
        let base = self.state.long_jump_base;
        assert!(
            !base.is_null(),
            "long jump without an active recovery point"
        );
        // SAFETY: recovery points unlink themselves before their frame ends
        let scope = unsafe { &mut *base };
        log::debug!("{} long jump: {error}", self.id());
        self.unwind_resources_to(scope.top_resource);
        scope.error = Some(error);
        Unwind(())
    }

    pub fn has_recovery_point(&self) -> bool {
        !self.state.long_jump_base.is_null()
    }
}
