//! Callback scope open/close
//!
//! A `CallbackScope` brackets the execution of a script-visible callback
//! that native code invokes from outside the normal call stack (thread
//! pool completion, timer, I/O completion). Opening pushes the operation's
//! async frame onto the environment's stack and fires the Before hook;
//! closing pops the frame and fires After. The runtime's async stack
//! traces and diagnostics stay consistent exactly as long as every open
//! is matched by one close in LIFO order on the same thread.
//!
//! Misuse (closing twice, closing a handle that was never opened,
//! closing out of order) corrupts the async stack and has no safe
//! recovery, so it fails fast: a panic here, which the release profile's
//! abort panic strategy turns into a process abort. Debug builds
//! additionally track live handles to catch double-close before the
//! backing allocation is touched.

use crate::abi::{self, QuillValue};
use crate::env::{AsyncContext, AsyncFrame, Environment, HookEvent};
use crate::error::Result;
use crate::heap::HeapPtr;

/// An open callback scope. Exclusively owned by the code that opened it
/// until handed to [`CallbackScope::close`].
pub struct CallbackScope {
    env: &'static Environment,
    resource: HeapPtr,
    async_id: u64,
    trigger_id: u64,
    /// Stack depth observed at open time; close verifies the pop returns
    /// the stack to exactly this depth.
    depth_at_open: usize,
}

impl std::fmt::Debug for CallbackScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackScope")
            .field("async_id", &self.async_id)
            .field("trigger_id", &self.trigger_id)
            .field("depth_at_open", &self.depth_at_open)
            .finish_non_exhaustive()
    }
}

impl CallbackScope {
    /// Open a scope for the async operation `ctx`, with `resource_value`
    /// as the object handed to diagnostic hooks.
    ///
    /// Fails with `ObjectExpected` when the resource does not designate an
    /// object; nothing is allocated and no bookkeeping changes in that
    /// case. The caller must be on `env`'s thread.
    pub fn open(
        env: &'static Environment,
        resource_value: QuillValue,
        ctx: &AsyncContext,
    ) -> Result<Box<CallbackScope>> {
        let resource = abi::resolve_object(resource_value)?;

        let scope = Box::new(CallbackScope {
            env,
            resource,
            async_id: ctx.async_id(),
            trigger_id: ctx.trigger_id(),
            depth_at_open: env.stack_depth(),
        });
        #[cfg(debug_assertions)]
        live::register(&*scope as *const CallbackScope as usize);

        env.push_frame(AsyncFrame {
            async_id: scope.async_id,
            trigger_id: scope.trigger_id,
        });
        env.emit(&HookEvent::Before {
            async_id: scope.async_id,
        });
        log::trace!(
            "open callback scope: async id {}, depth {}",
            scope.async_id,
            scope.depth_at_open + 1
        );
        Ok(scope)
    }

    /// Close the scope, releasing its resources and firing the After
    /// hook. Consumes the scope; there is no way to close twice through
    /// this API.
    ///
    /// Panics (aborts in release) when the scope is not the innermost one
    /// on its environment's stack.
    pub fn close(self: Box<Self>) {
        #[cfg(debug_assertions)]
        live::unregister(&*self as *const CallbackScope as usize);

        let frame = self.env.pop_frame();
        let balanced = matches!(frame, Some(f) if f.async_id == self.async_id)
            && self.env.stack_depth() == self.depth_at_open;
        if !balanced {
            panic!(
                "callback scope closed out of order: async id {} is not the innermost scope",
                self.async_id
            );
        }
        self.env.emit(&HookEvent::After {
            async_id: self.async_id,
        });
        log::trace!(
            "close callback scope: async id {}, depth {}",
            self.async_id,
            self.depth_at_open
        );
    }

    pub fn async_id(&self) -> u64 {
        self.async_id
    }

    /// The resource object as a value handle.
    pub fn resource_value(&self) -> QuillValue {
        QuillValue::pointer(self.resource)
    }
}

/// RAII wrapper guaranteeing the scope closes on every exit path,
/// including unwinding out of the bracketed callback.
pub struct ScopeGuard {
    scope: Option<Box<CallbackScope>>,
}

impl ScopeGuard {
    /// Open a scope for `ctx` using its own resource object.
    pub fn enter(env: &'static Environment, ctx: &AsyncContext) -> Result<ScopeGuard> {
        let scope = CallbackScope::open(env, ctx.resource_value(), ctx)?;
        Ok(ScopeGuard { scope: Some(scope) })
    }

    pub fn async_id(&self) -> u64 {
        // Invariant: the scope is present until drop
        self.scope.as_ref().map_or(0, |s| s.async_id())
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            scope.close();
        }
    }
}

/// Debug-builds-only table of live scope handles. Lets the ABI close path
/// detect double-close and close-without-open before touching the backing
/// allocation.
#[cfg(debug_assertions)]
mod live {
    use std::cell::RefCell;
    use std::collections::HashSet;

    thread_local! {
        static LIVE: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
    }

    pub(crate) fn register(addr: usize) {
        LIVE.with(|set| set.borrow_mut().insert(addr));
    }

    pub(crate) fn unregister(addr: usize) {
        let was_live = LIVE.with(|set| set.borrow_mut().remove(&addr));
        if !was_live {
            panic!(
                "callback scope handle {:#x} was never opened or is already closed",
                addr
            );
        }
    }

    pub(crate) fn is_live(addr: usize) -> bool {
        LIVE.with(|set| set.borrow().contains(&addr))
    }
}

/// Whether `addr` is a live scope handle on this thread (debug builds).
#[cfg(debug_assertions)]
pub(crate) fn handle_is_live(addr: usize) -> bool {
    live::is_live(addr)
}
