//! Per-thread runtime environment and async-operation tracking
//!
//! The runtime binds one `Environment` to each thread that executes
//! script. The environment owns the pieces of async bookkeeping the
//! callback scope bridge manipulates:
//!
//! - the async-context id allocator (`async_init` / `async_destroy`)
//! - the implicit async-context stack that scopes push onto and pop from
//! - the diagnostic hook registry (init/before/after/destroy events)
//!
//! None of this is synchronized. Open/close and everything else here must
//! run on the environment's own thread; only the executor's wakeup path
//! ever crosses threads, and it touches none of this state.

use std::cell::{Cell, OnceCell, RefCell};

use crate::abi::{self, QuillValue};
use crate::error::{Error, Result, Status};
use crate::heap::HeapPtr;
use crate::scope::ScopeGuard;

/// Diagnostic event delivered to registered async hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookEvent {
    /// An async operation was registered via `async_init`.
    Init { async_id: u64, trigger_id: u64 },
    /// Execution entered a callback scope for the operation.
    Before { async_id: u64 },
    /// Execution left the callback scope.
    After { async_id: u64 },
    /// The operation was destroyed via `async_destroy`.
    Destroy { async_id: u64 },
}

pub type HookFn = Box<dyn Fn(&HookEvent)>;

/// One frame of the environment's async-context stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AsyncFrame {
    pub async_id: u64,
    pub trigger_id: u64,
}

/// Identifier for one logical asynchronous operation.
///
/// Created by [`Environment::async_init`], destroyed by
/// [`Environment::async_destroy`]. The callback scope bridge only borrows
/// it for the duration of an open call; it never copies or destroys it.
pub struct AsyncContext {
    async_id: u64,
    trigger_id: u64,
    resource: HeapPtr,
    name: String,
}

impl AsyncContext {
    pub fn async_id(&self) -> u64 {
        self.async_id
    }

    pub fn trigger_id(&self) -> u64 {
        self.trigger_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resource object as a value handle, for re-entering scopes.
    pub fn resource_value(&self) -> QuillValue {
        QuillValue::pointer(self.resource)
    }

    /// Run `f` inside a callback scope for this operation.
    ///
    /// The scope is opened against the current thread's environment and
    /// closed on every exit path, including unwinding out of `f`.
    pub fn enter<R>(&self, f: impl FnOnce(&Environment) -> R) -> Result<R> {
        let env = Environment::current()?;
        let guard = ScopeGuard::enter(env, self)?;
        let out = f(env);
        drop(guard);
        Ok(out)
    }
}

impl std::fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AsyncContext({}, id {}, trigger {})",
            self.name, self.async_id, self.trigger_id
        )
    }
}

/// The thread-bound runtime instance.
pub struct Environment {
    next_async_id: Cell<u64>,
    stack: RefCell<Vec<AsyncFrame>>,
    hooks: RefCell<Vec<HookFn>>,
    scopes_opened: Cell<u64>,
    scopes_closed: Cell<u64>,
}

impl Environment {
    fn new() -> Self {
        Self {
            // Id 0 is reserved for the root (no async operation)
            next_async_id: Cell::new(1),
            stack: RefCell::new(Vec::new()),
            hooks: RefCell::new(Vec::new()),
            scopes_opened: Cell::new(0),
            scopes_closed: Cell::new(0),
        }
    }

    /// Bind an environment to the current thread, or return the one
    /// already bound.
    pub fn init() -> &'static Environment {
        CURRENT.with(|cell| {
            let env = cell.get_or_init(Environment::new);
            // Safety: same contract as heap(): the reference never leaves
            // this thread and the thread-local is never moved.
            unsafe { &*(env as *const Environment) }
        })
    }

    /// The environment bound to the current thread.
    ///
    /// Fails with `GenericFailure` when no environment exists: the
    /// runtime is not active on this thread and no scope operation may
    /// proceed.
    pub fn current() -> Result<&'static Environment> {
        CURRENT.with(|cell| match cell.get() {
            Some(env) => Ok(unsafe { &*(env as *const Environment) }),
            None => Err(Error::from(Status::GenericFailure)),
        })
    }

    /// Register a new async operation and hand back its context.
    ///
    /// `resource` must designate an object; it is what diagnostic hooks
    /// receive to describe the operation. The trigger id records which
    /// async operation (if any) was current at registration time.
    pub fn async_init(&self, resource: QuillValue, name: &str) -> Result<AsyncContext> {
        let resource = abi::resolve_object(resource)?;
        let async_id = self.next_async_id.get();
        self.next_async_id.set(async_id + 1);
        let trigger_id = self.current_async_id();

        let ctx = AsyncContext {
            async_id,
            trigger_id,
            resource,
            name: name.to_string(),
        };
        log::trace!("async_init {:?}", ctx);
        self.emit(&HookEvent::Init {
            async_id,
            trigger_id,
        });
        Ok(ctx)
    }

    /// Unregister an async operation.
    pub fn async_destroy(&self, ctx: AsyncContext) {
        log::trace!("async_destroy {:?}", ctx);
        self.emit(&HookEvent::Destroy {
            async_id: ctx.async_id,
        });
    }

    /// Register a diagnostic hook. Hooks stay registered for the life of
    /// the environment.
    pub fn add_hook(&self, hook: impl Fn(&HookEvent) + 'static) {
        self.hooks.borrow_mut().push(Box::new(hook));
    }

    /// Depth of the async-context stack.
    pub fn stack_depth(&self) -> usize {
        self.stack.borrow().len()
    }

    /// The async id execution is currently inside, or 0 at the root.
    pub fn current_async_id(&self) -> u64 {
        self.stack.borrow().last().map_or(0, |frame| frame.async_id)
    }

    /// Scopes opened on this environment since creation.
    pub fn scopes_opened(&self) -> u64 {
        self.scopes_opened.get()
    }

    /// Scopes closed on this environment since creation.
    pub fn scopes_closed(&self) -> u64 {
        self.scopes_closed.get()
    }

    pub(crate) fn push_frame(&self, frame: AsyncFrame) {
        self.stack.borrow_mut().push(frame);
        self.scopes_opened.set(self.scopes_opened.get() + 1);
    }

    pub(crate) fn pop_frame(&self) -> Option<AsyncFrame> {
        let frame = self.stack.borrow_mut().pop();
        if frame.is_some() {
            self.scopes_closed.set(self.scopes_closed.get() + 1);
        }
        frame
    }

    pub(crate) fn emit(&self, event: &HookEvent) {
        for hook in self.hooks.borrow().iter() {
            hook(event);
        }
    }
}

thread_local! {
    static CURRENT: OnceCell<Environment> = const { OnceCell::new() };
}
