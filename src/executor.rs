//! Scoped executor for the runtime thread
//!
//! Native code spawns futures here (thread-pool completions, timers)
//! and the executor polls them on the environment's thread with every
//! poll bracketed by a callback scope for the task's async operation.
//! That is what keeps async stack traces and hooks correct when the
//! wakeup originates on some other thread.
//!
//! Wakers are the only part of a task that crosses threads. They touch
//! the scheduling state, the injector queue, and the unparker; the future
//! and the async context are only ever touched on the runtime thread.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal};
use parking::{Parker, Unparker};

use crate::abi::QuillValue;
use crate::env::{AsyncContext, Environment};
use crate::error::Result;
use crate::scope::ScopeGuard;

// Task state constants for cross-thread scheduling
pub const TASK_IDLE: u8 = 0;
pub const TASK_SCHEDULED: u8 = 1;
pub const TASK_COMPLETED: u8 = 2;

/// A future tied to an async operation.
pub struct ScopedTask {
    /// Present until the task completes; taken on the runtime thread to
    /// destroy the operation.
    context: Mutex<Option<AsyncContext>>,
    future: Mutex<Pin<Box<dyn Future<Output = ()> + Send>>>,
    state: AtomicU8,
    injector: Arc<Injector<Arc<ScopedTask>>>,
    unparker: Unparker,
}

// Safety: the context (which holds a heap pointer) and the future are
// only accessed from the runtime thread, by the executor. Wakers cloned
// onto other threads go through Wake below, which touches only the
// atomic state, the injector, and the unparker.
unsafe impl Send for ScopedTask {}
unsafe impl Sync for ScopedTask {}

impl Wake for ScopedTask {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // Only an idle task gets rescheduled; scheduled and completed
        // tasks ignore further wakes
        if self
            .state
            .compare_exchange(TASK_IDLE, TASK_SCHEDULED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.injector.push(self.clone());
            self.unparker.unpark();
        }
    }
}

/// Polls spawned futures on the environment's thread, each poll inside a
/// callback scope.
pub struct ScopedExecutor {
    env: &'static Environment,
    injector: Arc<Injector<Arc<ScopedTask>>>,
    parker: Parker,
    unparker: Unparker,
    live: usize,
}

impl ScopedExecutor {
    pub fn new(env: &'static Environment) -> Self {
        let parker = Parker::new();
        let unparker = parker.unparker();
        Self {
            env,
            injector: Arc::new(Injector::new()),
            parker,
            unparker,
            live: 0,
        }
    }

    /// Register an async operation for `future` and queue its first poll.
    ///
    /// `resource` must be an object (it describes the operation to
    /// diagnostic hooks); `name` labels the operation.
    pub fn spawn<F>(&mut self, name: &str, resource: QuillValue, future: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let context = self.env.async_init(resource, name)?;
        let task = Arc::new(ScopedTask {
            context: Mutex::new(Some(context)),
            future: Mutex::new(Box::pin(future)),
            state: AtomicU8::new(TASK_SCHEDULED),
            injector: self.injector.clone(),
            unparker: self.unparker.clone(),
        });
        self.injector.push(task);
        self.live += 1;
        Ok(())
    }

    /// Number of tasks spawned and not yet completed.
    pub fn live_tasks(&self) -> usize {
        self.live
    }

    /// Run until every spawned task has completed.
    pub fn run(&mut self) {
        while self.live > 0 {
            match self.next_task() {
                Some(task) => {
                    if task.state.load(Ordering::Acquire) == TASK_COMPLETED {
                        continue;
                    }
                    self.poll_task(&task);
                }
                None => {
                    // Nothing runnable; park until a waker fires.
                    // Timeout keeps shutdown races from wedging the loop.
                    self.parker.park_timeout(Duration::from_millis(1));
                }
            }
        }
    }

    /// Poll at most one scheduled task. Returns false when the queue was
    /// empty.
    pub fn try_tick(&mut self) -> bool {
        match self.next_task() {
            Some(task) => {
                if task.state.load(Ordering::Acquire) != TASK_COMPLETED {
                    self.poll_task(&task);
                }
                true
            }
            None => false,
        }
    }

    fn next_task(&self) -> Option<Arc<ScopedTask>> {
        loop {
            match self.injector.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    fn poll_task(&mut self, task: &Arc<ScopedTask>) {
        let mut ctx_slot = task.context.lock().unwrap();
        let Some(ctx) = ctx_slot.as_ref() else {
            // Completed task that was still queued
            return;
        };

        let guard = match ScopeGuard::enter(self.env, ctx) {
            Ok(guard) => guard,
            Err(err) => {
                // The resource was validated at spawn; this only fires if
                // the environment itself went away
                log::error!("skipping poll for {:?}: {}", ctx, err);
                return;
            }
        };

        // Mark idle before polling so a wake arriving mid-poll can
        // reschedule the task
        task.state.store(TASK_IDLE, Ordering::Release);
        let waker = Waker::from(task.clone());
        let mut cx = Context::from_waker(&waker);
        let poll = {
            let mut future = task.future.lock().unwrap();
            future.as_mut().poll(&mut cx)
        };
        drop(guard);

        if let Poll::Ready(()) = poll {
            task.state.store(TASK_COMPLETED, Ordering::Release);
            if let Some(finished) = ctx_slot.take() {
                drop(ctx_slot);
                self.env.async_destroy(finished);
            }
            self.live -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::HookEvent;
    use crate::heap::heap;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::thread;

    fn object() -> QuillValue {
        QuillValue::pointer(heap().alloc_object().expect("allocation failed"))
    }

    /// One-shot future completed by another thread.
    struct FlagFuture {
        inner: Arc<Mutex<FlagState>>,
    }

    #[derive(Default)]
    struct FlagState {
        ready: bool,
        waker: Option<Waker>,
    }

    impl Future for FlagFuture {
        type Output = ();

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            let mut state = self.inner.lock().unwrap();
            if state.ready {
                Poll::Ready(())
            } else {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    #[test]
    fn test_immediate_future_runs_and_destroys_context() {
        let env = Environment::init();
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        env.add_hook(move |event| sink.borrow_mut().push(*event));

        let mut executor = ScopedExecutor::new(env);
        executor.spawn("immediate", object(), async {}).unwrap();
        assert_eq!(executor.live_tasks(), 1);
        executor.run();
        assert_eq!(executor.live_tasks(), 0);
        assert_eq!(env.stack_depth(), 0);

        let events = events.borrow();
        assert!(matches!(events[0], HookEvent::Init { .. }));
        assert!(matches!(events[1], HookEvent::Before { .. }));
        assert!(matches!(events[2], HookEvent::After { .. }));
        assert!(matches!(events[3], HookEvent::Destroy { .. }));
    }

    #[test]
    fn test_cross_thread_wake_polls_inside_scope() {
        let env = Environment::init();
        let opened_before = env.scopes_opened();

        let inner = Arc::new(Mutex::new(FlagState::default()));
        let remote = inner.clone();
        let mut executor = ScopedExecutor::new(env);
        executor
            .spawn("flag", object(), FlagFuture { inner })
            .unwrap();

        // First poll is guaranteed to see the flag unset and park a waker
        assert!(executor.try_tick());
        assert_eq!(executor.live_tasks(), 1);

        let completer = thread::spawn(move || {
            let mut state = remote.lock().unwrap();
            state.ready = true;
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        });

        executor.run();
        completer.join().unwrap();
        assert_eq!(executor.live_tasks(), 0);

        // Two polls (initial pending + wake), each bracketed by a scope
        let opened = env.scopes_opened() - opened_before;
        assert!(opened >= 2, "expected at least two bracketed polls, got {}", opened);
        assert_eq!(env.scopes_opened(), env.scopes_closed());
        assert_eq!(env.stack_depth(), 0);
    }

    #[test]
    fn test_spawn_rejects_primitive_resource() {
        let env = Environment::init();
        let mut executor = ScopedExecutor::new(env);
        let err = executor
            .spawn("bad", QuillValue::number(1.0), async {})
            .unwrap_err();
        assert_eq!(err.status(), crate::error::Status::ObjectExpected);
        assert_eq!(executor.live_tasks(), 0);
    }
}
