//! Cooperative task execution on the worker event loop.
//!
//! Route invocations run as tasks spawned onto the worker's single-threaded
//! runtime; they interleave only at `.await` points. [`ContextScope`] gives
//! downstream routing code access to the current request context without
//! threading it through every call: the slot is installed around every poll
//! of the wrapped future, so it is correct across interleaved tasks.

use std::{
    cell::{Cell, RefCell},
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use crate::context::SharedRequestContext;

thread_local! {
    static CURRENT_CTX: RefCell<Option<Rc<SharedRequestContext>>> = const { RefCell::new(None) };
}

/// The request context of the route task currently being polled, if any.
pub fn current_request_context() -> Option<Rc<SharedRequestContext>> {
    CURRENT_CTX.with(|slot| slot.borrow().clone())
}

struct ScopeGuard {
    prev: Option<Rc<SharedRequestContext>>,
}

impl ScopeGuard {
    fn enter(ctx: Rc<SharedRequestContext>) -> Self {
        let prev = CURRENT_CTX.with(|slot| slot.borrow_mut().replace(ctx));
        ScopeGuard { prev }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_CTX.with(|slot| *slot.borrow_mut() = prev);
    }
}

/// Future wrapper installing `ctx` as the current request context for every
/// poll of `fut`, restoring the previous value on the way out.
pub struct ContextScope<F> {
    ctx: Rc<SharedRequestContext>,
    fut: F,
}

pub fn with_request_context<F: Future>(
    ctx: Rc<SharedRequestContext>,
    fut: F,
) -> ContextScope<F> {
    ContextScope { ctx, fut }
}

impl<F: Future> Future for ContextScope<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `fut` is structurally pinned; it is never moved out of
        // `self` and `ctx` is plain data.
        let this = unsafe { self.get_unchecked_mut() };
        let _scope = ScopeGuard::enter(this.ctx.clone());
        unsafe { Pin::new_unchecked(&mut this.fut) }.poll(cx)
    }
}

/// Spawns route tasks onto the worker runtime and tracks how many are still
/// live, which drives the drain-boundary busyness report and flush policy.
pub struct FiberScheduler {
    live: Rc<Cell<usize>>,
}

struct LiveGuard(Rc<Cell<usize>>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

impl FiberScheduler {
    pub fn new() -> Self {
        FiberScheduler {
            live: Rc::new(Cell::new(0)),
        }
    }

    /// Number of spawned tasks that have not finished yet.
    pub fn pending_tasks(&self) -> usize {
        self.live.get()
    }

    pub fn add_task(&self, fut: impl Future<Output = ()> + 'static) {
        self.live.set(self.live.get() + 1);
        let guard = LiveGuard(self.live.clone());
        monoio::spawn(async move {
            let _guard = guard;
            fut.await;
        });
    }

    /// Run `body` as a task, then hand its output to `finally` once the body
    /// has fully completed.
    pub fn add_task_finally<T: 'static>(
        &self,
        body: impl Future<Output = T> + 'static,
        finally: impl FnOnce(T) + 'static,
    ) {
        self.add_task(async move {
            let out = body.await;
            finally(out);
        });
    }
}

impl Default for FiberScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-queue the current task behind everything already runnable.
pub(crate) async fn yield_now() {
    struct YieldNow(bool);
    impl Future for YieldNow {
        type Output = ();
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                Poll::Ready(())
            } else {
                self.0 = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
    YieldNow(false).await
}
