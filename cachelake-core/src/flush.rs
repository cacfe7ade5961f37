//! Batched transport-write flushing.
//!
//! Backends and transports park their pending send callbacks on the worker's
//! [`FlushList`] instead of writing per reply. The list is flushed at message
//! queue drain boundaries: immediately when the worker has nothing runnable,
//! otherwise after at most `max_no_flush_event_loops` deferred turns. This
//! amortizes socket syscalls while bounding the added latency.

use std::cell::{Cell, RefCell};

pub type FlushCallback = Box<dyn FnOnce()>;

/// Ordered set of pending write callbacks, each run exactly once per flush.
#[derive(Default)]
pub struct FlushList {
    callbacks: RefCell<Vec<FlushCallback>>,
}

impl FlushList {
    pub fn add(&self, cb: impl FnOnce() + 'static) {
        self.callbacks.borrow_mut().push(Box::new(cb));
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.callbacks.borrow().len()
    }

    fn take(&self) -> Vec<FlushCallback> {
        std::mem::take(&mut *self.callbacks.borrow_mut())
    }
}

/// Decides, at each drain boundary, whether the flush list runs now or gets
/// deferred another event-loop turn.
pub(crate) struct FlushCoordinator {
    list: FlushList,
    no_flush_loops: Cell<usize>,
}

impl FlushCoordinator {
    pub(crate) fn new() -> Self {
        FlushCoordinator {
            list: FlushList::default(),
            no_flush_loops: Cell::new(0),
        }
    }

    pub(crate) fn list(&self) -> &FlushList {
        &self.list
    }

    /// Flush policy for a `last = true` drain boundary. Returns whether a
    /// flush was scheduled onto the current event-loop iteration.
    pub(crate) fn maybe_flush(&self, have_tasks: bool, max_no_flush_loops: usize) -> bool {
        if self.list.is_empty() {
            return false;
        }
        let deferred = self.no_flush_loops.get() + 1;
        if !have_tasks || deferred >= max_no_flush_loops {
            self.no_flush_loops.set(0);
            let callbacks = self.list.take();
            monoio::spawn(async move {
                for cb in callbacks {
                    cb();
                }
            });
            true
        } else {
            self.no_flush_loops.set(deferred);
            false
        }
    }
}
