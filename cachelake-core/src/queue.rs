//! Bounded cross-thread message queue feeding one worker's event loop.
//!
//! Multi-producer, single-consumer. Producers block while the queue is full;
//! the consumer is an async drain loop on the worker runtime, woken through
//! an [`AtomicWaker`]. Wake-ups are suppressed adaptively: the queue keeps a
//! notify period between 1 and `client_queue_no_notify_rate` and emits at
//! most one wake-up per period writes, falling back to eager wake-ups
//! whenever the consumer's drain lag exceeds the configured threshold.
//!
//! Structural misuse (writing into a drained queue) is a programming error
//! and panics; there are no recoverable error states.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    task::Poll,
};

use futures_util::task::AtomicWaker;

use crate::time::Clock;

/// Outcome of one producer-side wake-up decision, reported to the stats
/// callback installed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    Delivered,
    Suppressed,
}

pub type NotifyCallback = Arc<dyn Fn(NotifyEvent) + Send + Sync>;

struct State<T> {
    items: VecDeque<T>,
    writes_since_notify: usize,
    closed: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    not_full: Condvar,
    consumer: AtomicWaker,
    capacity: usize,
    /// Upper bound for the adaptive notify period; 0 or 1 disables
    /// suppression.
    base_period: usize,
    wait_threshold_us: u64,
    notify_period: AtomicUsize,
    last_drain_us: AtomicU64,
    clock: Clock,
    on_notify: Option<NotifyCallback>,
}

pub struct MessageQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        MessageQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send> MessageQueue<T> {
    pub fn new(
        capacity: usize,
        no_notify_rate: usize,
        wait_threshold_us: u64,
        clock: Clock,
        on_notify: Option<NotifyCallback>,
    ) -> Self {
        let now = clock.now_us();
        MessageQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity.max(1)),
                    writes_since_notify: 0,
                    closed: false,
                }),
                not_full: Condvar::new(),
                consumer: AtomicWaker::new(),
                capacity: capacity.max(1),
                base_period: no_notify_rate,
                wait_threshold_us,
                notify_period: AtomicUsize::new(1),
                last_drain_us: AtomicU64::new(now),
                clock,
                on_notify,
            }),
        }
    }

    /// Producer side. Blocks while the queue is full; returns once the
    /// message is enqueued. Panics if the queue has been torn down.
    pub fn blocking_write(&self, msg: T) {
        let inner = &*self.inner;
        let mut state = inner.state.lock().unwrap();
        while state.items.len() >= inner.capacity && !state.closed {
            state = inner.not_full.wait(state).unwrap();
        }
        if state.closed {
            panic!("blocking_write on a drained message queue");
        }
        state.items.push_back(msg);
        let deliver = self.should_notify(&mut state);
        drop(state);

        if deliver {
            inner.consumer.wake();
        }
        if let Some(cb) = &inner.on_notify {
            cb(if deliver {
                NotifyEvent::Delivered
            } else {
                NotifyEvent::Suppressed
            });
        }
    }

    fn should_notify(&self, state: &mut State<T>) -> bool {
        let inner = &*self.inner;
        state.writes_since_notify += 1;
        let period = inner.notify_period.load(Ordering::Relaxed).max(1);
        if period <= 1 || state.writes_since_notify >= period {
            state.writes_since_notify = 0;
            return true;
        }
        if inner.wait_threshold_us > 0 {
            let lag = inner
                .clock
                .now_us()
                .saturating_sub(inner.last_drain_us.load(Ordering::Relaxed));
            if lag > inner.wait_threshold_us {
                // The consumer is behind; back off suppression so it keeps
                // getting woken promptly.
                inner
                    .notify_period
                    .store((period / 2).max(1), Ordering::Relaxed);
                state.writes_since_notify = 0;
                return true;
            }
        }
        false
    }

    /// Consumer side: resolves `true` once at least one item is buffered,
    /// `false` once the queue is closed and empty.
    pub(crate) async fn wait_nonempty(&self) -> bool {
        std::future::poll_fn(|cx| {
            {
                let state = self.inner.state.lock().unwrap();
                if !state.items.is_empty() {
                    return Poll::Ready(true);
                }
                if state.closed {
                    return Poll::Ready(false);
                }
            }
            self.inner.consumer.register(cx.waker());
            // Re-check after registration; a producer may have raced the gap.
            let state = self.inner.state.lock().unwrap();
            if !state.items.is_empty() {
                Poll::Ready(true)
            } else if state.closed {
                Poll::Ready(false)
            } else {
                Poll::Pending
            }
        })
        .await
    }

    /// Consumer side: move everything currently buffered into `buf`, retune
    /// the notify period from the observed batch size and release blocked
    /// producers.
    pub(crate) fn drain_into(&self, buf: &mut VecDeque<T>) {
        let inner = &*self.inner;
        let drained;
        {
            let mut state = inner.state.lock().unwrap();
            drained = state.items.len();
            if drained > 0 {
                buf.extend(state.items.drain(..));
            }
        }
        inner
            .last_drain_us
            .store(inner.clock.now_us(), Ordering::Relaxed);
        // Growth requires a drain of 2x the current period, so the period
        // never exceeds the queue capacity and a full queue always ends a
        // suppression window.
        if inner.base_period > 1 {
            let period = inner.notify_period.load(Ordering::Relaxed).max(1);
            if drained >= period * 2 && period < inner.base_period {
                inner
                    .notify_period
                    .store((period * 2).min(inner.base_period), Ordering::Relaxed);
            } else if drained < period / 2 {
                inner
                    .notify_period
                    .store((period / 2).max(1), Ordering::Relaxed);
            }
        }
        inner.not_full.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().unwrap().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().items.len()
    }

    /// Current wake-up suppression period (1 = every write notifies).
    pub fn current_notify_period(&self) -> usize {
        self.inner.notify_period.load(Ordering::Relaxed).max(1)
    }

    /// Teardown: close the queue and discard whatever is still buffered.
    /// Blocked producers are released into the `blocking_write` panic; the
    /// queue must only be drained once no producer can legitimately write.
    pub(crate) fn drain(&self) {
        let inner = &*self.inner;
        let discarded = {
            let mut state = inner.state.lock().unwrap();
            state.closed = true;
            std::mem::take(&mut state.items)
        };
        if !discarded.is_empty() {
            tracing::debug!(count = discarded.len(), "discarding undelivered messages");
        }
        drop(discarded);
        inner.not_full.notify_all();
        inner.consumer.wake();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        time::{Duration, Instant},
    };

    use super::*;

    fn collector() -> (NotifyCallback, Arc<Mutex<Vec<NotifyEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let cb: NotifyCallback = Arc::new(move |e| sink.lock().unwrap().push(e));
        (cb, events)
    }

    #[test]
    fn producer_blocks_until_consumer_drains() {
        let queue = MessageQueue::new(2, 0, 0, Clock::system(), None);
        queue.blocking_write(1u32);
        queue.blocking_write(2);

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                queue.blocking_write(3);
                started.elapsed()
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 2, "third write must be blocked on capacity");

        let mut buf = VecDeque::new();
        queue.drain_into(&mut buf);
        assert_eq!(buf, VecDeque::from(vec![1, 2]));

        let blocked_for = producer.join().unwrap();
        assert!(blocked_for >= Duration::from_millis(40));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn wait_nonempty_sees_cross_thread_writes() {
        let queue = MessageQueue::new(8, 0, 0, Clock::system(), None);
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.blocking_write("hello");
            })
        };
        assert!(futures_executor::block_on(queue.wait_nonempty()));
        producer.join().unwrap();
        let mut buf = VecDeque::new();
        queue.drain_into(&mut buf);
        assert_eq!(buf.pop_front(), Some("hello"));
    }

    #[test]
    fn notify_period_grows_with_batch_size_and_suppresses() {
        let (cb, events) = collector();
        let queue = MessageQueue::new(64, 8, 0, Clock::system(), Some(cb));
        let mut buf = VecDeque::new();

        // Two full drains of growing batches push the period to 4.
        for i in 0..4 {
            queue.blocking_write(i);
        }
        queue.drain_into(&mut buf);
        for i in 0..4 {
            queue.blocking_write(i);
        }
        queue.drain_into(&mut buf);
        assert_eq!(queue.current_notify_period(), 4);

        events.lock().unwrap().clear();
        for i in 0..4 {
            queue.blocking_write(i);
        }
        let seen = events.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                NotifyEvent::Suppressed,
                NotifyEvent::Suppressed,
                NotifyEvent::Suppressed,
                NotifyEvent::Delivered,
            ]
        );
    }

    #[test]
    fn consumer_lag_forces_notification() {
        let (clock, hand) = Clock::manual();
        let (cb, events) = collector();
        let queue = MessageQueue::new(64, 8, 1_000, clock, Some(cb));
        let mut buf = VecDeque::new();

        for i in 0..4 {
            queue.blocking_write(i);
        }
        queue.drain_into(&mut buf);
        for i in 0..4 {
            queue.blocking_write(i);
        }
        queue.drain_into(&mut buf);
        assert_eq!(queue.current_notify_period(), 4);

        // One write against a lagging consumer is delivered immediately and
        // the suppression period backs off.
        hand.advance(Duration::from_millis(5));
        events.lock().unwrap().clear();
        queue.blocking_write(99);
        assert_eq!(
            events.lock().unwrap().as_slice(),
            &[NotifyEvent::Delivered]
        );
        assert_eq!(queue.current_notify_period(), 2);
    }

    #[test]
    fn drain_discards_and_later_writes_panic() {
        let queue = MessageQueue::new(8, 0, 0, Clock::system(), None);
        queue.blocking_write(1u8);
        queue.blocking_write(2);
        queue.drain();
        assert!(queue.is_empty());
        assert!(!futures_executor::block_on(queue.wait_nonempty()));

        let queue2 = queue.clone();
        let result = std::thread::spawn(move || queue2.blocking_write(3)).join();
        assert!(result.is_err(), "write after teardown must panic");
    }
}
