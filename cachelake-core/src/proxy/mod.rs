//! The worker: one event-loop-owning unit handling a share of requests.
//!
//! A [`Proxy`] composes the cross-thread [`MessageQueue`], the admission
//! controller with its per-priority waiting queues, the [`FiberScheduler`]
//! running route invocations, the flush coordinator and the config holder.
//! Everything behind the queue runs on the worker's own thread; the
//! [`ProxyHandle`] is the cross-thread face used by acceptors and the
//! reconfiguration path.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::{Rc, Weak},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLockReadGuard,
    },
    time::Duration,
};

use crate::{
    config::ProxyOptions,
    context::{RequestContext, SharedRequestContext},
    destination::DestinationMap,
    fiber::{with_request_context, yield_now, FiberScheduler},
    flush::{FlushCoordinator, FlushList},
    queue::MessageQueue,
    request::{Reply, RequestKind, RequestPriority, PRIORITY_COUNT},
    route::{ConfigHolder, ProxyConfig},
    service_info::{INTERNAL_KEY_PREFIX, PACKAGE_STRING},
    stats::{stats_reply, SafeStats, Stats},
    time::Clock,
};

/// Message delivered to a worker through its queue. Payload lifetime
/// transfers with the message.
pub enum ProxyMessage {
    /// A new request whose context the worker adopts.
    Request(RequestContext),
    /// A displaced config snapshot coming home to die on its worker thread.
    OldConfig(Arc<ProxyConfig>),
    /// Wake-only; lets the event loop observe the shutdown flag.
    Shutdown,
}

/// State of one worker reachable from other threads.
pub(crate) struct ProxyShared {
    pub(crate) id: usize,
    pub(crate) queue: MessageQueue<ProxyMessage>,
    pub(crate) config: ConfigHolder,
    pub(crate) safe_stats: Arc<SafeStats>,
    pub(crate) shutdown: AtomicBool,
}

impl ProxyShared {
    pub(crate) fn new(
        id: usize,
        options: &ProxyOptions,
        clock: Clock,
        initial_config: Arc<ProxyConfig>,
    ) -> Arc<Self> {
        let safe_stats = Arc::new(SafeStats::default());
        let notify_stats = safe_stats.clone();
        let queue = MessageQueue::new(
            options.client_queue_size,
            options.client_queue_no_notify_rate,
            options.client_queue_wait_threshold_us,
            clock,
            Some(Arc::new(move |event| notify_stats.record_notify(event))),
        );
        Arc::new(ProxyShared {
            id,
            queue,
            config: ConfigHolder::new(initial_config),
            safe_stats,
            shutdown: AtomicBool::new(false),
        })
    }
}

/// Cross-thread handle to one worker: message submission and config access.
#[derive(Clone)]
pub struct ProxyHandle {
    shared: Arc<ProxyShared>,
}

impl ProxyHandle {
    pub(crate) fn new(shared: Arc<ProxyShared>) -> Self {
        ProxyHandle { shared }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Enqueue one message; blocks while the worker's queue is full.
    pub fn send_message(&self, msg: ProxyMessage) {
        self.shared.queue.blocking_write(msg);
    }

    /// Hand a request over to the worker. The context's lifetime transfers;
    /// the reply arrives through the context's sink.
    pub fn send_request(&self, ctx: RequestContext) {
        self.send_message(ProxyMessage::Request(ctx));
    }

    /// Refcounted snapshot of the worker's active config.
    pub fn get_config_unsafe(&self) -> Arc<ProxyConfig> {
        self.shared.config.snapshot()
    }

    /// Read-locked view, for several operations against one snapshot.
    pub fn get_config_locked(&self) -> RwLockReadGuard<'_, Arc<ProxyConfig>> {
        self.shared.config.locked()
    }

    /// Raw pointer swap; the caller owns the displaced config.
    pub fn swap_config(&self, new: Arc<ProxyConfig>) -> Arc<ProxyConfig> {
        self.shared.config.swap(new)
    }

    /// Full hot-swap path: replace the config, stamp the success time and
    /// send the displaced snapshot back to the worker thread so its
    /// destruction (route graph and destination teardown) never runs on the
    /// reconfiguration thread.
    pub fn replace_config(&self, new: Arc<ProxyConfig>) {
        let old = self.swap_config(new);
        self.shared.safe_stats.stamp_config_success();
        self.send_message(ProxyMessage::OldConfig(old));
    }

    pub fn current_notify_period(&self) -> usize {
        self.shared.queue.current_notify_period()
    }

    pub fn safe_stats(&self) -> &SafeStats {
        &self.shared.safe_stats
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }
}

/// An admission-deferred request parked in a waiting queue.
struct WaitingItem {
    ctx: RequestContext,
    /// Set iff the waiting timeout was enabled at enqueue time.
    time_pushed_us: Option<u64>,
}

impl WaitingItem {
    /// Pop-side processing: an expired item replies BUSY and never reaches
    /// the route handle or the inflight counter.
    fn process(mut self, proxy: &Proxy) {
        if let Some(pushed) = self.time_pushed_us {
            let waited_us = proxy.clock.now_us().saturating_sub(pushed);
            if waited_us > proxy.options.waiting_request_timeout_ms * 1000 {
                proxy.stats.bump_waiting_expired();
                proxy.stats.bump_busy();
                self.ctx.send_reply(Reply::busy());
                return;
            }
        }
        proxy.process_request(self.ctx);
    }
}

/// One worker. Exclusively owned by its event-loop thread; only
/// [`ProxyHandle`] crosses threads.
pub struct Proxy {
    /// Back-reference for handing `Rc<Proxy>` to adopted contexts; always
    /// upgradable while the worker runs.
    weak_self: Weak<Proxy>,
    shared: Arc<ProxyShared>,
    options: Arc<ProxyOptions>,
    clock: Clock,
    stats: Stats,
    waiting: [RefCell<VecDeque<WaitingItem>>; PRIORITY_COUNT],
    num_processing: Cell<usize>,
    num_waiting: Cell<usize>,
    fibers: FiberScheduler,
    flush: FlushCoordinator,
    destinations: Rc<DestinationMap>,
    being_destroyed: Cell<bool>,
}

impl Proxy {
    /// Build the worker on its event-loop thread. The caller drives
    /// [`Proxy::run`] on the same runtime.
    pub(crate) fn new(
        shared: Arc<ProxyShared>,
        options: Arc<ProxyOptions>,
        clock: Clock,
    ) -> Rc<Self> {
        let stats = Stats::new(shared.safe_stats.clone());
        Rc::new_cyclic(|weak_self| Proxy {
            weak_self: weak_self.clone(),
            shared,
            options,
            clock: clock.clone(),
            stats,
            waiting: std::array::from_fn(|_| RefCell::new(VecDeque::new())),
            num_processing: Cell::new(0),
            num_waiting: Cell::new(0),
            fibers: FiberScheduler::new(),
            flush: FlushCoordinator::new(),
            destinations: DestinationMap::new(clock),
            being_destroyed: Cell::new(false),
        })
    }

    fn self_rc(&self) -> Rc<Proxy> {
        self.weak_self.upgrade().expect("worker already destroyed")
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Pending transport-write callbacks, flushed at drain boundaries.
    pub fn flush_list(&self) -> &FlushList {
        self.flush.list()
    }

    pub fn destinations(&self) -> &DestinationMap {
        &self.destinations
    }

    pub fn current_notify_period(&self) -> usize {
        self.shared.queue.current_notify_period()
    }

    pub fn get_config_unsafe(&self) -> Arc<ProxyConfig> {
        self.shared.config.snapshot()
    }

    pub fn get_config_locked(&self) -> RwLockReadGuard<'_, Arc<ProxyConfig>> {
        self.shared.config.locked()
    }

    pub fn num_requests_processing(&self) -> usize {
        self.num_processing.get()
    }

    pub fn num_requests_waiting(&self) -> usize {
        self.num_waiting.get()
    }

    /// Worker event loop: drain the message queue, interleave fibers, apply
    /// the flush policy at drain boundaries, and tear the worker down on its
    /// own thread once shutdown is observed.
    pub(crate) async fn run(self: Rc<Self>) {
        if self.options.reset_inactive_connection_interval > 0 {
            self.destinations.clone().set_reset_timer(Duration::from_millis(
                self.options.reset_inactive_connection_interval,
            ));
        }

        let queue = self.shared.queue.clone();
        let mut batch = VecDeque::new();
        'serve: loop {
            if !queue.wait_nonempty().await {
                break;
            }
            loop {
                queue.drain_into(&mut batch);
                for msg in batch.drain(..) {
                    self.message_ready(msg);
                }
                let last = queue.is_empty();
                let _busy = self.drain_boundary(last);
                if self.shared.shutdown.load(Ordering::Acquire) {
                    break 'serve;
                }
                if last {
                    break;
                }
                // More messages arrived while this batch was being handled;
                // give the fibers a turn before draining again.
                yield_now().await;
            }
        }

        tracing::debug!(worker = self.shared.id, "worker shutting down");
        self.being_destroyed.set(true);
        self.destinations.reset();
        queue.drain();
    }

    fn message_ready(&self, msg: ProxyMessage) {
        match msg {
            ProxyMessage::Request(ctx) => self.dispatch_request(ctx),
            ProxyMessage::OldConfig(config) => {
                // Displaced snapshot released on the worker thread; the
                // teardown of the route graph happens here, or wherever the
                // last in-flight holder finishes.
                drop(config);
            }
            ProxyMessage::Shutdown => {
                // Wake-only; the run loop re-checks the shutdown flag.
            }
        }
    }

    /// Drain-boundary hook. With messages still buffered (`last = false`)
    /// it reports whether the worker has further in-process work; on a
    /// final boundary it lets the flush policy run.
    fn drain_boundary(&self, last: bool) -> bool {
        let have_tasks = self.fibers.pending_tasks() != 0;
        if !last {
            return have_tasks || !self.flush.list().is_empty();
        }
        self.flush
            .maybe_flush(have_tasks, self.options.max_no_flush_event_loops);
        false
    }

    /// Admission: execute now, park in a waiting queue, or shed with BUSY.
    pub(crate) fn dispatch_request(&self, mut ctx: RequestContext) {
        if self.rate_limited(ctx.priority(), ctx.request().kind()) {
            let options = &self.options;
            if options.proxy_max_throttled_requests > 0
                && self.num_waiting.get() >= options.proxy_max_throttled_requests
            {
                self.stats.bump_busy();
                ctx.send_reply(Reply::busy());
                return;
            }
            // The waiting deadline only applies when the full throttling
            // stack (inflight cap, waiting cap, timeout) is enabled.
            let time_pushed_us = (options.proxy_max_inflight_requests > 0
                && options.proxy_max_throttled_requests > 0
                && options.waiting_request_timeout_ms > 0)
                .then(|| self.clock.now_us());
            let priority = ctx.priority();
            self.waiting[priority as usize]
                .borrow_mut()
                .push_back(WaitingItem {
                    ctx,
                    time_pushed_us,
                });
            self.num_waiting.set(self.num_waiting.get() + 1);
            self.stats.inc_waiting();
        } else {
            self.process_request(ctx);
        }
    }

    fn rate_limited(&self, priority: RequestPriority, kind: RequestKind) -> bool {
        if kind.is_rate_limit_exempt() {
            return false;
        }
        let max = self.options.proxy_max_inflight_requests;
        if max == 0 {
            return false;
        }
        if self.waiting[priority as usize].borrow().is_empty() && self.num_processing.get() < max
        {
            return false;
        }
        true
    }

    pub(crate) fn process_request(&self, mut ctx: RequestContext) {
        assert!(!ctx.is_processing());
        ctx.mark_processing();
        self.num_processing.set(self.num_processing.get() + 1);
        self.stats.inc_processing();

        ctx.run_preprocess();
        self.route_handles_process_request(ctx);

        self.stats.bump_request_sent();
    }

    /// Per-kind dispatch: diagnostic kinds are answered by the worker
    /// itself, internal-namespace gets go to service info, everything else
    /// is adopted and routed.
    fn route_handles_process_request(&self, mut ctx: RequestContext) {
        match ctx.request().kind() {
            RequestKind::Stats => {
                let group = ctx.request().key_str().into_owned();
                let reply = match stats_reply(self, &group) {
                    Ok(reply) => reply,
                    Err(e) => {
                        Reply::local_error(format!("Error processing stats request: {e}"))
                    }
                };
                ctx.send_reply(reply);
                self.on_request_finished();
            }
            RequestKind::Version => {
                ctx.send_reply(Reply::ok_with_value(PACKAGE_STRING));
                self.on_request_finished();
            }
            RequestKind::Get if ctx.request().key_str().starts_with(INTERNAL_KEY_PREFIX) => {
                let shared_ctx =
                    SharedRequestContext::process(self.self_rc(), ctx, self.get_config_unsafe());
                let key = shared_ctx.request().key_str().into_owned();
                let suffix = &key[INTERNAL_KEY_PREFIX.len()..];
                let config = shared_ctx.config().clone();
                config.service_info().handle_request(suffix, &shared_ctx);
            }
            _ => {
                let shared_ctx =
                    SharedRequestContext::process(self.self_rc(), ctx, self.get_config_unsafe());
                self.add_route_task(shared_ctx);
            }
        }
    }

    fn add_route_task(&self, shared_ctx: Rc<SharedRequestContext>) {
        let kind = shared_ctx.request().kind();
        if !shared_ctx.config().routable().contains(kind) {
            shared_ctx.send_reply(Reply::local_error(format!(
                "couldn't route request of kind {kind}: not supported by the route handle tree"
            )));
            return;
        }
        self.stats.bump_incoming(kind);

        let task_ctx = shared_ctx.clone();
        self.fibers.add_task_finally(
            async move {
                let config = task_ctx.config().clone();
                let route_fut = config.route_handle().route(task_ctx.request());
                match with_request_context(task_ctx.clone(), route_fut).await {
                    Ok(reply) => reply,
                    Err(e) => Reply::local_error(format!(
                        "Error routing request of kind {kind}: {e}"
                    )),
                }
            },
            move |reply| shared_ctx.send_reply(reply),
        );
    }

    /// Move waiting requests into flight while capacity lasts, highest
    /// priority band first. Lower bands starve under sustained load; that
    /// is the intended trade.
    pub(crate) fn pump(&self) {
        let max = self.options.proxy_max_inflight_requests;
        for queue in &self.waiting {
            while self.num_processing.get() < max {
                let Some(item) = queue.borrow_mut().pop_front() else {
                    break;
                };
                self.num_waiting.set(self.num_waiting.get() - 1);
                self.stats.dec_waiting();
                item.process(self);
            }
        }
    }

    /// One in-flight request released its admission slot.
    pub(crate) fn on_request_finished(&self) {
        self.num_processing.set(self.num_processing.get() - 1);
        self.stats.dec_processing();
        if !self.being_destroyed.get() {
            self.pump();
        }
    }
}
