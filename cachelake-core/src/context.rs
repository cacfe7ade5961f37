//! Per-request state carried through the worker.
//!
//! A [`RequestContext`] is created by the front-end acceptor and travels
//! through the cross-thread message queue; once the worker starts processing
//! it, [`SharedRequestContext`] binds it to the worker and to the routing
//! config snapshot captured at admission. Every context delivers exactly one
//! reply through its one-shot sink, on every path including rejection.

use std::{cell::Cell, rc::Rc, sync::Arc};

use futures_channel::oneshot;

use crate::{
    proxy::Proxy,
    request::{Reply, Request, RequestPriority},
    route::ProxyConfig,
};

pub type PreprocessHook = Box<dyn FnOnce(&Request) + Send>;

/// A request plus its reply sink, before the worker has adopted it.
pub struct RequestContext {
    request: Request,
    priority: RequestPriority,
    reply: Option<oneshot::Sender<Reply>>,
    preprocess: Option<PreprocessHook>,
    processing: bool,
}

impl RequestContext {
    /// Returns the context together with the receiving half of its reply
    /// sink; the caller (normally the transport) awaits the receiver.
    pub fn new(request: Request) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (
            RequestContext {
                request,
                priority: RequestPriority::default(),
                reply: Some(tx),
                preprocess: None,
                processing: false,
            },
            rx,
        )
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Hook run on the worker thread right before routing starts.
    pub fn with_preprocess(mut self, hook: PreprocessHook) -> Self {
        self.preprocess = Some(hook);
        self
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn priority(&self) -> RequestPriority {
        self.priority
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub(crate) fn mark_processing(&mut self) {
        self.processing = true;
    }

    pub(crate) fn run_preprocess(&mut self) {
        if let Some(hook) = self.preprocess.take() {
            hook(&self.request);
        }
    }

    /// Deliver the reply. The sink is one-shot; a second call is a bug in
    /// the dispatch pipeline.
    pub fn send_reply(&mut self, reply: Reply) {
        match self.reply.take() {
            // The receiver may be gone (client hung up); that is not an
            // error of the pipeline.
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => {
                debug_assert!(false, "reply sink used twice");
                tracing::error!("dropping duplicate reply for {} request", self.request.kind());
            }
        }
    }
}

/// A request context adopted by a worker: bound to the worker, holding the
/// config snapshot captured at admission, shared between the route task body
/// and its reply callback.
pub struct SharedRequestContext {
    proxy: Rc<Proxy>,
    config: Arc<ProxyConfig>,
    request: Request,
    priority: RequestPriority,
    reply: Cell<Option<oneshot::Sender<Reply>>>,
}

impl SharedRequestContext {
    /// Adoption point: consumes the unique context and binds the current
    /// config snapshot. The context must already be marked processing.
    pub(crate) fn process(
        proxy: Rc<Proxy>,
        ctx: RequestContext,
        config: Arc<ProxyConfig>,
    ) -> Rc<Self> {
        debug_assert!(ctx.processing);
        Rc::new(SharedRequestContext {
            proxy,
            config,
            request: ctx.request,
            priority: ctx.priority,
            reply: Cell::new(ctx.reply),
        })
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn priority(&self) -> RequestPriority {
        self.priority
    }

    /// The config snapshot this request was admitted under. Stable for the
    /// whole lifetime of the request, across config hot swaps.
    pub fn config(&self) -> &Arc<ProxyConfig> {
        &self.config
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn send_reply(&self, reply: Reply) {
        match self.reply.take() {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => {
                debug_assert!(false, "reply sink used twice");
                tracing::error!("dropping duplicate reply for {} request", self.request.kind());
            }
        }
    }
}

impl Drop for SharedRequestContext {
    fn drop(&mut self) {
        // Adopted contexts are what "in flight" counts; releasing the last
        // reference frees one admission slot and pumps the waiting queues.
        self.proxy.on_request_finished();
    }
}
