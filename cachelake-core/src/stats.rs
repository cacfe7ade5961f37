//! Worker stats registry.
//!
//! Counters come in two flavors: *fast* counters are `Cell`s touched only on
//! the owning worker thread, *safe* counters are atomics that producers and
//! the reconfiguration path may also touch (queue notification accounting,
//! config success stamp). The registry renders into the reply of a stats
//! request, grouped by the request key.

use std::{
    cell::Cell,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    error::AnyResult,
    proxy::Proxy,
    queue::NotifyEvent,
    request::{Reply, RequestKind, REQUEST_KIND_COUNT},
};

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("unknown stats group: {0}")]
    UnknownGroup(String),
}

/// Counters that may be touched from outside the worker thread.
#[derive(Default)]
pub struct SafeStats {
    client_queue_notifications: AtomicU64,
    client_queue_suppressed_notifications: AtomicU64,
    config_last_success: AtomicI64,
}

impl SafeStats {
    pub(crate) fn record_notify(&self, event: NotifyEvent) {
        match event {
            NotifyEvent::Delivered => &self.client_queue_notifications,
            NotifyEvent::Suppressed => &self.client_queue_suppressed_notifications,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn notifications(&self) -> u64 {
        self.client_queue_notifications.load(Ordering::Relaxed)
    }

    pub fn suppressed_notifications(&self) -> u64 {
        self.client_queue_suppressed_notifications.load(Ordering::Relaxed)
    }

    /// Stamped with wall-clock time on every successful config swap.
    pub(crate) fn stamp_config_success(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.config_last_success.store(now, Ordering::Relaxed);
    }

    pub fn config_last_success(&self) -> i64 {
        self.config_last_success.load(Ordering::Relaxed)
    }
}

/// Worker-local registry; fast counters plus a handle to the safe ones.
pub struct Stats {
    safe: std::sync::Arc<SafeStats>,
    request_sent: Cell<u64>,
    request_sent_count: Cell<u64>,
    proxy_reqs_processing: Cell<u64>,
    proxy_reqs_waiting: Cell<u64>,
    busy_replies: Cell<u64>,
    waiting_expired: Cell<u64>,
    incoming: [Cell<u64>; REQUEST_KIND_COUNT],
}

impl Stats {
    pub(crate) fn new(safe: std::sync::Arc<SafeStats>) -> Self {
        Stats {
            safe,
            request_sent: Cell::new(0),
            request_sent_count: Cell::new(0),
            proxy_reqs_processing: Cell::new(0),
            proxy_reqs_waiting: Cell::new(0),
            busy_replies: Cell::new(0),
            waiting_expired: Cell::new(0),
            incoming: std::array::from_fn(|_| Cell::new(0)),
        }
    }

    pub fn safe(&self) -> &SafeStats {
        &self.safe
    }

    pub(crate) fn bump_request_sent(&self) {
        self.request_sent.set(self.request_sent.get() + 1);
        self.request_sent_count.set(self.request_sent_count.get() + 1);
    }

    pub(crate) fn inc_processing(&self) {
        self.proxy_reqs_processing
            .set(self.proxy_reqs_processing.get() + 1);
    }

    pub(crate) fn dec_processing(&self) {
        self.proxy_reqs_processing
            .set(self.proxy_reqs_processing.get() - 1);
    }

    pub(crate) fn inc_waiting(&self) {
        self.proxy_reqs_waiting
            .set(self.proxy_reqs_waiting.get() + 1);
    }

    pub(crate) fn dec_waiting(&self) {
        self.proxy_reqs_waiting
            .set(self.proxy_reqs_waiting.get() - 1);
    }

    pub(crate) fn bump_busy(&self) {
        self.busy_replies.set(self.busy_replies.get() + 1);
    }

    pub(crate) fn bump_waiting_expired(&self) {
        self.waiting_expired.set(self.waiting_expired.get() + 1);
    }

    pub(crate) fn bump_incoming(&self, kind: RequestKind) {
        let cell = &self.incoming[kind.index()];
        cell.set(cell.get() + 1);
    }

    pub fn processing(&self) -> u64 {
        self.proxy_reqs_processing.get()
    }

    pub fn waiting(&self) -> u64 {
        self.proxy_reqs_waiting.get()
    }

    pub fn incoming(&self, kind: RequestKind) -> u64 {
        self.incoming[kind.index()].get()
    }
}

fn write_stat(out: &mut String, name: &str, value: impl std::fmt::Display) {
    out.push_str(name);
    out.push(' ');
    out.push_str(&value.to_string());
    out.push('\n');
}

fn write_request_stats(out: &mut String, stats: &Stats) {
    write_stat(out, "request_sent", stats.request_sent.get());
    write_stat(out, "request_sent_count", stats.request_sent_count.get());
    write_stat(out, "proxy_reqs_processing", stats.processing());
    write_stat(out, "proxy_reqs_waiting", stats.waiting());
    write_stat(out, "busy_replies", stats.busy_replies.get());
    write_stat(out, "waiting_expired", stats.waiting_expired.get());
    for kind in RequestKind::ALL {
        write_stat(
            out,
            &format!("cmd_{}_in", kind.name()),
            stats.incoming(kind),
        );
    }
}

fn write_queue_stats(out: &mut String, proxy: &Proxy) {
    let safe = proxy.stats().safe();
    write_stat(out, "client_queue_notifications", safe.notifications());
    write_stat(
        out,
        "client_queue_suppressed_notifications",
        safe.suppressed_notifications(),
    );
    write_stat(
        out,
        "client_queue_notify_period",
        proxy.current_notify_period(),
    );
}

fn write_config_stats(out: &mut String, proxy: &Proxy) {
    // Both lines must describe the same snapshot, so hold the read lock
    // across them rather than taking two.
    let config = proxy.get_config_locked();
    write_stat(out, "config_age_seconds", config.age_secs());
    write_stat(
        out,
        "config_last_success",
        proxy.stats().safe().config_last_success(),
    );
}

/// Builds the reply for a stats request. The request key selects the group;
/// empty selects everything. Unknown groups are an error the caller turns
/// into a LOCAL_ERROR reply.
pub(crate) fn stats_reply(proxy: &Proxy, group: &str) -> AnyResult<Reply> {
    let mut out = String::new();
    match group {
        "" | "all" => {
            write_request_stats(&mut out, proxy.stats());
            write_queue_stats(&mut out, proxy);
            write_config_stats(&mut out, proxy);
        }
        "requests" => write_request_stats(&mut out, proxy.stats()),
        "queue" => write_queue_stats(&mut out, proxy),
        "config" => write_config_stats(&mut out, proxy),
        other => return Err(StatsError::UnknownGroup(other.to_string()).into()),
    }
    Ok(Reply::ok_with_value(out))
}
