//! Internal diagnostic endpoints served off the get path.
//!
//! Any get whose key starts with [`INTERNAL_KEY_PREFIX`] is intercepted
//! before the route handle; the key suffix selects the endpoint.

use std::{rc::Rc, sync::Arc};

use crate::{config::ProxyOptions, context::SharedRequestContext, request::Reply};

/// Reserved key namespace for diagnostic gets, kept wire-compatible with the
/// ancestry of the protocol.
pub const INTERNAL_KEY_PREFIX: &str = "__mcrouter__.";

/// Package identification string returned by version requests.
pub const PACKAGE_STRING: &str = concat!("cachelake ", env!("CARGO_PKG_VERSION"));

/// Diagnostic endpoint dispatcher; one instance lives in each config
/// snapshot so endpoint output describes the snapshot that served it.
pub struct ServiceInfo {
    options: Arc<ProxyOptions>,
}

impl ServiceInfo {
    pub(crate) fn new(options: Arc<ProxyOptions>) -> Self {
        ServiceInfo { options }
    }

    /// Serve one intercepted get. `suffix` is the key with the namespace
    /// prefix already stripped. Always replies.
    pub fn handle_request(&self, suffix: &str, ctx: &Rc<SharedRequestContext>) {
        let reply = match suffix {
            "version" => Reply::found(PACKAGE_STRING),
            "config_age" => Reply::found(ctx.config().age_secs().to_string()),
            "options" => Reply::found(self.render_options()),
            other => Reply::local_error(format!("unknown service info key: {other}")),
        };
        ctx.send_reply(reply);
    }

    fn render_options(&self) -> String {
        let o = &self.options;
        let mut out = String::new();
        for (name, value) in [
            ("client_queue_size", o.client_queue_size as u64),
            (
                "client_queue_no_notify_rate",
                o.client_queue_no_notify_rate as u64,
            ),
            (
                "client_queue_wait_threshold_us",
                o.client_queue_wait_threshold_us,
            ),
            (
                "proxy_max_inflight_requests",
                o.proxy_max_inflight_requests as u64,
            ),
            (
                "proxy_max_throttled_requests",
                o.proxy_max_throttled_requests as u64,
            ),
            ("waiting_request_timeout_ms", o.waiting_request_timeout_ms),
            (
                "max_no_flush_event_loops",
                o.max_no_flush_event_loops as u64,
            ),
            (
                "reset_inactive_connection_interval",
                o.reset_inactive_connection_interval,
            ),
        ] {
            out.push_str(name);
            out.push(' ');
            out.push_str(&value.to_string());
            out.push('\n');
        }
        out
    }
}
