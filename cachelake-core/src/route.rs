//! Routing-program seam and the shared routing config snapshot.
//!
//! The route handle tree itself is built elsewhere; the core only needs the
//! [`RouteHandle`] contract and the [`ProxyConfig`] wrapper whose lifetime is
//! shared between the worker's [`ConfigHolder`] and every in-flight request
//! that captured it at admission.

use std::sync::{Arc, RwLock, RwLockReadGuard};

use async_trait::async_trait;

use crate::{
    config::ProxyOptions,
    error::AnyResult,
    request::{Reply, ReplyResult, Request, RequestKind, RoutableKinds},
    service_info::ServiceInfo,
};

/// One routing program invocation: map a request to a reply by contacting
/// whatever backends the program decides on. Runs inside a worker task and
/// may suspend while awaiting backend replies; an `Err` is translated into a
/// LOCAL_ERROR reply by the task wrapper, so it never escapes the task.
#[async_trait(?Send)]
pub trait RouteHandle: Send + Sync {
    async fn route(&self, req: &Request) -> AnyResult<Reply>;
}

/// Compiled routing configuration: the route handle tree plus auxiliary
/// metadata. Immutable once built; replaced wholesale by a hot swap.
pub struct ProxyConfig {
    route: Box<dyn RouteHandle>,
    service_info: ServiceInfo,
    routable: RoutableKinds,
    born: std::time::Instant,
}

impl ProxyConfig {
    pub fn new(
        route: Box<dyn RouteHandle>,
        routable: RoutableKinds,
        options: Arc<ProxyOptions>,
    ) -> Self {
        ProxyConfig {
            route,
            service_info: ServiceInfo::new(options),
            routable,
            born: std::time::Instant::now(),
        }
    }

    pub fn route_handle(&self) -> &dyn RouteHandle {
        self.route.as_ref()
    }

    pub fn service_info(&self) -> &ServiceInfo {
        &self.service_info
    }

    pub fn routable(&self) -> RoutableKinds {
        self.routable
    }

    /// Seconds since this snapshot was compiled.
    pub fn age_secs(&self) -> u64 {
        self.born.elapsed().as_secs()
    }
}

/// Ownership cell for the active config. Readers take refcounted snapshots
/// that stay valid across hot swaps for as long as the holder of the
/// snapshot keeps it; the writer replaces the pointer under the exclusive
/// lock and walks away with the displaced config.
pub struct ConfigHolder {
    current: RwLock<Arc<ProxyConfig>>,
}

impl ConfigHolder {
    pub fn new(initial: Arc<ProxyConfig>) -> Self {
        ConfigHolder {
            current: RwLock::new(initial),
        }
    }

    /// Cheap refcounted snapshot of the current config.
    pub fn snapshot(&self) -> Arc<ProxyConfig> {
        self.current.read().unwrap().clone()
    }

    /// Read guard over the current config, for callers that need several
    /// reads against one consistent snapshot.
    pub fn locked(&self) -> RwLockReadGuard<'_, Arc<ProxyConfig>> {
        self.current.read().unwrap()
    }

    /// Replace the active config, returning the displaced one. The caller is
    /// responsible for routing the displaced handle back to its owning
    /// worker for destruction.
    pub fn swap(&self, new: Arc<ProxyConfig>) -> Arc<ProxyConfig> {
        let mut slot = self.current.write().unwrap();
        std::mem::replace(&mut *slot, new)
    }
}

/// Terminal route that answers every operation with its neutral result and
/// never contacts a backend.
pub struct NullRoute;

#[async_trait(?Send)]
impl RouteHandle for NullRoute {
    async fn route(&self, req: &Request) -> AnyResult<Reply> {
        Ok(match req.kind() {
            RequestKind::Get => Reply::new(ReplyResult::NotFound),
            RequestKind::Set => Reply::new(ReplyResult::NotStored),
            RequestKind::Delete => Reply::new(ReplyResult::NotFound),
            // Diagnostic kinds are answered by the worker itself; replying
            // here keeps the route total for odd routable sets.
            RequestKind::Stats | RequestKind::Version => Reply::new(ReplyResult::Ok),
        })
    }
}

/// Convenience for tests and composition roots.
pub fn null_config(options: Arc<ProxyOptions>) -> Arc<ProxyConfig> {
    Arc::new(ProxyConfig::new(
        Box::new(NullRoute),
        RoutableKinds::default(),
        options,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holder_swap_returns_displaced_snapshot() {
        let options = Arc::new(ProxyOptions::default());
        let first = null_config(options.clone());
        let second = null_config(options);

        let holder = ConfigHolder::new(first.clone());
        assert!(Arc::ptr_eq(&holder.snapshot(), &first));

        let displaced = holder.swap(second.clone());
        assert!(Arc::ptr_eq(&displaced, &first));
        assert!(Arc::ptr_eq(&holder.snapshot(), &second));

        // A snapshot taken before the swap stays valid for its holder.
        assert_eq!(displaced.routable(), RoutableKinds::default());
    }

    #[test]
    fn swap_back_restores_pointer_identity() {
        let options = Arc::new(ProxyOptions::default());
        let config = null_config(options);
        let holder = ConfigHolder::new(config.clone());

        let same = holder.snapshot();
        let displaced = holder.swap(same.clone());
        assert!(Arc::ptr_eq(&displaced, &config));
        assert!(Arc::ptr_eq(&holder.snapshot(), &config));
    }

    #[test]
    fn null_route_replies_neutral_results() {
        futures_executor::block_on(async {
            let r = NullRoute.route(&Request::get("k")).await.unwrap();
            assert_eq!(r.result(), ReplyResult::NotFound);
            let r = NullRoute.route(&Request::set("k", "v")).await.unwrap();
            assert_eq!(r.result(), ReplyResult::NotStored);
        });
    }
}
