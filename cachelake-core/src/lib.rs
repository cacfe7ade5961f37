//! Per-worker request-routing core of the cachelake cache-protocol proxy.
//!
//! The engine sits between cache clients and a fleet of cache backends.
//! A front-end acceptor parses protocol requests and hands each one to a
//! worker through that worker's cross-thread message queue; the worker
//! admits or throttles it, runs the routing program as a cooperative task
//! on its own event loop, and delivers the reply through the request's
//! one-shot sink. Routing configuration hot-swaps without quiescing
//! in-flight requests: each request keeps the config snapshot it was
//! admitted under, and displaced snapshots are destroyed on their worker's
//! thread.
//!
//! Protocol framing, socket handling and the routing-program definition
//! live outside this crate; the seams are [`RequestContext`]'s reply sink,
//! the [`RouteHandle`] trait and the destination registry.

pub mod config;
pub mod context;
pub mod destination;
mod error;
pub mod fiber;
pub mod flush;
pub mod orchestrator;
pub mod proxy;
pub mod queue;
pub mod request;
pub mod route;
pub mod service_info;
pub mod stats;
pub mod time;

pub use context::RequestContext;
pub use error::{AnyError, AnyResult};
pub use orchestrator::ProxyManager;
pub use proxy::{Proxy, ProxyHandle, ProxyMessage};
pub use request::{Reply, ReplyResult, Request, RequestKind, RequestPriority};
pub use route::{ProxyConfig, RouteHandle};
