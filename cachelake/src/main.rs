//! Demo frontend for the cachelake proxy core.
//!
//! Stands up a worker fleet with an in-memory route handle, pushes a wave of
//! synthetic traffic through the cross-thread queues, hot-swaps the routing
//! config mid-run and dumps per-worker stats. Protocol listeners plug in the
//! same way: build a `RequestContext` per parsed request and hand it to a
//! worker handle.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use cachelake_core::{
    config::{ProxyOptions, RuntimeConfig},
    fiber::current_request_context,
    request::RoutableKinds,
    AnyResult, ProxyConfig, ProxyManager, Reply, ReplyResult, Request, RequestContext,
    RouteHandle,
};
use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file (TOML)
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,

    /// Worker threads (ignored when the config file sets them)
    #[clap(long, default_value_t = 2)]
    workers: usize,

    /// Client threads generating synthetic traffic
    #[clap(long, default_value_t = 4)]
    clients: usize,

    /// Requests per client thread
    #[clap(long, default_value_t = 1000)]
    requests: usize,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    runtime: RuntimeConfig,
    #[serde(default)]
    proxy: ProxyOptions,
}

/// Route handle backed by a per-config in-memory store. Stands in for a real
/// backend-contacting route tree.
struct MemoryRoute {
    store: Mutex<HashMap<Bytes, Bytes>>,
}

impl MemoryRoute {
    fn new() -> Self {
        MemoryRoute {
            store: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait(?Send)]
impl RouteHandle for MemoryRoute {
    async fn route(&self, req: &Request) -> AnyResult<Reply> {
        if let Some(ctx) = current_request_context() {
            ctx.proxy().destinations().mark_active("memory");
        }
        let mut store = self.store.lock().unwrap();
        Ok(match req.kind() {
            cachelake_core::RequestKind::Get => match store.get(req.key()) {
                Some(value) => Reply::found(value.clone()),
                None => Reply::new(ReplyResult::NotFound),
            },
            cachelake_core::RequestKind::Set => {
                let value = req.value().cloned().unwrap_or_default();
                store.insert(req.key().clone(), value);
                Reply::new(ReplyResult::Stored)
            }
            cachelake_core::RequestKind::Delete => match store.remove(req.key()) {
                Some(_) => Reply::new(ReplyResult::Deleted),
                None => Reply::new(ReplyResult::NotFound),
            },
            _ => Reply::new(ReplyResult::Ok),
        })
    }
}

fn memory_config(options: Arc<ProxyOptions>) -> Arc<ProxyConfig> {
    Arc::new(ProxyConfig::new(
        Box::new(MemoryRoute::new()),
        RoutableKinds::default(),
        options,
    ))
}

fn load_config(args: &Args) -> Result<FileConfig> {
    match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read config file {}", path.display()))?;
            toml::from_str(&raw).context("parse config file")
        }
        None => {
            let mut config = FileConfig::default();
            config.runtime.workers = args.workers;
            Ok(config)
        }
    }
}

fn run_wave(manager: &ProxyManager, clients: usize, requests: usize) -> Result<()> {
    let handles: Vec<_> = manager.handles().to_vec();
    let producers: Vec<_> = (0..clients)
        .map(|client| {
            let handles = handles.clone();
            std::thread::spawn(move || {
                let mut hits = 0usize;
                for i in 0..requests {
                    let handle = &handles[(client + i) % handles.len()];
                    let key = format!("key-{client}-{}", i % 64);

                    let (ctx, rx) = RequestContext::new(Request::set(key.clone(), "payload"));
                    handle.send_request(ctx);
                    futures_executor::block_on(rx).expect("set reply");

                    let (ctx, rx) = RequestContext::new(Request::get(key));
                    handle.send_request(ctx);
                    let reply = futures_executor::block_on(rx).expect("get reply");
                    if reply.result() == ReplyResult::Found {
                        hits += 1;
                    }
                }
                hits
            })
        })
        .collect();

    let mut hits = 0;
    for producer in producers {
        hits += producer
            .join()
            .map_err(|_| anyhow::anyhow!("client thread panicked"))?;
    }
    tracing::info!(hits, "traffic wave complete");
    Ok(())
}

fn dump_stats(manager: &ProxyManager) {
    for handle in manager.handles() {
        let (ctx, rx) = RequestContext::new(Request::stats("requests"));
        handle.send_request(ctx);
        if let Ok(reply) = futures_executor::block_on(rx) {
            let body = reply
                .value()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            for line in body.lines() {
                tracing::info!(worker = handle.id(), "{line}");
            }
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let options = Arc::new(config.proxy.clone());

    let mut manager = ProxyManager::new(config.runtime, config.proxy);
    {
        let options = options.clone();
        manager.spawn_workers(move |_| memory_config(options.clone()))?;
    }
    tracing::info!(workers = manager.handles().len(), "cachelake fleet up");

    let (ctx, rx) = RequestContext::new(Request::get("__mcrouter__.version"));
    manager.handles()[0].send_request(ctx);
    let version = futures_executor::block_on(rx)?;
    tracing::info!(
        "service info version: {}",
        version
            .value()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default()
    );

    run_wave(&manager, args.clients, args.requests)?;

    // Hot swap onto fresh configs; in-flight requests keep their snapshots,
    // displaced ones are destroyed on the worker threads.
    manager.publish_config(|_| memory_config(options.clone()));
    tracing::info!("routing config swapped");
    run_wave(&manager, args.clients, args.requests)?;

    dump_stats(&manager);
    manager.shutdown();
    tracing::info!("fleet drained and joined");
    Ok(())
}
