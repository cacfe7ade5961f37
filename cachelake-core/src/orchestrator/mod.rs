//! Worker fleet management.
//!
//! [`ProxyManager`] spawns one OS thread per worker, each running its own
//! single-threaded runtime and one [`Proxy`](crate::proxy::Proxy) event
//! loop. The manager keeps a [`ProxyHandle`] per worker for request
//! submission and config publication, and owns the join handles; shutdown
//! raises the stop flag and then wakes and joins every worker.

use std::{sync::Arc, thread::JoinHandle};

use monoio::utils::bind_to_cpu_set;
use tracing::warn;

use crate::{
    config::{ProxyOptions, RuntimeConfig},
    error::AnyResult,
    proxy::{Proxy, ProxyHandle, ProxyMessage, ProxyShared},
    route::ProxyConfig,
    time::Clock,
};

mod runtime;
use runtime::RuntimeWrapper;

pub struct ProxyManager {
    runtime_config: RuntimeConfig,
    options: Arc<ProxyOptions>,
    clock: Clock,
    handles: Vec<ProxyHandle>,
    joins: Vec<JoinHandle<()>>,
}

impl ProxyManager {
    pub fn new(runtime_config: RuntimeConfig, options: ProxyOptions) -> Self {
        ProxyManager {
            runtime_config,
            options: Arc::new(options),
            clock: Clock::system(),
            handles: Vec::new(),
            joins: Vec::new(),
        }
    }

    /// Replace the time source of all workers spawned afterwards. Tests use
    /// this to drive waiting-timeout and queue-lag behavior by hand.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.runtime_config
    }

    /// Start the worker fleet. `make_config` builds each worker's initial
    /// routing config; workers may not share snapshots, so it runs once per
    /// worker.
    pub fn spawn_workers<F>(&mut self, mut make_config: F) -> AnyResult<()>
    where
        F: FnMut(usize) -> Arc<ProxyConfig>,
    {
        let cores = if self.runtime_config.cpu_affinity {
            std::thread::available_parallelism().ok().map(|n| n.get())
        } else {
            None
        };

        for id in 0..self.runtime_config.workers.max(1) {
            let shared = ProxyShared::new(id, &self.options, self.clock.clone(), make_config(id));
            let handle = ProxyHandle::new(shared.clone());
            let options = self.options.clone();
            let clock = self.clock.clone();
            let runtime_config = self.runtime_config.clone();

            let join = std::thread::Builder::new()
                .name(format!("cachelake-worker-{id}"))
                .spawn(move || {
                    if let Some(cores) = cores {
                        let core = id % cores;
                        if let Err(e) = bind_to_cpu_set([core]) {
                            warn!("bind worker {id} to core {core} failed: {e}");
                        }
                    }
                    let mut runtime = RuntimeWrapper::from(&runtime_config);
                    runtime.block_on(async move {
                        let proxy = Proxy::new(shared, options, clock);
                        proxy.run().await;
                    });
                })?;

            self.handles.push(handle);
            self.joins.push(join);
        }
        Ok(())
    }

    pub fn handles(&self) -> &[ProxyHandle] {
        &self.handles
    }

    /// Hot-swap every worker onto a fresh config snapshot. Each displaced
    /// snapshot travels back to its worker for destruction there.
    pub fn publish_config<F>(&self, mut make_config: F)
    where
        F: FnMut(usize) -> Arc<ProxyConfig>,
    {
        for handle in &self.handles {
            handle.replace_config(make_config(handle.id()));
        }
    }

    /// Stop the fleet: raise the shutdown flag, wake every worker, join.
    pub fn shutdown(mut self) {
        for handle in &self.handles {
            handle.begin_shutdown();
            handle.send_message(ProxyMessage::Shutdown);
        }
        for join in self.joins.drain(..) {
            if join.join().is_err() {
                tracing::error!("worker thread panicked during shutdown");
            }
        }
    }
}
