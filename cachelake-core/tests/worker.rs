//! End-to-end scenarios driven through the public fleet API: requests enter
//! through the cross-thread queue, replies come back through the one-shot
//! sinks, and reconfiguration happens from a thread that is not a worker.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    thread::ThreadId,
    time::Duration,
};

use async_trait::async_trait;
use cachelake_core::{
    config::{ProxyOptions, RuntimeConfig},
    fiber::current_request_context,
    request::RoutableKinds,
    route::null_config,
    AnyResult, ProxyConfig, ProxyManager, Reply, ReplyResult, Request, RequestContext,
    RouteHandle,
};

fn test_runtime_config(workers: usize) -> RuntimeConfig {
    RuntimeConfig {
        workers,
        cpu_affinity: false,
        ..Default::default()
    }
}

fn send(
    manager: &ProxyManager,
    worker: usize,
    req: Request,
) -> futures_channel::oneshot::Receiver<Reply> {
    let (ctx, rx) = RequestContext::new(req);
    manager.handles()[worker].send_request(ctx);
    rx
}

fn recv(rx: futures_channel::oneshot::Receiver<Reply>) -> Reply {
    futures_executor::block_on(rx).expect("reply sink cancelled")
}

/// Route that blocks on a gate until the test releases it, tagging replies
/// with a config marker so tests can tell snapshots apart.
struct GateRoute {
    gate: async_channel::Receiver<()>,
    marker: &'static str,
}

#[async_trait(?Send)]
impl RouteHandle for GateRoute {
    async fn route(&self, req: &Request) -> AnyResult<Reply> {
        let _ = self.gate.recv().await;
        Ok(Reply::found(format!("{}:{}", self.marker, req.key_str())))
    }
}

/// Route whose owning config records, on drop, which thread destroyed it;
/// while routing it records which thread executed it.
struct DropProbeRoute {
    executed_on: Arc<Mutex<HashSet<ThreadId>>>,
    dropped_on: Arc<Mutex<Vec<ThreadId>>>,
}

#[async_trait(?Send)]
impl RouteHandle for DropProbeRoute {
    async fn route(&self, req: &Request) -> AnyResult<Reply> {
        self.executed_on
            .lock()
            .unwrap()
            .insert(std::thread::current().id());
        Ok(Reply::found(req.key().clone()))
    }
}

impl Drop for DropProbeRoute {
    fn drop(&mut self) {
        self.dropped_on
            .lock()
            .unwrap()
            .push(std::thread::current().id());
    }
}

/// Route that parks a flush callback on the worker's flush list before
/// replying, through the task-local request context.
struct FlushingRoute {
    flushed: Arc<Mutex<u32>>,
}

#[async_trait(?Send)]
impl RouteHandle for FlushingRoute {
    async fn route(&self, req: &Request) -> AnyResult<Reply> {
        let ctx = current_request_context().expect("route runs under a context");
        let flushed = self.flushed.clone();
        ctx.proxy().flush_list().add(move || {
            *flushed.lock().unwrap() += 1;
        });
        ctx.proxy().destinations().mark_active("test-backend");
        Ok(Reply::found(req.key().clone()))
    }
}

fn config_with(route: Box<dyn RouteHandle>, options: &ProxyOptions) -> Arc<ProxyConfig> {
    Arc::new(ProxyConfig::new(
        route,
        RoutableKinds::default(),
        Arc::new(options.clone()),
    ))
}

#[test]
fn queue_driven_admission_sheds_busy() {
    let options = ProxyOptions {
        proxy_max_inflight_requests: 1,
        proxy_max_throttled_requests: 1,
        ..Default::default()
    };
    let (gate_tx, gate_rx) = async_channel::unbounded();
    let mut manager = ProxyManager::new(test_runtime_config(1), options.clone());
    manager
        .spawn_workers(|_| {
            config_with(
                Box::new(GateRoute {
                    gate: gate_rx.clone(),
                    marker: "v1",
                }),
                &options,
            )
        })
        .unwrap();

    let r1 = send(&manager, 0, Request::get("r1"));
    let r2 = send(&manager, 0, Request::get("r2"));
    let r3 = send(&manager, 0, Request::get("r3"));

    // The third request is shed immediately, while the first two are still
    // pending behind the gate.
    assert_eq!(recv(r3).result(), ReplyResult::Busy);

    gate_tx.send_blocking(()).unwrap();
    assert_eq!(recv(r1).result(), ReplyResult::Found);
    gate_tx.send_blocking(()).unwrap();
    assert_eq!(recv(r2).result(), ReplyResult::Found);

    manager.shutdown();
}

#[test]
fn requests_keep_their_admission_snapshot_across_hot_swap() {
    let options = ProxyOptions::default();
    let (gate_tx, gate_rx) = async_channel::unbounded();
    let mut manager = ProxyManager::new(test_runtime_config(1), options.clone());
    {
        let gate_rx = gate_rx.clone();
        let options = options.clone();
        manager
            .spawn_workers(move |_| {
                config_with(
                    Box::new(GateRoute {
                        gate: gate_rx.clone(),
                        marker: "v1",
                    }),
                    &options,
                )
            })
            .unwrap();
    }

    // r1 is admitted under v1 and parks on the gate.
    let r1 = send(&manager, 0, Request::get("k"));
    // An internal get confirms the worker picked r1 up before the swap.
    let probe = send(&manager, 0, Request::get("__mcrouter__.version"));
    recv(probe);

    manager.publish_config(|_| {
        config_with(
            Box::new(GateRoute {
                gate: gate_rx.clone(),
                marker: "v2",
            }),
            &options,
        )
    });

    // r2 is admitted strictly after the swap.
    let r2 = send(&manager, 0, Request::get("k"));
    gate_tx.send_blocking(()).unwrap();
    gate_tx.send_blocking(()).unwrap();

    let reply1 = recv(r1);
    let reply2 = recv(r2);
    assert_eq!(reply1.value().unwrap().as_ref(), b"v1:k");
    assert_eq!(reply2.value().unwrap().as_ref(), b"v2:k");

    manager.shutdown();
}

#[test]
fn displaced_configs_die_on_their_worker_thread() {
    let options = ProxyOptions::default();
    let executed_on = Arc::new(Mutex::new(HashSet::new()));
    let dropped_on = Arc::new(Mutex::new(Vec::new()));

    let mut manager = ProxyManager::new(test_runtime_config(2), options.clone());
    {
        let executed_on = executed_on.clone();
        let dropped_on = dropped_on.clone();
        let options = options.clone();
        manager
            .spawn_workers(move |_| {
                config_with(
                    Box::new(DropProbeRoute {
                        executed_on: executed_on.clone(),
                        dropped_on: dropped_on.clone(),
                    }),
                    &options,
                )
            })
            .unwrap();
    }

    // Route one request through each worker so the probe has seen both
    // worker threads.
    for worker in 0..2 {
        let reply = recv(send(&manager, worker, Request::get("warm")));
        assert_eq!(reply.result(), ReplyResult::Found);
    }
    assert_eq!(executed_on.lock().unwrap().len(), 2);

    // Reconfigure from this thread, which is neither worker.
    let options_for_new = options.clone();
    manager.publish_config(move |_| null_config(Arc::new(options_for_new.clone())));

    // Queue order guarantees the displaced snapshots are gone once the
    // follow-up requests have been answered.
    for worker in 0..2 {
        recv(send(&manager, worker, Request::get("after-swap")));
    }

    let drops = dropped_on.lock().unwrap().clone();
    let workers = executed_on.lock().unwrap().clone();
    assert_eq!(drops.len(), 2, "both displaced configs must be destroyed");
    let me = std::thread::current().id();
    for thread in drops {
        assert_ne!(thread, me, "config must not die on the reconfiguring thread");
        assert!(workers.contains(&thread), "config must die on a worker thread");
    }

    manager.shutdown();
}

#[test]
fn flush_callbacks_run_at_drain_boundaries() {
    let options = ProxyOptions {
        max_no_flush_event_loops: 1,
        ..Default::default()
    };
    let flushed = Arc::new(Mutex::new(0u32));

    let mut manager = ProxyManager::new(test_runtime_config(1), options.clone());
    {
        let flushed = flushed.clone();
        let options = options.clone();
        manager
            .spawn_workers(move |_| {
                config_with(
                    Box::new(FlushingRoute {
                        flushed: flushed.clone(),
                    }),
                    &options,
                )
            })
            .unwrap();
    }

    let reply = recv(send(&manager, 0, Request::get("k")));
    assert_eq!(reply.result(), ReplyResult::Found);

    // The callback is parked until the next drain boundary; any message
    // produces one.
    recv(send(&manager, 0, Request::version()));
    let mut waited = Duration::ZERO;
    while *flushed.lock().unwrap() == 0 && waited < Duration::from_secs(2) {
        std::thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    assert_eq!(*flushed.lock().unwrap(), 1, "flush list must run exactly once");

    manager.shutdown();
}

#[test]
fn bounded_queue_absorbs_a_burst_from_many_producers() {
    let options = ProxyOptions {
        client_queue_size: 4,
        client_queue_no_notify_rate: 8,
        ..Default::default()
    };
    let mut manager = ProxyManager::new(test_runtime_config(1), options.clone());
    {
        let options = options.clone();
        manager
            .spawn_workers(move |_| null_config(Arc::new(options.clone())))
            .unwrap();
    }

    let handle = manager.handles()[0].clone();
    let producers: Vec<_> = (0..3)
        .map(|p| {
            let handle = handle.clone();
            std::thread::spawn(move || {
                let mut receivers = Vec::new();
                for i in 0..40 {
                    let (ctx, rx) = RequestContext::new(Request::get(format!("p{p}-{i}")));
                    handle.send_request(ctx);
                    receivers.push(rx);
                }
                receivers
                    .into_iter()
                    .map(|rx| futures_executor::block_on(rx).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for producer in producers {
        let replies = producer.join().unwrap();
        assert_eq!(replies.len(), 40);
        for reply in replies {
            assert_eq!(reply.result(), ReplyResult::NotFound);
        }
    }
    assert!(handle.current_notify_period() >= 1);

    manager.shutdown();
}

#[test]
fn raw_swap_round_trips_pointer_identity() {
    let options = ProxyOptions::default();
    let mut manager = ProxyManager::new(test_runtime_config(1), options.clone());
    {
        let options = options.clone();
        manager
            .spawn_workers(move |_| null_config(Arc::new(options.clone())))
            .unwrap();
    }
    let handle = &manager.handles()[0];

    let snapshot = handle.get_config_unsafe();
    let displaced = handle.swap_config(snapshot.clone());
    assert!(Arc::ptr_eq(&displaced, &snapshot));
    assert!(Arc::ptr_eq(&handle.get_config_unsafe(), &snapshot));

    // The earlier snapshot stays usable for as long as its holder keeps it.
    let _ = snapshot.age_secs();
    drop(displaced);

    // A worker still answers normally afterwards.
    let reply = recv(send(&manager, 0, Request::version()));
    assert_eq!(reply.result(), ReplyResult::Ok);

    manager.shutdown();
}

#[test]
fn stats_groups_are_selectable_through_the_fleet() {
    let options = ProxyOptions::default();
    let mut manager = ProxyManager::new(test_runtime_config(1), options.clone());
    {
        let options = options.clone();
        manager
            .spawn_workers(move |_| null_config(Arc::new(options.clone())))
            .unwrap();
    }

    recv(send(&manager, 0, Request::get("warm")));

    let reply = recv(send(&manager, 0, Request::stats("requests")));
    let body = String::from_utf8(reply.value().unwrap().to_vec()).unwrap();
    assert!(body.contains("cmd_get_in 1"));
    assert!(body.contains("request_sent"));
    assert!(!body.contains("client_queue_notifications"));

    let reply = recv(send(&manager, 0, Request::stats("queue")));
    let body = String::from_utf8(reply.value().unwrap().to_vec()).unwrap();
    assert!(body.contains("client_queue_notifications"));

    manager.shutdown();
}
