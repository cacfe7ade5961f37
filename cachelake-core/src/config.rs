//! Static option sets consumed by the core.
//!
//! [`ProxyOptions`] governs one worker's intake path; [`RuntimeConfig`]
//! governs how the fleet of worker threads is spawned. Both deserialize with
//! per-field defaults so partial config files stay valid.

use serde::{Deserialize, Serialize};

const DEFAULT_CLIENT_QUEUE_SIZE: usize = 1024;
const DEFAULT_MAX_INFLIGHT: usize = 1024;
const DEFAULT_MAX_NO_FLUSH_EVENT_LOOPS: usize = 40;

fn default_client_queue_size() -> usize {
    DEFAULT_CLIENT_QUEUE_SIZE
}

fn default_max_inflight() -> usize {
    DEFAULT_MAX_INFLIGHT
}

fn default_max_no_flush_event_loops() -> usize {
    DEFAULT_MAX_NO_FLUSH_EVENT_LOOPS
}

/// Per-worker intake options. A zero disables the feature a field controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyOptions {
    /// Capacity of the cross-thread message queue.
    #[serde(default = "default_client_queue_size")]
    pub client_queue_size: usize,

    /// Baseline notification suppression: wake the consumer at most once per
    /// this many writes. 0 notifies on every write.
    #[serde(default)]
    pub client_queue_no_notify_rate: usize,

    /// Force a consumer wake-up once its drain lag exceeds this many
    /// microseconds. 0 disables the lag check.
    #[serde(default)]
    pub client_queue_wait_threshold_us: u64,

    /// Admission threshold; 0 disables rate limiting entirely.
    #[serde(default = "default_max_inflight")]
    pub proxy_max_inflight_requests: usize,

    /// Waiting-queue cap; excess admissions shed with BUSY. 0 uncaps.
    #[serde(default)]
    pub proxy_max_throttled_requests: usize,

    /// Deadline for queued admissions, checked lazily at pop. 0 disables.
    #[serde(default)]
    pub waiting_request_timeout_ms: u64,

    /// How many idle event-loop turns a pending flush may be deferred.
    #[serde(default = "default_max_no_flush_event_loops")]
    pub max_no_flush_event_loops: usize,

    /// Period (ms) of the inactive backend-connection sweep. 0 disables.
    #[serde(default)]
    pub reset_inactive_connection_interval: u64,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        ProxyOptions {
            client_queue_size: default_client_queue_size(),
            client_queue_no_notify_rate: 0,
            client_queue_wait_threshold_us: 0,
            proxy_max_inflight_requests: default_max_inflight(),
            proxy_max_throttled_requests: 0,
            waiting_request_timeout_ms: 0,
            max_no_flush_event_loops: default_max_no_flush_event_loops(),
            reset_inactive_connection_interval: 0,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_entries() -> u32 {
    32768
}

fn default_cpu_affinity() -> bool {
    true
}

/// Worker-fleet runtime options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// io_uring/epoll entries for each worker ring.
    #[serde(default = "default_entries")]
    pub entries: u32,
    #[serde(default)]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            workers: default_workers(),
            entries: default_entries(),
            runtime_type: RuntimeType::default(),
            cpu_affinity: default_cpu_affinity(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_disable_throttling_extras() {
        let opts = ProxyOptions::default();
        assert_eq!(opts.client_queue_size, 1024);
        assert_eq!(opts.client_queue_no_notify_rate, 0);
        assert_eq!(opts.proxy_max_throttled_requests, 0);
        assert_eq!(opts.waiting_request_timeout_ms, 0);
        assert_eq!(opts.reset_inactive_connection_interval, 0);
    }

    #[test]
    fn partial_deserialization_fills_defaults() {
        let opts: ProxyOptions = serde_json::from_str(
            "{\"proxy_max_inflight_requests\": 1, \"proxy_max_throttled_requests\": 2}",
        )
        .unwrap();
        assert_eq!(opts.proxy_max_inflight_requests, 1);
        assert_eq!(opts.proxy_max_throttled_requests, 2);
        assert_eq!(opts.client_queue_size, 1024);
        assert_eq!(opts.max_no_flush_event_loops, 40);
    }
}
