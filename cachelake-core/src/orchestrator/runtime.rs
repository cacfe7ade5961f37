//! Per-worker runtime selection: io_uring when the kernel supports it,
//! epoll/kqueue otherwise.

use std::future::Future;

#[cfg(target_os = "linux")]
use monoio::IoUringDriver;
use monoio::{time::TimeDriver, LegacyDriver, Runtime, RuntimeBuilder};

use crate::config::{RuntimeConfig, RuntimeType};

pub(super) enum RuntimeWrapper {
    #[cfg(target_os = "linux")]
    IoUring(Runtime<TimeDriver<IoUringDriver>>),
    Legacy(Runtime<TimeDriver<LegacyDriver>>),
}

impl From<&RuntimeConfig> for RuntimeWrapper {
    fn from(config: &RuntimeConfig) -> Self {
        #[cfg(target_os = "linux")]
        let runtime_type =
            if config.runtime_type == RuntimeType::IoUring && monoio::utils::detect_uring() {
                RuntimeType::IoUring
            } else {
                RuntimeType::Legacy
            };
        #[cfg(not(target_os = "linux"))]
        let runtime_type = RuntimeType::Legacy;

        match runtime_type {
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring => RuntimeWrapper::IoUring(
                RuntimeBuilder::<IoUringDriver>::new()
                    .enable_timer()
                    .with_entries(config.entries)
                    .build()
                    .expect("build io_uring runtime"),
            ),
            RuntimeType::Legacy => RuntimeWrapper::Legacy(
                RuntimeBuilder::<LegacyDriver>::new()
                    .enable_timer()
                    .build()
                    .expect("build legacy runtime"),
            ),
        }
    }
}

impl RuntimeWrapper {
    pub(super) fn block_on<F>(&mut self, future: F) -> F::Output
    where
        F: Future,
    {
        match self {
            #[cfg(target_os = "linux")]
            RuntimeWrapper::IoUring(rt) => rt.block_on(future),
            RuntimeWrapper::Legacy(rt) => rt.block_on(future),
        }
    }
}
