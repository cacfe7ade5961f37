//! Microsecond clock used by the queue lag tracking and the waiting-request
//! timeout. The clock is injectable so tests can drive time by hand.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic microsecond clock, cheap to clone and share across threads.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> u64 + Send + Sync>);

impl Clock {
    /// Monotonic time since process start.
    pub fn system() -> Self {
        // Materialize the epoch now so the first reading is not from a
        // partially initialized baseline taken on a worker thread.
        let epoch = process_epoch();
        Clock(Arc::new(move || epoch.elapsed().as_micros() as u64))
    }

    /// A clock that only moves when the returned [`ManualClock`] is advanced.
    pub fn manual() -> (Self, ManualClock) {
        let now = Arc::new(AtomicU64::new(0));
        let reader = now.clone();
        (
            Clock(Arc::new(move || reader.load(Ordering::Relaxed))),
            ManualClock { now_us: now },
        )
    }

    #[inline]
    pub fn now_us(&self) -> u64 {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Clock").field(&self.now_us()).finish()
    }
}

/// Writer half of [`Clock::manual`].
#[derive(Clone)]
pub struct ManualClock {
    now_us: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        self.now_us
            .fetch_add(by.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn set_us(&self, us: u64) {
        self.now_us.store(us, Ordering::Relaxed);
    }
}
