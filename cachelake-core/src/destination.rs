//! Backend destination registry owned by one worker.
//!
//! The contents of a destination are opaque to the core; what the worker
//! cares about is activity tracking and the periodic sweep that retires
//! connections idle longer than `reset_inactive_connection_interval`.

use std::{cell::Cell, cell::RefCell, collections::HashMap, rc::Rc, time::Duration};

use crate::time::Clock;

struct DestinationEntry {
    last_active_us: u64,
}

pub struct DestinationMap {
    clock: Clock,
    destinations: RefCell<HashMap<String, DestinationEntry>>,
    stopped: Cell<bool>,
}

impl DestinationMap {
    pub(crate) fn new(clock: Clock) -> Rc<Self> {
        Rc::new(DestinationMap {
            clock,
            destinations: RefCell::new(HashMap::new()),
            stopped: Cell::new(false),
        })
    }

    /// Record traffic towards a destination, creating it on first use.
    pub fn mark_active(&self, name: &str) {
        let now = self.clock.now_us();
        self.destinations
            .borrow_mut()
            .entry(name.to_string())
            .and_modify(|e| e.last_active_us = now)
            .or_insert(DestinationEntry {
                last_active_us: now,
            });
    }

    pub fn len(&self) -> usize {
        self.destinations.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.borrow().is_empty()
    }

    /// Drop destinations idle longer than `max_idle`; returns how many went.
    pub(crate) fn sweep_inactive(&self, max_idle: Duration) -> usize {
        let cutoff_us = max_idle.as_micros() as u64;
        let now = self.clock.now_us();
        let mut map = self.destinations.borrow_mut();
        let before = map.len();
        map.retain(|_, e| now.saturating_sub(e.last_active_us) <= cutoff_us);
        before - map.len()
    }

    /// Arm the periodic inactivity sweep on the current worker runtime.
    pub fn set_reset_timer(self: Rc<Self>, interval: Duration) {
        let map = self;
        monoio::spawn(async move {
            loop {
                monoio::time::sleep(interval).await;
                if map.stopped.get() {
                    break;
                }
                let swept = map.sweep_inactive(interval);
                if swept > 0 {
                    tracing::debug!(swept, "reset inactive destinations");
                }
            }
        });
    }

    /// Tear down all destinations; runs first on worker destruction.
    pub(crate) fn reset(&self) {
        self.stopped.set(true);
        self.destinations.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_retires_only_idle_destinations() {
        let (clock, hand) = Clock::manual();
        let map = DestinationMap::new(clock);
        map.mark_active("backend-a");
        hand.advance(Duration::from_millis(300));
        map.mark_active("backend-b");
        hand.advance(Duration::from_millis(300));

        // backend-a has been idle 600ms, backend-b 300ms.
        assert_eq!(map.sweep_inactive(Duration::from_millis(500)), 1);
        assert_eq!(map.len(), 1);
        map.mark_active("backend-b");
        assert_eq!(map.sweep_inactive(Duration::from_millis(500)), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let (clock, _hand) = Clock::manual();
        let map = DestinationMap::new(clock);
        map.mark_active("backend-a");
        map.mark_active("backend-b");
        map.reset();
        assert!(map.is_empty());
    }
}
