//! Monotonic millisecond timers for the event loop.
//!
//! The timer set guarantees monotonic scheduling, at-most-once delivery per
//! id, and that a cancelled timer never delivers. Time comes from a
//! [`Clock`] so tests drive the set under a simulated clock.

use std::{
    cell::Cell,
    collections::BTreeMap,
    rc::Rc,
    time::{Duration, Instant},
};

/// Source of monotonic milliseconds.
pub trait Clock {
    /// Milliseconds elapsed since an arbitrary fixed origin.
    fn now_ms(&self) -> u64;
}

/// Wall-free monotonic clock backed by [`Instant`].
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a clock anchored at construction time.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-advanced clock for tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    /// Creates a clock at t=0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock by `delta` milliseconds.
    pub fn advance(&self, delta: u64) {
        self.now.set(self.now.get() + delta);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

/// Identifier of a registered timer. Never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Set of pending timers carrying an opaque payload each.
pub struct TimerSet<T> {
    clock: Box<dyn Clock>,
    next_id: u64,
    // Keyed by (deadline, id) so expiry pops in scheduled order.
    pending: BTreeMap<(u64, TimerId), T>,
}

impl<T> TimerSet<T> {
    /// Creates a timer set over the given clock.
    pub fn new(clock: Box<dyn Clock>) -> Self {
        Self {
            clock,
            next_id: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Registers a timer firing `delay` from now, returning its id.
    pub fn add(&mut self, delay: Duration, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let deadline = self.clock.now_ms() + delay.as_millis() as u64;
        self.pending.insert((deadline, id), payload);
        id
    }

    /// Cancels a timer. Idempotent; returns whether it was still pending.
    pub fn del(&mut self, id: TimerId) -> bool {
        let key = self
            .pending
            .keys()
            .find(|(_, pending_id)| *pending_id == id)
            .copied();
        match key {
            Some(key) => self.pending.remove(&key).is_some(),
            None => false,
        }
    }

    /// Milliseconds until the earliest deadline, or `None` when empty.
    /// Already-due timers report zero.
    pub fn until_next(&self) -> Option<Duration> {
        let (deadline, _) = self.pending.keys().next()?;
        Some(Duration::from_millis(
            deadline.saturating_sub(self.clock.now_ms()),
        ))
    }

    /// Removes and returns every timer whose deadline has passed, in
    /// scheduled order. Each id is delivered at most once.
    pub fn expired(&mut self) -> Vec<(TimerId, T)> {
        let now = self.clock.now_ms();
        let mut fired = Vec::new();
        while let Some((&(deadline, id), _)) = self.pending.iter().next() {
            if deadline > now {
                break;
            }
            let payload = self
                .pending
                .remove(&(deadline, id))
                .expect("key observed under exclusive borrow");
            fired.push((id, payload));
        }
        fired
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no timers are pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
