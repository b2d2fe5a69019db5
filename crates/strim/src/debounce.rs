//! Suppression of echoed player events.
//!
//! The player reports every state change through the same events, whether the
//! change came from the user or from a packet we applied. Applying a packet
//! marks its kind here first; observers then drop events for that kind until
//! the threshold passes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::net::PacketKind;

pub const DEBOUNCE_THRESHOLD: Duration = Duration::from_millis(100);

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

pub struct Debouncer<C: Clock = SystemClock> {
    clock: C,
    threshold: Duration,
    last: Mutex<HashMap<PacketKind, Instant>>,
}

impl Debouncer<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for Debouncer<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Debouncer<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            threshold: DEBOUNCE_THRESHOLD,
            last: Mutex::new(HashMap::with_capacity(PacketKind::ALL.len())),
        }
    }

    pub fn debounce(&self, kind: PacketKind) {
        let now = self.clock.now();
        self.last.lock().insert(kind, now);
    }

    pub fn is_debounced(&self, kind: PacketKind) -> bool {
        let now = self.clock.now();
        self.last
            .lock()
            .get(&kind)
            .is_some_and(|&at| now.saturating_duration_since(at) < self.threshold)
    }
}
