//! Millisecond clocks: the real monotonic one and a hand-driven one for tests.

use core::cell::Cell;
use std::rc::Rc;

use super::time::{Duration, Millis, MonoInstant};

/// Source of monotonic time.
pub trait Clock {
    /// Current time relative to the clock's origin.
    fn now(&self) -> MonoInstant<Millis>;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> MonoInstant<Millis> {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for Rc<C> {
    fn now(&self) -> MonoInstant<Millis> {
        (**self).now()
    }
}

/// Wall-clock monotonic time, measured from construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: minstant::Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: minstant::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MonoInstant<Millis> {
        MonoInstant::new(Duration::<Millis>::from_std(self.origin.elapsed()).as_u64())
    }
}

/// Deterministic clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    /// Clock starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves time forward by `by`.
    pub fn advance(&self, by: Duration<Millis>) {
        self.now.set(self.now.get() + by.as_u64());
    }

    /// Jumps to an absolute time. Moving backwards is ignored.
    pub fn set(&self, to: MonoInstant<Millis>) {
        self.now.set(self.now.get().max(to.as_u64()));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> MonoInstant<Millis> {
        MonoInstant::new(self.now.get())
    }
}
