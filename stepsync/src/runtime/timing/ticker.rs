//! Periodic ticker: recurring callbacks on top of the timing wheel.
//!
//! A callback runs every `interval` until it returns `false` or its handle is
//! cancelled. Dispatch happens in [`WheelTicker::turn`], on the caller's
//! thread, so the owner of the ticker decides when callbacks may run.
//!
//! Callbacks may schedule and cancel ticks (including their own) while they
//! run: the wheel is never borrowed across a callback invocation.

use core::cell::RefCell;
use core::num::NonZeroUsize;
use std::collections::HashMap;

use thiserror::Error;

use super::clock::Clock;
use super::time::{Duration, Millis};
use super::wheel::{PowerOfTwo, TimerHandle, Wheel, WheelConfig, WheelError};
use crate::trace::{trace, warn};

/// Wheel slots; a rotation covers ~512ms at the 1ms tick.
const WHEEL_SLOTS: usize = 512;

/// Default number of concurrently scheduled ticks.
const DEFAULT_CAPACITY: usize = 64;

/// Pause between turns in [`WheelTicker::run_until`].
const IDLE_SLEEP: std::time::Duration = std::time::Duration::from_millis(1);

/// Callback invoked on every tick; return `true` to keep ticking.
pub type TickCallback = Box<dyn FnMut() -> bool>;

/// Identifies a scheduled recurring callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TickHandle(u64);

/// Failure to schedule a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TickerError {
    /// No room for another registration.
    #[error("ticker capacity exhausted")]
    Capacity,
}

impl From<WheelError> for TickerError {
    fn from(err: WheelError) -> Self {
        match err {
            WheelError::Capacity => Self::Capacity,
        }
    }
}

/// Host-provided recurring callback scheduler.
pub trait Ticker {
    /// Runs `callback` every `interval` until it returns `false`.
    ///
    /// # Errors
    ///
    /// Returns [`TickerError`] if the callback cannot be registered.
    fn schedule_tick(
        &self,
        interval: std::time::Duration,
        callback: TickCallback,
    ) -> Result<TickHandle, TickerError>;

    /// Stops a registration. Returns `false` if it had already ended.
    fn cancel_tick(&self, handle: TickHandle) -> bool;
}

struct Registration {
    interval: Duration<Millis>,
    /// `None` while the callback is being dispatched.
    timer: Option<TimerHandle<TickHandle>>,
    /// `None` while the callback is being dispatched.
    callback: Option<TickCallback>,
}

struct TickerState {
    wheel: Wheel<TickHandle, Millis>,
    registrations: HashMap<TickHandle, Registration>,
    next_id: u64,
}

/// [`Ticker`] backed by a hashed timing wheel and a [`Clock`].
pub struct WheelTicker<C: Clock> {
    clock: C,
    state: RefCell<TickerState>,
}

impl<C: Clock> WheelTicker<C> {
    /// Creates a ticker with room for a handful of registrations.
    #[must_use]
    pub fn new(clock: C) -> Self {
        Self::with_capacity(clock, NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }

    /// Creates a ticker holding at most `capacity` registrations.
    #[must_use]
    pub fn with_capacity(clock: C, capacity: NonZeroUsize) -> Self {
        let slots = PowerOfTwo::new(WHEEL_SLOTS).unwrap_or_else(|| unreachable!("512 is a power of two"));
        Self {
            clock,
            state: RefCell::new(TickerState {
                wheel: Wheel::new(WheelConfig { slots, capacity }),
                registrations: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Number of live registrations.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.borrow().registrations.len()
    }

    /// Whether a registration is still live.
    #[must_use]
    pub fn is_scheduled(&self, handle: TickHandle) -> bool {
        self.state.borrow().registrations.contains_key(&handle)
    }

    /// Fires every callback that is due at the clock's current time.
    ///
    /// Returns the number of callbacks invoked. Callbacks returning `true`
    /// are rescheduled one interval after the clock reading taken when they
    /// return.
    pub fn turn(&self) -> usize {
        let now = self.clock.now();
        let mut due = Vec::new();
        self.state.borrow_mut().wheel.tick(now, |handle| due.push(handle));

        let mut invoked = 0;
        for handle in due {
            let callback = {
                let mut state = self.state.borrow_mut();
                state.registrations.get_mut(&handle).and_then(|reg| {
                    reg.timer = None;
                    reg.callback.take()
                })
            };
            let Some(mut callback) = callback else {
                continue;
            };

            let again = callback();
            invoked += 1;

            let state = &mut *self.state.borrow_mut();
            // Cancelled while the callback ran.
            let Some(reg) = state.registrations.get_mut(&handle) else {
                continue;
            };
            if !again {
                state.registrations.remove(&handle);
                trace!(tick = ?handle, "tick finished");
                continue;
            }
            match state
                .wheel
                .schedule_after(self.clock.now(), reg.interval, handle)
            {
                Ok(timer) => {
                    reg.timer = Some(timer);
                    reg.callback = Some(callback);
                }
                Err(_e) => {
                    warn!(tick = ?handle, error = %_e, "cannot reschedule tick, dropping it");
                    state.registrations.remove(&handle);
                }
            }
        }
        invoked
    }

    /// Turns the wheel on the real clock until `done` returns `true`,
    /// sleeping briefly between turns.
    pub fn run_until(&self, mut done: impl FnMut() -> bool) {
        loop {
            self.turn();
            if done() {
                return;
            }
            std::thread::sleep(IDLE_SLEEP);
        }
    }
}

impl<C: Clock> Ticker for WheelTicker<C> {
    fn schedule_tick(
        &self,
        interval: std::time::Duration,
        callback: TickCallback,
    ) -> Result<TickHandle, TickerError> {
        let now = self.clock.now();
        let state = &mut *self.state.borrow_mut();
        let handle = TickHandle(state.next_id);
        let interval = Duration::from_std(interval);
        let timer = state.wheel.schedule_after(now, interval, handle)?;
        state.next_id += 1;
        state.registrations.insert(
            handle,
            Registration {
                interval,
                timer: Some(timer),
                callback: Some(callback),
            },
        );
        trace!(tick = ?handle, interval = %interval, "tick scheduled");
        Ok(handle)
    }

    fn cancel_tick(&self, handle: TickHandle) -> bool {
        let state = &mut *self.state.borrow_mut();
        let Some(reg) = state.registrations.remove(&handle) else {
            return false;
        };
        if let Some(timer) = reg.timer {
            state.wheel.cancel(&timer);
        }
        trace!(tick = ?handle, "tick cancelled");
        true
    }
}
