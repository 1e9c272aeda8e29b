//! Hashed timing wheel with O(1) schedule/cancel and bounded per-tick work.
//!
//! Single-level, power-of-two slots; per-thread, shared-nothing. Timers whose
//! deadline lies more than one rotation away stay in their slot until the
//! cursor reaches them. Fired timers are streamed to a callback.

use core::marker::PhantomData;
use core::num::NonZeroUsize;

use thiserror::Error;

use super::slab::{Slab, SlabIndex};
use super::time::{Duration, MonoInstant, TimeUnit};

/// Handle returned to callers; includes index and generation to detect stale use.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle<T> {
    idx: SlabIndex<T>,
    generation: u32,
}

/// Scheduling failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WheelError {
    /// Every timer slot is in use.
    #[error("timing wheel capacity exhausted")]
    Capacity,
}

/// Witness type for power-of-two values.
#[derive(Clone, Copy, Debug)]
pub struct PowerOfTwo(usize);

impl PowerOfTwo {
    #[must_use]
    pub fn new(val: usize) -> Option<Self> {
        val.is_power_of_two().then_some(Self(val))
    }

    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

/// Wheel configuration (immutable after creation).
pub struct WheelConfig {
    pub slots: PowerOfTwo,
    pub capacity: NonZeroUsize,
}

/// Hashed timing wheel; one tick per unit of `U`.
pub struct Wheel<T, U: TimeUnit> {
    slots: Vec<Option<SlabIndex<T>>>, // head of list per slot
    slab: Slab<T>,
    mask: usize,
    cursor: u64, // last processed tick
    _unit: PhantomData<U>,
}

impl<T, U: TimeUnit> Wheel<T, U> {
    /// Create a new wheel.
    #[must_use]
    pub fn new(cfg: WheelConfig) -> Self {
        let slots_val = cfg.slots.get();
        Self {
            slots: vec![None; slots_val],
            slab: Slab::with_capacity(cfg.capacity),
            mask: slots_val - 1,
            cursor: 0,
            _unit: PhantomData,
        }
    }

    /// Number of scheduled timers.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    /// Schedules `payload` to fire `delay` after `now`.
    ///
    /// If `now` is behind the cursor the cursor is used instead, and a zero
    /// delay still waits for the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`WheelError::Capacity`] if every slot is taken.
    pub fn schedule_after(
        &mut self,
        now: MonoInstant<U>,
        delay: Duration<U>,
        payload: T,
    ) -> Result<TimerHandle<T>, WheelError> {
        let base = now.as_u64().max(self.cursor);
        let deadline = base.saturating_add(delay.as_u64().max(1));
        let slot = (deadline as usize) & self.mask;
        let head = self.slots[slot];
        let (idx, generation) = {
            let (idx, node) = self
                .slab
                .alloc(payload, deadline)
                .ok_or(WheelError::Capacity)?;
            node.next = head;
            node.prev = None;
            (idx, node.generation)
        };
        // Insert at head of slot list
        if let Some(head_idx) = head
            && let Some(head) = self.slab.get_mut(head_idx)
        {
            head.prev = Some(idx);
        }
        self.slots[slot] = Some(idx);
        Ok(TimerHandle { idx, generation })
    }

    /// Cancel a timer by handle. Returns `false` for stale handles.
    pub fn cancel(&mut self, handle: &TimerHandle<T>) -> bool {
        let idx = handle.idx;
        let (next, prev, deadline) = match self.slab.get(idx) {
            Some(node) if node.generation == handle.generation => {
                (node.next, node.prev, node.deadline)
            }
            _ => return false,
        };

        // Unlink from list
        if let Some(p) = prev {
            if let Some(pnode) = self.slab.get_mut(p) {
                pnode.next = next;
            }
        } else {
            let slot = (deadline as usize) & self.mask;
            self.slots[slot] = next;
        }
        if let Some(n) = next
            && let Some(nnode) = self.slab.get_mut(n)
        {
            nnode.prev = prev;
        }

        self.slab.free(idx).is_some()
    }

    /// Advance the wheel to `now` and invoke `on_fire` for each due timer.
    ///
    /// `on_fire` receives the payload by value; its handle is stale afterwards.
    /// A jump of more than one rotation visits every slot exactly once.
    pub fn tick(&mut self, now: MonoInstant<U>, mut on_fire: impl FnMut(T)) {
        let now_tick = now.as_u64();
        if now_tick <= self.cursor {
            return;
        }
        let last = now_tick.min(self.cursor + self.slots.len() as u64);
        let mut tick = self.cursor + 1;
        while tick <= last {
            let slot = (tick as usize) & self.mask;
            let mut head = self.slots[slot];
            let mut pending_head: Option<SlabIndex<T>> = None;
            while let Some(idx) = head {
                // Save next before we potentially move/free.
                let next = self.slab.get(idx).and_then(|n| n.next);
                let due = self
                    .slab
                    .get(idx)
                    .is_some_and(|n| n.deadline <= now_tick);

                if due {
                    let payload = self.slab.get_mut(idx).and_then(|n| n.payload.take());
                    self.slab.free(idx);
                    if let Some(payload) = payload {
                        on_fire(payload);
                    }
                } else {
                    // Keep pending by pushing to pending_head
                    if let Some(node) = self.slab.get_mut(idx) {
                        node.next = pending_head;
                        node.prev = None;
                    }
                    if let Some(ph) = pending_head
                        && let Some(pnode) = self.slab.get_mut(ph)
                    {
                        pnode.prev = Some(idx);
                    }
                    pending_head = Some(idx);
                }
                head = next;
            }
            self.slots[slot] = pending_head;
            tick += 1;
        }
        self.cursor = now_tick;
    }
}
