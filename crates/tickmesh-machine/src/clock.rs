//! Lamport logical clock.

use std::sync::{Mutex, PoisonError};

use tickmesh_types::LogicalTime;

/// Result of observing a received clock value, captured under one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Local value before the update.
    pub before: LogicalTime,
    /// Value carried by the message.
    pub received: LogicalTime,
    /// Local value after the update: `max(before, received) + 1`.
    pub after: LogicalTime,
}

impl Observation {
    /// How far the clock jumped beyond a plain tick.
    pub fn drift(&self) -> u64 {
        self.after.ticks_since(self.before).saturating_sub(1)
    }
}

/// A mutex-guarded Lamport clock. All updates serialize on the lock.
#[derive(Debug, Default)]
pub struct LogicalClock {
    value: Mutex<LogicalTime>,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock for a local event and returns the new value.
    pub fn tick(&self) -> LogicalTime {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        *value = value.next();
        *value
    }

    /// Applies Lamport's receive rule for a message stamped `received`.
    pub fn observe(&self, received: LogicalTime) -> Observation {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        let before = *value;
        *value = before.max(received).next();
        Observation {
            before,
            received,
            after: *value,
        }
    }

    pub fn current(&self) -> LogicalTime {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
