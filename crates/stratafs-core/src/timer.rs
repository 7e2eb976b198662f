//! Deadline-ordered timer queue used by the request scheduler.

use std::collections::BTreeSet;
use std::time::Instant;

/// Timers ordered by deadline, ties broken by insertion id.
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: BTreeSet<(Instant, u64)>,
}

impl TimerQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a timer with the given deadline.
    pub fn insert(&mut self, deadline: Instant, id: u64) {
        self.entries.insert((deadline, id));
    }

    /// Removes a timer; returns false if it was not queued.
    pub fn remove(&mut self, deadline: Instant, id: u64) -> bool {
        self.entries.remove(&(deadline, id))
    }

    /// Pops the earliest timer whose deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<u64> {
        let first = *self.entries.first()?;
        if first.0 > now {
            return None;
        }
        self.entries.pop_first();
        Some(first.1)
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|(d, _)| *d)
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no timers are pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every pending timer.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
