//! Rolling history of scheduler counter samples.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use stratafs_core::SchedulerStats;

/// One sample of the scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfSample {
    /// Sample sequence number, starting at 1.
    pub seq: u64,
    /// Wall clock time of the sample, ms since the Unix epoch.
    pub timestamp_ms: u64,
    /// Requests posted so far.
    pub posted: u64,
    /// Requests admitted immediately so far.
    pub immediate: u64,
    /// Requests that had to wait so far.
    pub queued: u64,
    /// Requests rejected so far.
    pub rejected: u64,
    /// Handle-bound requests running at sample time.
    pub scheduled: u64,
}

/// Bounded sample history; the oldest sample is dropped when full.
#[derive(Debug, Clone)]
pub struct PerfHistory {
    samples: VecDeque<PerfSample>,
    capacity: usize,
    next_seq: u64,
}

impl PerfHistory {
    /// Creates a history keeping at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 1,
        }
    }

    /// Appends a sample built from the current scheduler counters.
    pub fn record(&mut self, stats: &SchedulerStats, scheduled: usize) -> PerfSample {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let sample = PerfSample {
            seq: self.next_seq,
            timestamp_ms,
            posted: stats.posted,
            immediate: stats.immediate,
            queued: stats.queued,
            rejected: stats.rejected,
            scheduled: scheduled as u64,
        };
        self.next_seq += 1;
        self.samples.push_back(sample);
        self.trim();
        sample
    }

    /// Changes the capacity, dropping the oldest samples if needed.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.trim();
    }

    fn trim(&mut self) {
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// Samples oldest first.
    pub fn snapshot(&self) -> Vec<PerfSample> {
        self.samples.iter().copied().collect()
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true when no samples are held.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum samples kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
