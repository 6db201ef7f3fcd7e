//! Per-rank ray counters.
//!
//! The counters are atomics so the node can snapshot them from outside the
//! execution thread; only the execution thread ever increments them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running ray counts for the current frame.
#[derive(Debug, Default)]
pub struct RayCounters {
    produced: AtomicU64,
    traced: AtomicU64,
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
    continued: AtomicU64,
}

/// Point-in-time copy of [`RayCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RayCountSnapshot {
    /// Rays created locally: primaries plus adapter continuations
    pub produced: u64,
    /// Rays handed to an adapter
    pub traced: u64,
    /// Rays shipped to other ranks
    pub sent: u64,
    /// Rays received from other ranks
    pub received: u64,
    /// Rays dropped for lack of an owner
    pub dropped: u64,
    /// Rays that terminated: film deposits, absorptions and primary misses
    pub completed: u64,
    /// Traced rays replaced by a continuation
    pub continued: u64,
}

impl RayCountSnapshot {
    /// Rays whose fate is known. Once a frame is done, summed over every
    /// rank, this equals the summed `produced`.
    pub fn settled(&self) -> u64 {
        self.completed + self.dropped + self.continued
    }

    /// Rays sent but not yet received, summed over a set of snapshots.
    pub fn in_flight(snapshots: &[RayCountSnapshot]) -> i64 {
        snapshots.iter().map(|s| s.sent as i64 - s.received as i64).sum()
    }
}

impl RayCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_produced(&self, n: u64) {
        self.produced.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_traced(&self, n: u64) {
        self.traced.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_completed(&self, n: u64) {
        self.completed.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_continued(&self, n: u64) {
        self.continued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RayCountSnapshot {
        RayCountSnapshot {
            produced: self.produced.load(Ordering::Relaxed),
            traced: self.traced.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            continued: self.continued.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter for the next frame.
    pub fn reset(&self) {
        for counter in [
            &self.produced,
            &self.traced,
            &self.sent,
            &self.received,
            &self.dropped,
            &self.completed,
            &self.continued,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
