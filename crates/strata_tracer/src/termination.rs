//! Quiescence detection for the lockstep scheduler.
//!
//! Every iteration each rank contributes `(busy, sent, received)` to a
//! cluster-wide sum. When no rank is busy and every sent ray has been
//! received, ranks enter TESTING and rank 0 runs a done test: each rank
//! re-checks its queues when the probe arrives and reports back. Only a
//! unanimous idle report with balanced counters promotes the frame to DONE.
//!
//! DONE is absorbing: later tallies or verdicts never reactivate a rank.

use crate::counters::RayCountSnapshot;

/// Per-rank termination state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermState {
    /// Work may exist somewhere
    Active,
    /// A done test is in flight
    Testing,
    /// Frame complete
    Done,
}

/// Cluster-wide sums from one ray tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub busy_ranks: u64,
    pub sent: u64,
    pub received: u64,
}

impl Tally {
    /// This rank's contribution to the reduction.
    pub fn contribution(idle: bool, counts: &RayCountSnapshot) -> [u64; 3] {
        [u64::from(!idle), counts.sent, counts.received]
    }

    /// Read back a reduced contribution.
    pub fn from_reduced(values: &[u64]) -> Option<Tally> {
        match *values {
            [busy_ranks, sent, received] => Some(Tally {
                busy_ranks,
                sent,
                received,
            }),
            _ => None,
        }
    }

    /// Rays sent but not yet received anywhere.
    pub fn outstanding(&self) -> i64 {
        self.sent as i64 - self.received as i64
    }

    pub fn is_quiescent(&self) -> bool {
        self.busy_ranks == 0 && self.outstanding() == 0
    }
}

/// Termination state machine for one rank.
#[derive(Debug, Clone)]
pub struct Termination {
    state: TermState,
    tallies: u64,
    tests: u64,
}

impl Termination {
    pub fn new() -> Self {
        Self {
            state: TermState::Active,
            tallies: 0,
            tests: 0,
        }
    }

    pub fn state(&self) -> TermState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == TermState::Done
    }

    /// Rearm for a new frame.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Apply the result of a ray tally.
    pub fn apply_tally(&mut self, tally: &Tally) -> TermState {
        self.tallies += 1;
        if self.state == TermState::Active && tally.is_quiescent() {
            self.state = TermState::Testing;
            self.tests += 1;
        }
        log::debug!(
            "tally {}: busy {} outstanding {} -> {:?}",
            self.tallies,
            tally.busy_ranks,
            tally.outstanding(),
            self.state
        );
        self.state
    }

    /// Apply rank 0's done-test verdict.
    pub fn apply_verdict(&mut self, done: bool) -> TermState {
        self.state = match (self.state, done) {
            (TermState::Done, _) => TermState::Done,
            (_, true) => TermState::Done,
            (_, false) => TermState::Active,
        };
        self.state
    }

    /// Mark the frame complete directly (two-phase vote commit).
    pub fn commit(&mut self) {
        self.state = TermState::Done;
    }

    pub fn tallies(&self) -> u64 {
        self.tallies
    }

    pub fn tests(&self) -> u64 {
        self.tests
    }
}

impl Default for Termination {
    fn default() -> Self {
        Self::new()
    }
}

/// Rank 0's collection of done-test replies.
#[derive(Debug, Clone)]
pub struct DoneTest {
    expected: usize,
    replies: usize,
    all_idle: bool,
    sent: u64,
    received: u64,
}

impl DoneTest {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            replies: 0,
            all_idle: true,
            sent: 0,
            received: 0,
        }
    }

    /// Record one rank's reply. Returns the verdict once every rank answered.
    pub fn record(&mut self, idle: bool, sent: u64, received: u64) -> Option<bool> {
        self.replies += 1;
        self.all_idle &= idle;
        self.sent += sent;
        self.received += received;
        (self.replies >= self.expected).then_some(self.all_idle && self.sent == self.received)
    }
}
