//! Two-phase unanimous vote for the free-running scheduler.
//!
//! Rank 0 proposes when it is locally idle. Every rank answers commit,
//! carrying its sent/received counters, or abort. A round only decides
//! DONE when it is unanimous, its counters balance, and the totals equal
//! those of the previous unanimous round: two consecutive rounds that see
//! the same traffic rule out a ray slipping between two ranks' snapshots.

use std::time::{Duration, Instant};

/// Proposer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoterState {
    Idle,
    Proposed,
    Committed,
}

/// What the proposer should do after a ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Ballots still outstanding
    Pending,
    /// Unanimous, balanced and confirmed
    Commit,
    /// Unanimous and balanced once; propose again right away to confirm
    Confirm,
    /// Someone was busy or counters did not balance
    Abort,
}

/// Two-phase voter. Only rank 0's instance proposes or counts ballots.
#[derive(Debug, Clone)]
pub struct Voter {
    size: usize,
    state: VoterState,
    round: u64,
    commits: usize,
    aborts: usize,
    sent: u64,
    received: u64,
    previous: Option<(u64, u64)>,
    retry_after: Duration,
    last_abort: Option<Instant>,
}

impl Voter {
    pub fn new(size: usize, retry_after: Duration) -> Self {
        Self {
            size,
            state: VoterState::Idle,
            round: 0,
            commits: 0,
            aborts: 0,
            sent: 0,
            received: 0,
            previous: None,
            retry_after,
            last_abort: None,
        }
    }

    pub fn state(&self) -> VoterState {
        self.state
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Whether a new proposal may start now.
    pub fn propose_available(&self, now: Instant) -> bool {
        self.state == VoterState::Idle
            && self
                .last_abort
                .map_or(true, |t| now.duration_since(t) >= self.retry_after)
    }

    /// Start a round and return its number.
    pub fn propose(&mut self) -> u64 {
        self.round += 1;
        self.state = VoterState::Proposed;
        self.commits = 0;
        self.aborts = 0;
        self.sent = 0;
        self.received = 0;
        log::debug!("vote round {} proposed", self.round);
        self.round
    }

    /// Count a commit ballot.
    pub fn vote_commit(&mut self, round: u64, sent: u64, received: u64) -> Decision {
        if !self.accepts(round) {
            return Decision::Pending;
        }
        self.commits += 1;
        self.sent += sent;
        self.received += received;
        self.decide()
    }

    /// Count an abort ballot.
    pub fn vote_abort(&mut self, round: u64) -> Decision {
        if !self.accepts(round) {
            return Decision::Pending;
        }
        self.aborts += 1;
        self.decide()
    }

    /// Record that the proposal committed.
    pub fn commit(&mut self) {
        self.state = VoterState::Committed;
        log::debug!("vote round {} committed", self.round);
    }

    /// Drop the proposal; a new one may start after the retry interval.
    pub fn abort(&mut self, now: Instant) {
        self.state = VoterState::Idle;
        self.last_abort = Some(now);
    }

    /// Forget everything for a new frame. Round numbers keep increasing.
    pub fn reset(&mut self) {
        self.state = VoterState::Idle;
        self.previous = None;
        self.last_abort = None;
    }

    fn accepts(&self, round: u64) -> bool {
        self.state == VoterState::Proposed && round == self.round
    }

    fn decide(&mut self) -> Decision {
        if self.commits + self.aborts < self.size {
            return Decision::Pending;
        }

        let totals = (self.sent, self.received);
        let decision = if self.aborts > 0 || self.sent != self.received {
            self.previous = None;
            Decision::Abort
        } else if self.previous == Some(totals) {
            Decision::Commit
        } else {
            self.previous = Some(totals);
            self.state = VoterState::Idle;
            Decision::Confirm
        };
        log::debug!(
            "vote round {}: {} commit / {} abort, sent {} received {} -> {:?}",
            self.round,
            self.commits,
            self.aborts,
            self.sent,
            self.received,
            decision
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unanimous_rounds_commit_after_confirmation() {
        let mut voter = Voter::new(2, Duration::ZERO);
        let now = Instant::now();

        let round = voter.propose();
        assert_eq!(voter.vote_commit(round, 40, 0), Decision::Pending);
        assert_eq!(voter.vote_commit(round, 0, 40), Decision::Confirm);
        assert!(voter.propose_available(now));

        let round = voter.propose();
        voter.vote_commit(round, 40, 0);
        assert_eq!(voter.vote_commit(round, 0, 40), Decision::Commit);
        voter.commit();
        assert_eq!(voter.state(), VoterState::Committed);
        assert!(!voter.propose_available(now));
    }

    #[test]
    fn test_changed_totals_need_another_round() {
        let mut voter = Voter::new(2, Duration::ZERO);

        let round = voter.propose();
        voter.vote_commit(round, 1, 0);
        assert_eq!(voter.vote_commit(round, 0, 1), Decision::Confirm);

        // Traffic happened between the rounds
        let round = voter.propose();
        voter.vote_commit(round, 3, 0);
        assert_eq!(voter.vote_commit(round, 0, 3), Decision::Confirm);

        let round = voter.propose();
        voter.vote_commit(round, 3, 0);
        assert_eq!(voter.vote_commit(round, 0, 3), Decision::Commit);
    }

    #[test]
    fn test_any_abort_drops_proposal() {
        let mut voter = Voter::new(3, Duration::from_secs(60));
        let round = voter.propose();
        voter.vote_commit(round, 0, 0);
        voter.vote_abort(round);
        assert_eq!(voter.vote_commit(round, 0, 0), Decision::Abort);

        let now = Instant::now();
        voter.abort(now);
        assert_eq!(voter.state(), VoterState::Idle);
        assert!(!voter.propose_available(now));
    }

    #[test]
    fn test_unbalanced_counters_abort() {
        let mut voter = Voter::new(2, Duration::ZERO);
        let round = voter.propose();
        voter.vote_commit(round, 5, 0);
        assert_eq!(voter.vote_commit(round, 0, 4), Decision::Abort);
    }

    #[test]
    fn test_stale_ballots_ignored() {
        let mut voter = Voter::new(2, Duration::ZERO);
        let old = voter.propose();
        voter.vote_abort(old);
        voter.vote_commit(old, 0, 0);
        voter.abort(Instant::now());

        let round = voter.propose();
        assert_eq!(voter.vote_abort(old), Decision::Pending);
        assert_eq!(voter.vote_commit(round, 0, 0), Decision::Pending);
    }

    #[test]
    fn test_single_rank() {
        let mut voter = Voter::new(1, Duration::ZERO);
        let round = voter.propose();
        assert_eq!(voter.vote_commit(round, 0, 0), Decision::Confirm);
        let round = voter.propose();
        assert_eq!(voter.vote_commit(round, 0, 0), Decision::Commit);
    }
}
