//! Reduction collectives carried on reserved tags.
//!
//! Rank 0 gathers one contribution per peer, combines them and sends the
//! result back down. Frames are handled by the network thread directly,
//! never queued for the execution thread, so a collective can complete
//! while the executor is blocked inside one.
//!
//! Every rank must enter collectives in the same order. Sequence numbers
//! keep overlapping rounds apart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::CommError;
use crate::Tag;

/// Contribution from a peer to rank 0.
pub(crate) const TAG_REDUCE_UP: Tag = u32::MAX;
/// Combined result from rank 0 to a peer.
pub(crate) const TAG_REDUCE_DOWN: Tag = u32::MAX - 1;
/// A peer's worker failed; the payload is its UTF-8 reason.
pub(crate) const TAG_ABORT: Tag = u32::MAX - 2;

const FRAME_HEADER_SIZE: usize = 13;
const WAKE_INTERVAL: Duration = Duration::from_millis(20);

pub(crate) fn is_system_tag(tag: Tag) -> bool {
    tag == TAG_REDUCE_UP || tag == TAG_REDUCE_DOWN || tag == TAG_ABORT
}

/// Element-wise reduction operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReduceOp {
    Sum,
    Min,
    Max,
}

impl ReduceOp {
    fn to_wire(self) -> u8 {
        match self {
            ReduceOp::Sum => 0,
            ReduceOp::Min => 1,
            ReduceOp::Max => 2,
        }
    }

    fn from_wire(v: u8) -> Result<Self, CommError> {
        match v {
            0 => Ok(ReduceOp::Sum),
            1 => Ok(ReduceOp::Min),
            2 => Ok(ReduceOp::Max),
            other => Err(CommError::CollectiveFrame(format!("unknown reduce op {}", other))),
        }
    }

    pub(crate) fn combine(self, acc: &mut [u64], other: &[u64]) {
        for (a, &b) in acc.iter_mut().zip(other) {
            *a = match self {
                ReduceOp::Sum => a.wrapping_add(b),
                ReduceOp::Min => (*a).min(b),
                ReduceOp::Max => (*a).max(b),
            };
        }
    }
}

/// One collective message: `seq:u64`, `op:u8`, `count:u32`, then `count`
/// u64 values, all little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub seq: u64,
    pub op: ReduceOp,
    pub values: Vec<u64>,
}

impl Frame {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + self.values.len() * 8);
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.push(self.op.to_wire());
        out.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, CommError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(CommError::CollectiveFrame(format!("{} byte frame is too short", bytes.len())));
        }
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[0..8]);
        let op = ReduceOp::from_wire(bytes[8])?;
        let count = u32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]) as usize;
        let body = &bytes[FRAME_HEADER_SIZE..];
        if body.len() != count * 8 {
            return Err(CommError::CollectiveFrame(format!(
                "{} values advertised, {} bytes present",
                count,
                body.len()
            )));
        }
        let values = body
            .chunks_exact(8)
            .map(|c| {
                let mut word = [0u8; 8];
                word.copy_from_slice(c);
                u64::from_le_bytes(word)
            })
            .collect();
        Ok(Self {
            seq: u64::from_le_bytes(seq),
            op,
            values,
        })
    }
}

#[derive(Default)]
struct State {
    next_seq: u64,
    /// Rank 0 only: peer contributions per sequence number
    gathered: HashMap<u64, Vec<Vec<u64>>>,
    /// Peers only: results per sequence number
    results: HashMap<u64, Vec<u64>>,
}

/// Rendezvous between the network thread and callers blocked in a
/// collective.
#[derive(Default)]
pub(crate) struct Collectives {
    state: Mutex<State>,
    arrived: Condvar,
}

impl Collectives {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the next sequence number.
    pub(crate) fn next_seq(&self) -> u64 {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        seq
    }

    /// File a frame received by the network thread.
    pub(crate) fn deliver(&self, tag: Tag, frame: Frame) {
        let mut state = self.lock();
        if tag == TAG_REDUCE_UP {
            state.gathered.entry(frame.seq).or_default().push(frame.values);
        } else {
            state.results.insert(frame.seq, frame.values);
        }
        drop(state);
        self.arrived.notify_all();
    }

    /// Wake every waiter so it can notice shutdown.
    pub(crate) fn wake(&self) {
        self.arrived.notify_all();
    }

    /// Rank 0: wait for `peers` contributions to round `seq`.
    pub(crate) fn wait_gathered(&self, seq: u64, peers: usize, stop: &AtomicBool) -> Result<Vec<Vec<u64>>, CommError> {
        let mut state = self.lock();
        loop {
            if state.gathered.get(&seq).map_or(0, Vec::len) >= peers {
                return Ok(state.gathered.remove(&seq).unwrap_or_default());
            }
            if stop.load(Ordering::Acquire) {
                return Err(CommError::Stopped);
            }
            state = self.wait(state);
        }
    }

    /// Peer: wait for rank 0's result of round `seq`.
    pub(crate) fn wait_result(&self, seq: u64, stop: &AtomicBool) -> Result<Vec<u64>, CommError> {
        let mut state = self.lock();
        loop {
            if let Some(values) = state.results.remove(&seq) {
                return Ok(values);
            }
            if stop.load(Ordering::Acquire) {
                return Err(CommError::Stopped);
            }
            state = self.wait(state);
        }
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        match self.arrived.wait_timeout(guard, WAKE_INTERVAL) {
            Ok((guard, _)) => guard,
            Err(e) => e.into_inner().0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame {
            seq: 41,
            op: ReduceOp::Max,
            values: vec![1, u64::MAX, 0],
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);

        let empty = Frame {
            seq: 0,
            op: ReduceOp::Sum,
            values: Vec::new(),
        };
        assert_eq!(empty.encode().len(), FRAME_HEADER_SIZE);
        assert_eq!(Frame::decode(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn test_frame_rejects_bad_length() {
        let mut bytes = Frame {
            seq: 1,
            op: ReduceOp::Sum,
            values: vec![5, 6],
        }
        .encode();
        bytes.pop();
        assert!(Frame::decode(&bytes).is_err());
        assert!(Frame::decode(&bytes[..4]).is_err());
    }

    #[test]
    fn test_combine() {
        let mut acc = vec![3, 10];
        ReduceOp::Sum.combine(&mut acc, &[4, 1]);
        assert_eq!(acc, vec![7, 11]);
        ReduceOp::Min.combine(&mut acc, &[9, 2]);
        assert_eq!(acc, vec![7, 2]);
        ReduceOp::Max.combine(&mut acc, &[8, 0]);
        assert_eq!(acc, vec![8, 2]);
    }

    #[test]
    fn test_gather_waits_for_all_peers() {
        let collectives = Arc::new(Collectives::default());
        let stop = Arc::new(AtomicBool::new(false));
        let seq = collectives.next_seq();

        let waiter = {
            let collectives = Arc::clone(&collectives);
            let stop = Arc::clone(&stop);
            thread::spawn(move || collectives.wait_gathered(seq, 2, &stop))
        };
        for v in [1, 2] {
            collectives.deliver(
                TAG_REDUCE_UP,
                Frame {
                    seq,
                    op: ReduceOp::Sum,
                    values: vec![v],
                },
            );
        }

        let parts = waiter.join().unwrap().unwrap();
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_wait_observes_stop() {
        let collectives = Collectives::default();
        let stop = AtomicBool::new(true);
        assert!(matches!(collectives.wait_result(0, &stop), Err(CommError::Stopped)));
    }
}
