//! In-process transport: one mailbox per rank.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Envelope, Packet, Transport};
use crate::error::CommError;
use crate::{Rank, Tag};

type Mailbox = Mutex<VecDeque<Packet>>;

/// Builds connected [`LocalTransport`]s for running several ranks in one
/// process, one thread group per rank.
pub struct LocalCluster;

impl LocalCluster {
    /// Create `size` transports that can all reach each other.
    pub fn new(size: usize) -> Vec<LocalTransport> {
        let mailboxes: Arc<Vec<Mailbox>> = Arc::new((0..size).map(|_| Mutex::new(VecDeque::new())).collect());
        (0..size)
            .map(|rank| LocalTransport {
                rank,
                mailboxes: Arc::clone(&mailboxes),
            })
            .collect()
    }
}

/// One rank's end of a [`LocalCluster`].
///
/// Delivery is FIFO per (sender, receiver) pair.
pub struct LocalTransport {
    rank: Rank,
    mailboxes: Arc<Vec<Mailbox>>,
}

impl LocalTransport {
    fn mailbox(&self, rank: Rank) -> Result<MutexGuard<'_, VecDeque<Packet>>, CommError> {
        let mailbox = self.mailboxes.get(rank).ok_or(CommError::InvalidRank {
            rank,
            size: self.mailboxes.len(),
        })?;
        Ok(mailbox.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.mailboxes.len()
    }

    fn probe(&mut self) -> Result<Option<Envelope>, CommError> {
        Ok(self.mailbox(self.rank)?.front().map(Packet::envelope))
    }

    fn recv(&mut self, envelope: &Envelope, buf: &mut [u8]) -> Result<usize, CommError> {
        let packet = self
            .mailbox(self.rank)?
            .pop_front()
            .ok_or(CommError::ProbeMismatch {
                tag: envelope.tag,
                peer: envelope.source,
            })?;
        packet.deliver(envelope, buf)
    }

    fn send(&mut self, dest: Rank, tag: Tag, payload: &[u8]) -> Result<(), CommError> {
        self.mailbox(dest)?.push_back(Packet {
            source: self.rank,
            tag,
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_then_recv() {
        let mut cluster = LocalCluster::new(2);
        let mut b = cluster.pop().unwrap();
        let mut a = cluster.pop().unwrap();

        assert!(b.probe().unwrap().is_none());
        a.send(1, 4, b"hello").unwrap();

        let envelope = b.probe().unwrap().unwrap();
        assert_eq!(envelope, Envelope { source: 0, tag: 4, len: 5 });

        let mut buf = vec![0u8; envelope.len];
        assert_eq!(b.recv(&envelope, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert!(b.probe().unwrap().is_none());
    }

    #[test]
    fn test_zero_byte_payload() {
        let mut cluster = LocalCluster::new(1);
        let mut a = cluster.pop().unwrap();

        a.send(0, 9, &[]).unwrap();
        let envelope = a.probe().unwrap().unwrap();
        assert_eq!(envelope.len, 0);
        assert_eq!(a.recv(&envelope, &mut []).unwrap(), 0);
    }

    #[test]
    fn test_send_to_unknown_rank() {
        let mut a = LocalCluster::new(2).remove(0);
        assert!(matches!(
            a.send(5, 0, &[1]),
            Err(CommError::InvalidRank { rank: 5, size: 2 })
        ));
    }

    #[test]
    fn test_pairwise_fifo() {
        let mut cluster = LocalCluster::new(2);
        let mut b = cluster.pop().unwrap();
        let mut a = cluster.pop().unwrap();

        for i in 0..10u8 {
            a.send(1, 0, &[i]).unwrap();
        }
        for i in 0..10u8 {
            let envelope = b.probe().unwrap().unwrap();
            let mut buf = [0u8; 1];
            b.recv(&envelope, &mut buf).unwrap();
            assert_eq!(buf[0], i);
        }
    }
}
