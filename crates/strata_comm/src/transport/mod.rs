//! Point-to-point byte transports.
//!
//! A transport moves tagged byte payloads between ranks. It knows nothing
//! about message kinds; the pump probes it for the next arrival, sizes a
//! buffer from the envelope and then receives into it.

mod local;
mod tcp;

pub use local::{LocalCluster, LocalTransport};
pub use tcp::TcpTransport;

use crate::error::CommError;
use crate::{Rank, Tag};

/// Metadata of the next pending message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub source: Rank,
    pub tag: Tag,
    /// Advertised payload length in bytes
    pub len: usize,
}

/// Byte transport used by the network thread.
pub trait Transport: Send + 'static {
    /// This process's rank.
    fn rank(&self) -> Rank;

    /// Number of ranks in the run.
    fn size(&self) -> usize;

    /// Peek at the next pending message without consuming it.
    fn probe(&mut self) -> Result<Option<Envelope>, CommError>;

    /// Consume the message described by `envelope` into `buf`.
    ///
    /// Returns the number of payload bytes actually received. A count that
    /// differs from `envelope.len` is reported, not hidden: at most
    /// `buf.len()` bytes are copied but the true length is returned.
    fn recv(&mut self, envelope: &Envelope, buf: &mut [u8]) -> Result<usize, CommError>;

    /// Send a tagged payload to `dest`.
    fn send(&mut self, dest: Rank, tag: Tag, payload: &[u8]) -> Result<(), CommError>;
}

/// A payload waiting in a mailbox.
#[derive(Debug, Clone)]
pub(crate) struct Packet {
    pub source: Rank,
    pub tag: Tag,
    pub payload: Vec<u8>,
}

impl Packet {
    pub(crate) fn envelope(&self) -> Envelope {
        Envelope {
            source: self.source,
            tag: self.tag,
            len: self.payload.len(),
        }
    }

    /// Copy into `buf` after checking the packet is the one that was probed.
    pub(crate) fn deliver(self, envelope: &Envelope, buf: &mut [u8]) -> Result<usize, CommError> {
        if self.source != envelope.source || self.tag != envelope.tag {
            return Err(CommError::ProbeMismatch {
                tag: envelope.tag,
                peer: envelope.source,
            });
        }
        let n = self.payload.len().min(buf.len());
        buf[..n].copy_from_slice(&self.payload[..n]);
        Ok(self.payload.len())
    }
}
