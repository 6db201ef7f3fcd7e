//! Error types for the communication layer.

use thiserror::Error;

use crate::{Rank, Tag};

/// Errors raised by transports and the pump.
///
/// Everything except `Io`, `Stopped` and `InvalidRank` is a protocol
/// violation: the message framing invariant is broken and the rank cannot
/// safely continue.
#[derive(Error, Debug)]
pub enum CommError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no deserializer registered for tag {tag} (from rank {peer})")]
    UnknownTag { tag: Tag, peer: Rank },

    #[error("message kind {0} was never registered")]
    Unregistered(&'static str),

    #[error("byte count mismatch for tag {tag} from rank {peer}: advertised {advertised}, received {received}")]
    LengthMismatch {
        tag: Tag,
        peer: Rank,
        advertised: usize,
        received: usize,
    },

    #[error("received message does not match probe: expected tag {tag} from rank {peer}")]
    ProbeMismatch { tag: Tag, peer: Rank },

    #[error("malformed payload for tag {tag} ({name}): {source}")]
    Decode {
        tag: Tag,
        name: &'static str,
        #[source]
        source: WorkError,
    },

    #[error("message registries differ between ranks (local fingerprint {local:#018x})")]
    RegistryMismatch { local: u64 },

    #[error("collective {seq} contributions have different lengths ({expected} vs {actual})")]
    CollectiveMismatch { seq: u64, expected: usize, actual: usize },

    #[error("malformed collective frame: {0}")]
    CollectiveFrame(String),

    #[error("connection to rank {peer} lost: {reason}")]
    PeerLost { peer: Rank, reason: String },

    #[error("timed out after {0:?} waiting for peers to connect")]
    ConnectTimeout(std::time::Duration),

    #[error("rank {rank} out of range for a cluster of {size}")]
    InvalidRank { rank: Rank, size: usize },

    #[error("{queue} queue not empty at shutdown ({len} messages)")]
    QueueNotEmpty { queue: &'static str, len: usize },

    #[error("worker failed: {0}")]
    WorkerFailed(String),

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),

    #[error("communicator is shutting down")]
    Stopped,
}

/// Errors raised while decoding or executing a message.
#[derive(Error, Debug)]
pub enum WorkError {
    #[error("expected {expected} payload bytes, got {actual}")]
    PayloadSize { expected: usize, actual: usize },

    #[error("invalid payload: {0}")]
    Invalid(String),

    #[error(transparent)]
    Comm(#[from] Box<CommError>),

    #[error("action failed: {0}")]
    Action(String),
}

impl From<CommError> for WorkError {
    fn from(err: CommError) -> Self {
        WorkError::Comm(Box::new(err))
    }
}

/// Log a protocol violation and abort the process.
///
/// Used where continuing would mean losing or duplicating work.
pub fn fatal(context: &str, err: &dyn std::fmt::Display) -> ! {
    log::error!("fatal: {}: {}", context, err);
    eprintln!("fatal: {}: {}", context, err);
    std::process::abort()
}
