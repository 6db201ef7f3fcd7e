//! Strata Comm - tagged wire messages and the per-rank communication pump.
//!
//! Every cross-rank interaction is a [`Work`] message: a typed unit that
//! serializes to bytes, travels under an integer tag, and is rebuilt on the
//! receiving rank by the deserializer registered for that tag.
//!
//! A [`Communicator`] runs two threads per rank:
//!
//! - the **network thread** probes the [`Transport`] for arrivals, rebuilds
//!   them through the [`Registry`] and queues them inbound, then drains the
//!   outbound queue onto the transport;
//! - the **execution thread** pops inbound messages and runs their actions
//!   against the rank's [`Worker`], stepping the worker when idle.
//!
//! The pump never looks inside payloads. Tags, lengths and destinations are
//! all it needs.

mod collective;
mod communicator;
mod error;
mod queue;
pub mod transport;
mod work;

pub use communicator::{CommConfig, CommHandle, Communicator, Step, Worker};
pub use error::{fatal, CommError, WorkError};
pub use queue::WorkQueue;
pub use transport::{Envelope, LocalCluster, LocalTransport, TcpTransport, Transport};
pub use work::{CommType, Registry, Work, WorkKind};

/// Message-kind tag, assigned by registration order.
pub type Tag = u32;

/// Index of a participating process.
pub type Rank = usize;
