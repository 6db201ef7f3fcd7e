//! Error types for the domain tracer.

use strata_comm::{CommError, WorkError};
use strata_core::{DomainId, WireError};
use thiserror::Error;

/// Errors raised while tracing a frame.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("adapter for domain {domain} failed: {message}")]
    Adapter { domain: DomainId, message: String },

    #[error("domain {0} is not part of the scene")]
    UnknownDomain(DomainId),

    #[error("communication error: {0}")]
    Comm(#[from] CommError),

    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("rank failed: {0}")]
    RankFailed(String),
}

impl From<TraceError> for WorkError {
    fn from(err: TraceError) -> Self {
        match err {
            TraceError::Comm(e) => WorkError::from(e),
            other => WorkError::Action(other.to_string()),
        }
    }
}
