//! Error types for wire decoding and configuration.

use thiserror::Error;

/// Errors raised while decoding wire payloads.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("payload truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("payload length {actual} is not a whole number of {record}-byte records")]
    Misaligned { actual: usize, record: usize },

    #[error("invalid ray kind {0}")]
    InvalidRayKind(u32),

    #[error("ray batch for domain {domain} contains a ray targeting domain {target}")]
    ForeignRay { domain: u32, target: u32 },
}

/// Errors raised while loading render options.
#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid option: {0}")]
    Invalid(String),
}
