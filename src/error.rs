//! Error taxonomy for the page buffer / tick coordinator / metadata-file core.
//!
//! Every fallible operation in this crate returns [`CoreError`]; there is no
//! panic-based error path in non-test code. Retries are handled locally
//! (see [`crate::retry`]) and only surface an error once their budget is
//! exhausted.

use std::io;

use thiserror::Error;

/// The error kinds the core can raise.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("no resident entry for container address {0}")]
    NotFound(u64),

    #[error("conflicting request: {0}")]
    Conflict(String),

    #[error("read failed at address {addr}: {cause}")]
    IoRead { addr: u64, cause: io::Error },

    #[error("write failed at address {addr}: {cause}")]
    IoWrite { addr: u64, cause: io::Error },

    #[error("seek failed to offset {offset}: {cause}")]
    IoSeek { offset: u64, cause: io::Error },

    #[error("checksum mismatch validating {what} after {retries} retries")]
    ChecksumMismatch { what: &'static str, retries: u32 },

    #[error("metadata file truncated: need at least {expected} bytes, found {found}")]
    Truncated { expected: u64, found: u64 },

    #[error("tick regression: local tick {local} is ahead of candidate tick {candidate}")]
    TickRegression { local: u64, candidate: u64 },

    #[error("metadata-file index exhausted its reserved capacity ({used}/{capacity} entries)")]
    SpaceExhausted { used: usize, capacity: usize },

    #[error("operation invalid in current state: {0}")]
    StateMismatch(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
