//! Error types for chainsetup lifecycle operations.
//!
//! Only lifecycle boundaries (parse, enable, engine start) return these;
//! the per-cycle path converts stream problems into xrun counters and log
//! events instead.

use cadena_core::ChainError;
use thiserror::Error;

use crate::parse::ParseError;

/// Errors from chainsetup lifecycle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An endpoint refused to open: device busy, unsupported encoding,
    /// file missing. `enable()` rolls back endpoints opened earlier in the
    /// same call.
    #[error("setup error: {0}")]
    Setup(#[from] cadena_io::IoError),

    /// Endpoints disagree on the sample rate after open.
    #[error(
        "sample rate mismatch: '{label}' runs at {found} Hz while the \
         chainsetup rate is {expected} Hz"
    )]
    SampleRateMismatch {
        /// The offending endpoint.
        label: String,
        /// The rate adopted from the first input.
        expected: u32,
        /// The endpoint's actual rate.
        found: u32,
    },

    /// A precondition of a lifecycle operation is false, e.g. a topology
    /// edit while the setup is locked.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A controller's target operator or parameter does not exist at
    /// enable time.
    #[error("controller resolution failed: {0}")]
    ControllerResolution(#[source] ChainError),

    /// Chainsetup text could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl From<ChainError> for Error {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::ControllerTarget { .. } => Error::ControllerResolution(e),
            other => Error::InvariantViolation(other.to_string()),
        }
    }
}

/// Result alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;
