//! Audio endpoint layer for the Cadena engine.
//!
//! This crate provides:
//! - the [`AudioObject`] contract every endpoint implements
//! - WAV file endpoints via [`wav`]
//! - null and realtime-null devices via [`null`]
//! - the loop pseudo-device via [`loopdev`]
//! - the proxy buffer subsystem via [`proxy`]: a background worker that
//!   pre-reads from and drains to non-realtime endpoints through bounded
//!   rings of sample blocks

pub mod loopdev;
pub mod null;
pub mod object;
pub mod proxy;
pub mod wav;

pub use loopdev::{LoopBlock, LoopDevice};
pub use null::NullDevice;
pub use object::{AudioObject, IoMode, SharedAudioObject, LENGTH_UNKNOWN};
pub use proxy::{BufferedProxy, ProxyRing, ProxyServer};
pub use wav::{WavSink, WavSource};

use thiserror::Error;

/// Errors raised at endpoint lifecycle boundaries (open, seek).
///
/// The per-cycle read/write path never returns these; stream problems there
/// mark the endpoint finished or count an xrun instead.
#[derive(Debug, Error)]
pub enum IoError {
    /// The endpoint's backing file could not be opened or created.
    #[error("cannot open '{label}': {source}")]
    File {
        /// Endpoint label.
        label: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The backing WAV stream was rejected by the codec.
    #[error("wav error on '{label}': {source}")]
    Wav {
        /// Endpoint label.
        label: String,
        /// Underlying hound error.
        #[source]
        source: hound::Error,
    },

    /// The configured encoding is not supported by this endpoint type.
    #[error("'{label}' does not support encoding {encoding}")]
    UnsupportedEncoding {
        /// Endpoint label.
        label: String,
        /// Description of the rejected encoding.
        encoding: String,
    },

    /// The endpoint does not support the requested io mode.
    #[error("'{label}' does not support {mode:?} mode")]
    UnsupportedMode {
        /// Endpoint label.
        label: String,
        /// The rejected mode.
        mode: IoMode,
    },

    /// An operation that requires an open endpoint found it closed.
    #[error("'{label}' is not open")]
    NotOpen {
        /// Endpoint label.
        label: String,
    },

    /// A seek was requested on an endpoint that cannot seek.
    #[error("'{label}' does not support seeking")]
    SeekNotSupported {
        /// Endpoint label.
        label: String,
    },
}

/// Result alias for endpoint operations.
pub type Result<T> = std::result::Result<T, IoError>;
