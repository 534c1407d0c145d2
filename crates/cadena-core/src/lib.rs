//! Cadena Core - data-plane primitives for the Cadena audio engine.
//!
//! This crate provides the building blocks the engine routes audio through:
//!
//! - [`SampleBuffer`] — the planar float block that flows between endpoints
//! - [`AudioFormat`] / [`SampleEncoding`] — wire formats and PCM conversion
//! - [`Operator`] — in-place block transforms with flat parameter vectors
//! - [`ControlSource`] / [`ControllerBinding`] — time-varying parameter drivers
//! - [`Chain`] — an ordered operator pipeline between one input and one output
//!
//! Everything here is single-threaded and allocation-free on the processing
//! path after initialization; threading and I/O live in `cadena-io` and
//! `cadena-engine`.

pub mod buffer;
pub mod chain;
pub mod controller;
pub mod format;
pub mod operator;
pub mod ops;

pub use buffer::{Sample, SampleBuffer, SAMPLE_MAX, SAMPLE_MIN};
pub use chain::{Chain, ChainError};
pub use controller::{ControlSource, ControllerBinding, LinearEnvelope, SineOscillator};
pub use format::{AudioFormat, FormatParseError, SampleEncoding};
pub use operator::{BlockShape, Operator};
pub use ops::{Amplify, ChannelCopy, DcFix};
