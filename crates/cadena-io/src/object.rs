//! The `AudioObject` contract: anything that produces or consumes sample
//! blocks.
//!
//! Endpoints move through a fixed lifecycle: created → configured (format,
//! buffer size) → opened → used → closed. `open`/`close` are idempotent
//! toggles. The per-cycle `read_buffer`/`write_buffer` path is infallible:
//! stream problems mark the endpoint finished (sources) or count an xrun
//! (realtime sinks); only lifecycle operations return [`IoError`].

use std::sync::Arc;

use cadena_core::{AudioFormat, SampleBuffer};
use parking_lot::Mutex;

use crate::Result;

/// Length reported by endpoints whose length is unknown or infinite.
pub const LENGTH_UNKNOWN: i64 = -1;

/// Direction an endpoint is attached with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Produces blocks (an input).
    Read,
    /// Consumes blocks (an output).
    Write,
    /// Both directions (devices opened full-duplex).
    ReadWrite,
}

/// An audio endpoint: file, device, loop, null, or buffered-proxy wrapper.
///
/// Implementations exchange one [`SampleBuffer`] block at a time. A
/// non-realtime endpoint may block internally until a full block is moved;
/// a realtime endpoint must instead report short transfers through
/// [`xruns`](AudioObject::xruns).
pub trait AudioObject: Send {
    /// Human-readable identity, e.g. the file path or device name.
    fn label(&self) -> &str;

    /// Direction this endpoint was attached with.
    fn io_mode(&self) -> IoMode;

    /// The audio format. Canonical for rate negotiation once open.
    fn format(&self) -> &AudioFormat;

    /// Configure the format. Only meaningful before `open`; sources that
    /// read their format from a header overwrite this on open.
    fn set_format(&mut self, format: AudioFormat);

    /// Hint the per-cycle block size in frames. Set before `open`.
    fn set_buffersize(&mut self, frames: usize);

    /// The configured block size in frames.
    fn buffersize(&self) -> usize;

    /// Open the endpoint. Idempotent; fails on format mismatch, busy
    /// device, missing file or unsupported encoding.
    fn open(&mut self) -> Result<()>;

    /// Close the endpoint. Idempotent.
    fn close(&mut self);

    /// Whether the endpoint is currently open.
    fn is_open(&self) -> bool;

    /// Fill up to `buf.frames()` frames; returns the frames actually read
    /// and shrinks `buf` to match. A finished source returns 0.
    fn read_buffer(&mut self, buf: &mut SampleBuffer) -> usize;

    /// Consume `buf.frames()` frames. Non-realtime endpoints loop or block
    /// internally until the block is fully written.
    fn write_buffer(&mut self, buf: &SampleBuffer);

    /// Current position in sample frames from stream start.
    fn position_in_samples(&self) -> i64;

    /// Total length in sample frames, or [`LENGTH_UNKNOWN`].
    fn length_in_samples(&self) -> i64 {
        LENGTH_UNKNOWN
    }

    /// Whether `seek_position_in_samples` can reposition this endpoint.
    fn supports_seeking(&self) -> bool {
        false
    }

    /// Reposition to `pos` frames. Refused (position unchanged) when
    /// seeking is unsupported.
    fn seek_position_in_samples(&mut self, pos: i64);

    /// Whether the source is exhausted; further reads return 0 frames.
    fn finished(&self) -> bool;

    /// Whether this endpoint's timing is dictated by hardware. Realtime
    /// endpoints participate in xrun accounting and are never wrapped by
    /// the proxy server.
    fn is_realtime(&self) -> bool {
        false
    }

    /// Whether this is a loop pseudo-device. Loop devices exchange blocks
    /// within the engine cycle and are never proxy-wrapped.
    fn is_loop_device(&self) -> bool {
        false
    }

    /// Under/overruns observed so far.
    fn xruns(&self) -> u64 {
        0
    }
}

/// An endpoint shared between the engine side and the proxy server thread.
///
/// The mutex serializes the server's block transfers against the engine's
/// synchronous fallback path; neither holds it for more than one block.
pub type SharedAudioObject = Arc<Mutex<Box<dyn AudioObject>>>;
