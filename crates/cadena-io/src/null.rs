//! Null devices: a silence source and a discarding sink.
//!
//! `null` is the default output when a chainsetup names none, and the
//! placeholder substituted when an endpoint is pulled out of a locked
//! setup. `rtnull` is the same device flagged realtime; it lets the
//! buffering-mode selector and multitrack inference be exercised without
//! audio hardware.

use cadena_core::{AudioFormat, SampleBuffer};

use crate::object::{AudioObject, IoMode, LENGTH_UNKNOWN};
use crate::Result;

/// Produces silence and discards writes.
pub struct NullDevice {
    label: String,
    mode: IoMode,
    format: AudioFormat,
    buffersize: usize,
    open: bool,
    position: i64,
    realtime: bool,
}

impl NullDevice {
    /// A non-realtime null device (`null`).
    pub fn new(mode: IoMode) -> Self {
        Self {
            label: "null".to_string(),
            mode,
            format: AudioFormat::default(),
            buffersize: 0,
            open: false,
            position: 0,
            realtime: false,
        }
    }

    /// A realtime-flagged null device (`rtnull`).
    pub fn realtime(mode: IoMode) -> Self {
        let mut dev = Self::new(mode);
        dev.label = "rtnull".to_string();
        dev.realtime = true;
        dev
    }
}

impl AudioObject for NullDevice {
    fn label(&self) -> &str {
        &self.label
    }

    fn io_mode(&self) -> IoMode {
        self.mode
    }

    fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn set_format(&mut self, format: AudioFormat) {
        self.format = format;
    }

    fn set_buffersize(&mut self, frames: usize) {
        self.buffersize = frames;
    }

    fn buffersize(&self) -> usize {
        self.buffersize
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read_buffer(&mut self, buf: &mut SampleBuffer) -> usize {
        buf.set_channel_count(self.format.channels);
        buf.set_rate(self.format.rate);
        buf.zero();
        self.position += buf.frames() as i64;
        buf.frames()
    }

    fn write_buffer(&mut self, buf: &SampleBuffer) {
        self.position += buf.frames() as i64;
    }

    fn position_in_samples(&self) -> i64 {
        self.position
    }

    fn length_in_samples(&self) -> i64 {
        LENGTH_UNKNOWN
    }

    fn supports_seeking(&self) -> bool {
        true
    }

    fn seek_position_in_samples(&mut self, pos: i64) {
        self.position = pos.max(0);
    }

    fn finished(&self) -> bool {
        false
    }

    fn is_realtime(&self) -> bool {
        self.realtime
    }
}
