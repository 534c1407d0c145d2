//! The loop pseudo-device: routes one chain's output into another chain's
//! input.
//!
//! A loop device is identified by an integer tag. Its read side and write
//! side are two [`LoopDevice`] handles over one shared [`LoopBlock`]: the
//! write side publishes a block, the read side copies the most recently
//! published block (silence before the first write). The engine flushes a
//! loop output as soon as the last chain feeding it has run, so a reader
//! chain placed after the writer observes the same cycle's block.

use std::sync::Arc;

use cadena_core::{AudioFormat, SampleBuffer};
use parking_lot::Mutex;

use crate::object::{AudioObject, IoMode, LENGTH_UNKNOWN};
use crate::Result;

/// The single block of state a loop device carries between its sides.
#[derive(Debug)]
pub struct LoopBlock {
    block: Mutex<SampleBuffer>,
    tag: u32,
}

impl LoopBlock {
    /// Shared state for loop tag `tag`.
    pub fn new(tag: u32) -> Arc<Self> {
        Arc::new(Self {
            block: Mutex::new(SampleBuffer::new(0, 0, 0)),
            tag,
        })
    }

    /// The loop tag.
    pub fn tag(&self) -> u32 {
        self.tag
    }
}

/// One side of a loop device.
pub struct LoopDevice {
    label: String,
    mode: IoMode,
    format: AudioFormat,
    buffersize: usize,
    open: bool,
    position: i64,
    shared: Arc<LoopBlock>,
}

impl LoopDevice {
    /// Attach a handle with the given direction to `shared`.
    pub fn new(shared: Arc<LoopBlock>, mode: IoMode) -> Self {
        Self {
            label: format!("loop,{}", shared.tag()),
            mode,
            format: AudioFormat::default(),
            buffersize: 0,
            open: false,
            position: 0,
            shared,
        }
    }

    /// The shared state this handle attaches to.
    pub fn shared(&self) -> &Arc<LoopBlock> {
        &self.shared
    }
}

impl AudioObject for LoopDevice {
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
        let requested = buf.frames();
        let shared = self.shared.block.lock();
        if shared.frames() == 0 {
            // Nothing published yet: silence of the configured shape.
            buf.set_channel_count(self.format.channels);
            buf.set_rate(self.format.rate);
            buf.zero();
        } else {
            buf.copy_from(&shared);
            buf.set_length_in_samples(requested.min(shared.frames()));
        }
        buf.frames()
    }

    fn write_buffer(&mut self, buf: &SampleBuffer) {
        self.shared.block.lock().copy_from(buf);
        self.position += buf.frames() as i64;
    }

    fn position_in_samples(&self) -> i64 {
        self.position
    }

    fn length_in_samples(&self) -> i64 {
        LENGTH_UNKNOWN
    }

    fn seek_position_in_samples(&mut self, pos: i64) {
        self.position = pos.max(0);
    }

    fn finished(&self) -> bool {
        false
    }

    fn is_loop_device(&self) -> bool {
        true
    }
}
