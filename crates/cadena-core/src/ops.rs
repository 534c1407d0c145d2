//! Built-in operators.
//!
//! The interesting DSP lives in external operator crates; these three are
//! the small kernel the engine itself ships: gain staging, channel routing
//! and DC offset repair. They double as the reference implementations the
//! test suite drives chains with.

use crate::buffer::SampleBuffer;
use crate::operator::{BlockShape, Operator};

/// Gain scaling, parameterized in percent (100 = unity).
///
/// Text form: `-ea:amount`.
#[derive(Debug, Clone)]
pub struct Amplify {
    percent: f64,
}

impl Amplify {
    /// Create with a gain in percent; 100.0 is unity.
    pub fn new(percent: f64) -> Self {
        Self { percent }
    }
}

impl Default for Amplify {
    fn default() -> Self {
        Self::new(100.0)
    }
}

impl Operator for Amplify {
    fn name(&self) -> &'static str {
        "ea"
    }

    fn param_names(&self) -> &'static [&'static str] {
        &["amplification-%"]
    }

    fn set_param(&mut self, index: usize, value: f64) {
        if index == 0 {
            self.percent = value;
        }
    }

    fn param(&self, index: usize) -> f64 {
        if index == 0 {
            self.percent
        } else {
            0.0
        }
    }

    fn init(&mut self, _shape: BlockShape) {}

    fn process(&mut self, buf: &mut SampleBuffer) {
        buf.mul(self.percent / 100.0);
    }
}

/// Copies one channel onto another, leaving the source in place.
///
/// Text form: `-chcopy:from,to` (1-based channel numbers).
#[derive(Debug, Clone)]
pub struct ChannelCopy {
    from: f64,
    to: f64,
}

impl ChannelCopy {
    /// Copy channel `from` onto channel `to` (1-based, as in the text form).
    pub fn new(from: u32, to: u32) -> Self {
        Self {
            from: from as f64,
            to: to as f64,
        }
    }

    fn from_index(&self) -> usize {
        (self.from.max(1.0) as usize) - 1
    }

    fn to_index(&self) -> usize {
        (self.to.max(1.0) as usize) - 1
    }
}

impl Operator for ChannelCopy {
    fn name(&self) -> &'static str {
        "chcopy"
    }

    fn param_names(&self) -> &'static [&'static str] {
        &["from-channel", "to-channel"]
    }

    fn set_param(&mut self, index: usize, value: f64) {
        match index {
            0 => self.from = value,
            1 => self.to = value,
            _ => {}
        }
    }

    fn param(&self, index: usize) -> f64 {
        match index {
            0 => self.from,
            1 => self.to,
            _ => 0.0,
        }
    }

    fn output_channels(&self, input: usize) -> usize {
        // The destination channel must exist on the output side.
        input.max(self.to_index() + 1)
    }

    fn init(&mut self, _shape: BlockShape) {}

    fn process(&mut self, buf: &mut SampleBuffer) {
        let from = self.from_index();
        let to = self.to_index();
        if from == to || from >= buf.channel_count() || to >= buf.channel_count() {
            return;
        }
        let frames = buf.frames();
        for i in 0..frames {
            let v = buf.channel(from)[i];
            buf.channel_mut(to)[i] = v;
        }
    }
}

/// Adds a constant offset per channel to repair DC-shifted material.
///
/// Text form: `-dcfix:ch1-offset,ch2-offset`.
#[derive(Debug, Clone, Default)]
pub struct DcFix {
    offsets: [f64; 2],
}

impl DcFix {
    /// Offsets for the first two channels; further channels pass through.
    pub fn new(ch1: f64, ch2: f64) -> Self {
        Self { offsets: [ch1, ch2] }
    }
}

impl Operator for DcFix {
    fn name(&self) -> &'static str {
        "dcfix"
    }

    fn param_names(&self) -> &'static [&'static str] {
        &["ch1-offset", "ch2-offset"]
    }

    fn set_param(&mut self, index: usize, value: f64) {
        if index < 2 {
            self.offsets[index] = value;
        }
    }

    fn param(&self, index: usize) -> f64 {
        if index < 2 {
            self.offsets[index]
        } else {
            0.0
        }
    }

    fn init(&mut self, _shape: BlockShape) {}

    fn process(&mut self, buf: &mut SampleBuffer) {
        for (ch, &offset) in self.offsets.iter().enumerate() {
            if offset == 0.0 || ch >= buf.channel_count() {
                continue;
            }
            for s in buf.channel_mut(ch) {
                *s += offset;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(channels: usize, frames: usize) -> SampleBuffer {
        SampleBuffer::new(channels, frames, 44100)
    }

    #[test]
    fn amplify_scales_by_percent() {
        let mut op = Amplify::new(50.0);
        op.init(BlockShape {
            channels: 1,
            frames: 4,
            rate: 44100,
        });

        let mut buf = block(1, 4);
        buf.channel_mut(0).copy_from_slice(&[0.8, -0.4, 0.2, 0.0]);
        op.process(&mut buf);
        assert_eq!(buf.channel(0), &[0.4, -0.2, 0.1, 0.0]);
    }

    #[test]
    fn amplify_param_roundtrip() {
        let mut op = Amplify::default();
        assert_eq!(op.param(0), 100.0);
        op.set_param(0, 250.0);
        assert_eq!(op.param(0), 250.0);
        assert_eq!(op.param_names(), &["amplification-%"]);
    }

    #[test]
    fn chcopy_duplicates_channel() {
        let mut op = ChannelCopy::new(1, 2);
        let mut buf = block(2, 3);
        buf.channel_mut(0).copy_from_slice(&[0.1, 0.2, 0.3]);
        buf.channel_mut(1).copy_from_slice(&[0.9, 0.9, 0.9]);
        op.process(&mut buf);
        assert_eq!(buf.channel(1), &[0.1, 0.2, 0.3]);
        assert_eq!(buf.channel(0), &[0.1, 0.2, 0.3]);
    }

    #[test]
    fn chcopy_widens_output() {
        let op = ChannelCopy::new(1, 4);
        assert_eq!(op.output_channels(2), 4);
        assert_eq!(op.output_channels(6), 6);
    }

    #[test]
    fn dcfix_shifts_channels_independently() {
        let mut op = DcFix::new(0.1, -0.1);
        let mut buf = block(2, 2);
        buf.channel_mut(0).copy_from_slice(&[0.0, 0.5]);
        buf.channel_mut(1).copy_from_slice(&[0.0, 0.5]);
        op.process(&mut buf);
        assert_eq!(buf.channel(0), &[0.1, 0.6]);
        assert_eq!(buf.channel(1), &[-0.1, 0.4]);
    }
}
