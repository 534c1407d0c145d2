//! The `Operator` trait: an in-place transform on a [`SampleBuffer`].
//!
//! Operators are the polymorphic processing units a [`Chain`](crate::Chain)
//! strings together. They expose a flat `f64` parameter vector for
//! controllers and the option parser, report how many output channels they
//! produce for a given input width, and process blocks in place.
//!
//! ## Real-time contract
//!
//! `process()` runs on the engine thread. Implementations must tolerate any
//! frame count up to the block size given at [`init`](Operator::init) and
//! must not allocate after `init` returns.

use crate::buffer::SampleBuffer;

/// Shape an operator is initialized against: the chain's scratch buffer
/// geometry at enable time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockShape {
    /// Channels in the chain's scratch buffer.
    pub channels: usize,
    /// Maximum frames per block.
    pub frames: usize,
    /// Engine sample rate.
    pub rate: u32,
}

/// An in-place block transform with a settable parameter vector.
pub trait Operator: Send {
    /// Stable operator name, as used in the chainsetup text format
    /// (without the leading dash).
    fn name(&self) -> &'static str;

    /// Parameter names, one per index.
    fn param_names(&self) -> &'static [&'static str];

    /// Number of parameters. Defaults to `param_names().len()`.
    fn param_count(&self) -> usize {
        self.param_names().len()
    }

    /// Set parameter `index` (0-based). Out-of-range indices are ignored.
    fn set_param(&mut self, index: usize, value: f64);

    /// Read parameter `index`. Out-of-range indices return 0.0.
    fn param(&self, index: usize) -> f64;

    /// Channels this operator produces when fed `input` channels.
    fn output_channels(&self, input: usize) -> usize {
        input
    }

    /// Prepare for processing. Called once at enable time with the final
    /// block geometry; any state buffers are sized here.
    fn init(&mut self, shape: BlockShape);

    /// Transform one block in place.
    fn process(&mut self, buf: &mut SampleBuffer);
}
