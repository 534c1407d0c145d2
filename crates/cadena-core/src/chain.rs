//! An ordered operator pipeline between one input slot and one output slot.
//!
//! A `Chain` owns its operators, its controller bindings and a scratch
//! [`SampleBuffer`]. It borrows its input and output endpoints *by index*
//! into the enclosing setup's endpoint vectors; the indices are bound while
//! editing and resolved by the engine every cycle, so no pointers cross the
//! enable boundary.
//!
//! State space: `(uninitialized | initialized) × (processing | bypass) ×
//! (audible | muted)`. A fresh chain is uninitialized, processing and
//! audible. Disconnecting either endpoint drops back to uninitialized.

use thiserror::Error;

use crate::buffer::SampleBuffer;
use crate::controller::{ControlSource, ControllerBinding};
use crate::operator::{BlockShape, Operator};

/// Errors from chain editing and initialization.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    /// A controller was added or an operator edit requested with no
    /// operator selected.
    #[error("chain '{0}': no operator selected")]
    NoOperatorSelected(String),

    /// `init` was called before both endpoints were bound.
    #[error("chain '{0}': input and output must be connected before init")]
    NotConnected(String),

    /// A controller's target does not resolve to a live operator parameter.
    #[error(
        "chain '{chain}': controller targets operator {operator} parameter {param}, \
         which does not exist"
    )]
    ControllerTarget {
        /// Chain name.
        chain: String,
        /// Target operator index.
        operator: usize,
        /// Target parameter index.
        param: usize,
    },

    /// An operator index passed to `select_operator` was out of range.
    #[error("chain '{0}': operator index {1} out of range")]
    OperatorIndex(String, usize),
}

/// An ordered sequence of operators plus controllers, a mute flag, a bypass
/// flag, and input/output slot bindings.
pub struct Chain {
    name: String,
    operators: Vec<Box<dyn Operator>>,
    controllers: Vec<ControllerBinding>,
    /// Editing cursor: target for subsequent controller additions.
    selected: Option<usize>,
    muted: bool,
    bypassed: bool,
    input: Option<usize>,
    output: Option<usize>,
    initialized: bool,
    buffer: SampleBuffer,
}

impl Chain {
    /// Create an empty chain. The name must be unique within its setup.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operators: Vec::new(),
            controllers: Vec::new(),
            selected: None,
            muted: false,
            bypassed: false,
            input: None,
            output: None,
            initialized: false,
            buffer: SampleBuffer::new(0, 0, 0),
        }
    }

    /// Chain name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the chain.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Whether the output block is zeroed after processing.
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Set the mute flag.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// Whether operators are skipped.
    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    /// Set the bypass flag.
    pub fn set_bypassed(&mut self, bypassed: bool) {
        self.bypassed = bypassed;
    }

    /// Input slot index, if bound.
    pub fn input(&self) -> Option<usize> {
        self.input
    }

    /// Output slot index, if bound.
    pub fn output(&self) -> Option<usize> {
        self.output
    }

    /// Bind the input slot.
    pub fn connect_input(&mut self, index: usize) {
        self.input = Some(index);
    }

    /// Bind the output slot.
    pub fn connect_output(&mut self, index: usize) {
        self.output = Some(index);
    }

    /// Unbind the input slot; the chain returns to uninitialized.
    pub fn disconnect_input(&mut self) {
        self.input = None;
        self.initialized = false;
    }

    /// Unbind the output slot; the chain returns to uninitialized.
    pub fn disconnect_output(&mut self) {
        self.output = None;
        self.initialized = false;
    }

    /// Whether `init` has completed since the last edit.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of operators.
    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }

    /// Number of controllers.
    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    /// The controllers, in addition order.
    pub fn controllers(&self) -> &[ControllerBinding] {
        &self.controllers
    }

    /// Operator at `index`.
    pub fn operator(&self, index: usize) -> Option<&dyn Operator> {
        self.operators.get(index).map(|op| op.as_ref())
    }

    /// Mutable operator at `index`.
    pub fn operator_mut(&mut self, index: usize) -> Option<&mut Box<dyn Operator>> {
        self.operators.get_mut(index)
    }

    /// Currently selected operator index.
    pub fn selected_operator(&self) -> Option<usize> {
        self.selected
    }

    /// Move the editing cursor.
    pub fn select_operator(&mut self, index: usize) -> Result<(), ChainError> {
        if index >= self.operators.len() {
            return Err(ChainError::OperatorIndex(self.name.clone(), index));
        }
        self.selected = Some(index);
        Ok(())
    }

    /// Append an operator and select it as the target for subsequent
    /// controller additions.
    pub fn add_operator(&mut self, op: Box<dyn Operator>) {
        self.operators.push(op);
        self.selected = Some(self.operators.len() - 1);
        self.initialized = false;
    }

    /// Remove the selected operator.
    ///
    /// Controllers whose target was the removed operator are removed as a
    /// side effect; controllers targeting later operators are re-indexed.
    pub fn remove_operator(&mut self) -> Result<(), ChainError> {
        let index = self
            .selected
            .ok_or_else(|| ChainError::NoOperatorSelected(self.name.clone()))?;
        self.operators.remove(index);
        self.controllers.retain(|c| c.operator_index != index);
        for c in &mut self.controllers {
            if c.operator_index > index {
                c.operator_index -= 1;
            }
        }
        self.selected = None;
        self.initialized = false;
        Ok(())
    }

    /// Attach a controller to the selected operator.
    pub fn add_controller(
        &mut self,
        param_index: usize,
        low: f64,
        high: f64,
        source: Box<dyn ControlSource>,
    ) -> Result<(), ChainError> {
        let target = self
            .selected
            .ok_or_else(|| ChainError::NoOperatorSelected(self.name.clone()))?;
        self.controllers
            .push(ControllerBinding::new(target, param_index, low, high, source));
        Ok(())
    }

    /// Set a parameter on the selected operator.
    pub fn set_parameter(&mut self, param_index: usize, value: f64) -> Result<(), ChainError> {
        let index = self
            .selected
            .ok_or_else(|| ChainError::NoOperatorSelected(self.name.clone()))?;
        self.operators[index].set_param(param_index, value);
        Ok(())
    }

    /// Remove every operator and controller.
    pub fn clear(&mut self) {
        self.operators.clear();
        self.controllers.clear();
        self.selected = None;
        self.initialized = false;
    }

    /// Channels the pipeline produces when fed `input` channels.
    pub fn output_channels(&self, input: usize) -> usize {
        self.operators
            .iter()
            .fold(input, |ch, op| op.output_channels(ch))
    }

    /// Widest channel count any pipeline stage needs for `input` channels.
    fn peak_channels(&self, input: usize) -> usize {
        let mut ch = input;
        let mut peak = input;
        for op in &self.operators {
            ch = op.output_channels(ch);
            peak = peak.max(ch);
        }
        peak
    }

    /// Prepare for processing at the given block geometry.
    ///
    /// Requires both endpoints bound. Verifies every controller target,
    /// sizes the scratch buffer wide enough for the whole pipeline, and
    /// initializes each operator.
    pub fn init(&mut self, input_channels: usize, frames: usize, rate: u32) -> Result<(), ChainError> {
        if self.input.is_none() || self.output.is_none() {
            return Err(ChainError::NotConnected(self.name.clone()));
        }
        for c in &self.controllers {
            let ok = self
                .operators
                .get(c.operator_index)
                .map(|op| c.param_index < op.param_count())
                .unwrap_or(false);
            if !ok {
                return Err(ChainError::ControllerTarget {
                    chain: self.name.clone(),
                    operator: c.operator_index,
                    param: c.param_index,
                });
            }
        }

        let channels = self.peak_channels(input_channels).max(1);
        self.buffer = SampleBuffer::new(channels, frames, rate);
        let shape = BlockShape {
            channels,
            frames,
            rate,
        };
        for op in &mut self.operators {
            op.init(shape);
        }
        self.initialized = true;
        Ok(())
    }

    /// Process one block: copy `input` into the scratch buffer, run the
    /// pipeline (unless bypassed), then apply mute.
    ///
    /// The caller mixes [`result`](Self::result) into the bound output.
    pub fn process(&mut self, input: &SampleBuffer) {
        debug_assert!(self.initialized, "chain processed before init");

        let channels = self.buffer.channel_count();
        self.buffer.set_length_in_samples(input.frames());
        self.buffer.set_rate(input.rate());
        for ch in 0..channels {
            let dst = &mut self.buffer;
            if ch < input.channel_count() {
                // Direct copy for channels the input provides.
                let frames = input.frames();
                dst.channel_mut(ch)[..frames].copy_from_slice(input.channel(ch));
            } else {
                dst.channel_mut(ch).fill(0.0);
            }
        }

        if !self.bypassed {
            for op in &mut self.operators {
                op.process(&mut self.buffer);
            }
        }
        if self.muted {
            self.buffer.zero();
        }
    }

    /// Tick every controller and write the mapped values to their targets.
    pub fn controller_update(&mut self, position_secs: f64) {
        for c in &mut self.controllers {
            let value = c.tick(position_secs);
            if let Some(op) = self.operators.get_mut(c.operator_index) {
                op.set_param(c.param_index, value);
            }
        }
    }

    /// The block produced by the last `process` call.
    pub fn result(&self) -> &SampleBuffer {
        &self.buffer
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("name", &self.name)
            .field("operators", &self.operators.len())
            .field("controllers", &self.controllers.len())
            .field("muted", &self.muted)
            .field("bypassed", &self.bypassed)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("initialized", &self.initialized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::LinearEnvelope;
    use crate::ops::{Amplify, ChannelCopy};

    fn connected_chain(name: &str) -> Chain {
        let mut chain = Chain::new(name);
        chain.connect_input(0);
        chain.connect_output(0);
        chain
    }

    fn block(data: &[f64]) -> SampleBuffer {
        let mut buf = SampleBuffer::new(1, data.len(), 44100);
        buf.channel_mut(0).copy_from_slice(data);
        buf
    }

    #[test]
    fn init_requires_both_endpoints() {
        let mut chain = Chain::new("a");
        assert_eq!(
            chain.init(1, 64, 44100),
            Err(ChainError::NotConnected("a".into()))
        );
        chain.connect_input(0);
        assert!(chain.init(1, 64, 44100).is_err());
        chain.connect_output(0);
        assert!(chain.init(1, 64, 44100).is_ok());
        assert!(chain.is_initialized());
    }

    #[test]
    fn disconnect_drops_initialized() {
        let mut chain = connected_chain("a");
        chain.init(1, 64, 44100).unwrap();
        chain.disconnect_input();
        assert!(!chain.is_initialized());
    }

    #[test]
    fn empty_chain_is_passthrough() {
        let mut chain = connected_chain("a");
        chain.init(1, 4, 44100).unwrap();
        chain.process(&block(&[0.1, 0.2, 0.3, 0.4]));
        assert_eq!(chain.result().channel(0), &[0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn operators_apply_in_order() {
        let mut chain = connected_chain("a");
        chain.add_operator(Box::new(Amplify::new(50.0)));
        chain.add_operator(Box::new(Amplify::new(50.0)));
        chain.init(1, 2, 44100).unwrap();
        chain.process(&block(&[0.8, -0.8]));
        assert_eq!(chain.result().channel(0), &[0.2, -0.2]);
    }

    #[test]
    fn bypass_skips_operators_mute_silences() {
        let mut chain = connected_chain("a");
        chain.add_operator(Box::new(Amplify::new(0.0)));
        chain.init(1, 2, 44100).unwrap();

        chain.set_bypassed(true);
        chain.process(&block(&[0.5, 0.5]));
        assert_eq!(chain.result().channel(0), &[0.5, 0.5]);

        chain.set_bypassed(false);
        chain.set_muted(true);
        chain.process(&block(&[0.5, 0.5]));
        assert_eq!(chain.result().channel(0), &[0.0, 0.0]);
    }

    #[test]
    fn mute_overrides_bypass() {
        let mut chain = connected_chain("a");
        chain.set_bypassed(true);
        chain.set_muted(true);
        chain.init(1, 2, 44100).unwrap();
        chain.process(&block(&[0.7, 0.7]));
        assert_eq!(chain.result().channel(0), &[0.0, 0.0]);
    }

    #[test]
    fn add_operator_selects_it() {
        let mut chain = Chain::new("a");
        chain.add_operator(Box::new(Amplify::default()));
        assert_eq!(chain.selected_operator(), Some(0));
        chain.add_operator(Box::new(Amplify::default()));
        assert_eq!(chain.selected_operator(), Some(1));
    }

    #[test]
    fn controller_requires_selection() {
        let mut chain = Chain::new("a");
        let err = chain
            .add_controller(0, 0.0, 100.0, Box::new(LinearEnvelope::new(1.0)))
            .unwrap_err();
        assert_eq!(err, ChainError::NoOperatorSelected("a".into()));
    }

    #[test]
    fn remove_operator_drops_its_controllers() {
        let mut chain = Chain::new("a");
        chain.add_operator(Box::new(Amplify::default()));
        chain
            .add_controller(0, 0.0, 100.0, Box::new(LinearEnvelope::new(1.0)))
            .unwrap();
        chain.add_operator(Box::new(Amplify::default()));
        chain
            .add_controller(0, 0.0, 200.0, Box::new(LinearEnvelope::new(1.0)))
            .unwrap();

        // Remove the first operator; its controller goes with it and the
        // second controller is re-indexed to follow its operator.
        chain.select_operator(0).unwrap();
        chain.remove_operator().unwrap();
        assert_eq!(chain.operator_count(), 1);
        assert_eq!(chain.controller_count(), 1);
        assert_eq!(chain.controllers()[0].operator_index, 0);
        assert_eq!(chain.controllers()[0].high, 200.0);
    }

    #[test]
    fn controller_update_drives_parameter() {
        let mut chain = connected_chain("a");
        chain.add_operator(Box::new(Amplify::new(0.0)));
        chain
            .add_controller(0, 0.0, 100.0, Box::new(LinearEnvelope::new(2.0)))
            .unwrap();
        chain.init(1, 2, 44100).unwrap();

        chain.controller_update(1.0);
        assert_eq!(chain.operator(0).unwrap().param(0), 50.0);

        chain.controller_update(2.0);
        chain.process(&block(&[0.5, 0.5]));
        assert_eq!(chain.result().channel(0), &[0.5, 0.5]);
    }

    #[test]
    fn init_rejects_dangling_controller_target() {
        let mut chain = connected_chain("a");
        chain.add_operator(Box::new(Amplify::default()));
        // Amplify has exactly one parameter; index 3 cannot resolve.
        chain
            .add_controller(3, 0.0, 1.0, Box::new(LinearEnvelope::new(1.0)))
            .unwrap();
        let err = chain.init(1, 64, 44100).unwrap_err();
        assert!(matches!(err, ChainError::ControllerTarget { .. }));
    }

    #[test]
    fn pipeline_widens_scratch_buffer() {
        let mut chain = connected_chain("a");
        chain.add_operator(Box::new(ChannelCopy::new(1, 4)));
        chain.init(2, 8, 44100).unwrap();
        chain.process(&SampleBuffer::new(2, 8, 44100));
        assert_eq!(chain.result().channel_count(), 4);
        assert_eq!(chain.output_channels(2), 4);
    }
}
