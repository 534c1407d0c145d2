//! Time-varying parameter drivers.
//!
//! A [`ControlSource`] produces a value in `[0, 1]` as a function of the
//! engine position; a [`ControllerBinding`] maps that value into a target
//! range and writes it to one operator parameter. The target is addressed
//! by `(operator index, parameter index)` within the owning chain, resolved
//! against live operators at enable time.
//!
//! Once per engine cycle the chain calls
//! [`controller_update`](crate::Chain::controller_update), which ticks every
//! source and pushes the mapped values; this happens before operator
//! processing for the same cycle.

use libm::sin;

use std::f64::consts::TAU;

/// A value-producing function of stream time.
pub trait ControlSource: Send {
    /// Stable source name, as used in the chainsetup text format.
    fn name(&self) -> &'static str;

    /// Advance to `position_secs` (seconds from stream start).
    fn tick(&mut self, position_secs: f64);

    /// Current value in `[0, 1]`. Valid after the first `tick`.
    fn value(&self) -> f64;

    /// Constructor arguments for serialization, excluding the target
    /// parameter and range (those belong to the binding).
    fn args(&self) -> Vec<f64>;
}

/// Sine low-frequency oscillator.
///
/// Text form: `-kos:param,low,high,freq,initial-phase`. The phase argument
/// is in multiples of a full period (0.5 starts half a cycle in).
#[derive(Debug, Clone)]
pub struct SineOscillator {
    freq_hz: f64,
    initial_phase: f64,
    value: f64,
}

impl SineOscillator {
    /// Oscillator at `freq_hz` starting `initial_phase` periods in.
    pub fn new(freq_hz: f64, initial_phase: f64) -> Self {
        Self {
            freq_hz,
            initial_phase,
            value: 0.5,
        }
    }
}

impl ControlSource for SineOscillator {
    fn name(&self) -> &'static str {
        "kos"
    }

    fn tick(&mut self, position_secs: f64) {
        let phase = TAU * (self.freq_hz * position_secs + self.initial_phase);
        self.value = 0.5 + 0.5 * sin(phase);
    }

    fn value(&self) -> f64 {
        self.value
    }

    fn args(&self) -> Vec<f64> {
        vec![self.freq_hz, self.initial_phase]
    }
}

/// Linear ramp from 0 to 1 over a fixed duration, then held.
///
/// Text form: `-kl:param,low,high,duration-secs`.
#[derive(Debug, Clone)]
pub struct LinearEnvelope {
    duration_secs: f64,
    value: f64,
}

impl LinearEnvelope {
    /// Ramp lasting `duration_secs`; non-positive durations snap to 1.
    pub fn new(duration_secs: f64) -> Self {
        Self {
            duration_secs,
            value: 0.0,
        }
    }
}

impl ControlSource for LinearEnvelope {
    fn name(&self) -> &'static str {
        "kl"
    }

    fn tick(&mut self, position_secs: f64) {
        self.value = if self.duration_secs <= 0.0 {
            1.0
        } else {
            (position_secs / self.duration_secs).clamp(0.0, 1.0)
        };
    }

    fn value(&self) -> f64 {
        self.value
    }

    fn args(&self) -> Vec<f64> {
        vec![self.duration_secs]
    }
}

/// One controller: a source bound to an operator parameter with a range.
pub struct ControllerBinding {
    /// Index of the target operator within the owning chain.
    pub operator_index: usize,
    /// Parameter index within the target operator (0-based).
    pub param_index: usize,
    /// Value emitted when the source reads 0.
    pub low: f64,
    /// Value emitted when the source reads 1.
    pub high: f64,
    /// The driving source.
    pub source: Box<dyn ControlSource>,
}

impl ControllerBinding {
    /// Bind `source` to `(operator_index, param_index)`, mapping its unit
    /// output onto `[low, high]`.
    pub fn new(
        operator_index: usize,
        param_index: usize,
        low: f64,
        high: f64,
        source: Box<dyn ControlSource>,
    ) -> Self {
        Self {
            operator_index,
            param_index,
            low,
            high,
            source,
        }
    }

    /// Tick the source and return the mapped parameter value.
    pub fn tick(&mut self, position_secs: f64) -> f64 {
        self.source.tick(position_secs);
        self.low + (self.high - self.low) * self.source.value()
    }
}

impl std::fmt::Debug for ControllerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerBinding")
            .field("operator_index", &self.operator_index)
            .field("param_index", &self.param_index)
            .field("low", &self.low)
            .field("high", &self.high)
            .field("source", &self.source.name())
            .finish()
    }
}
