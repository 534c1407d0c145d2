//! The chainsetup: the full editable graph of one run.
//!
//! A [`Chainsetup`] owns its endpoints, chains, MIDI devices, the proxy
//! buffer server and the MIDI server. Chains bind endpoints by index into
//! the endpoint vectors; no pointers cross the enable boundary. Lifecycle:
//!
//! ```text
//! editable --enable()--> enabled --engine start--> locked
//!    ^                      |                        |
//!    +-----disable()--------+ <----engine stop-------+
//! ```
//!
//! Topology mutations (adding or removing endpoints, chains, operators,
//! controllers, rebinding) are permitted only while editable. Parameter
//! changes while locked go through the engine's command queue and are
//! applied at cycle boundaries.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use cadena_core::{AudioFormat, Chain, ControlSource, Operator};
use cadena_io::{
    AudioObject, BufferedProxy, IoMode, LoopBlock, LoopDevice, NullDevice, ProxyServer, WavSink,
    WavSource,
};

use crate::bmode::{
    select_buffering_mode, BufferingMode, BufferingProfile, GraphStats, ModeDefaults,
    ProfileOverrides, Selection, SelectorConfig,
};
use crate::error::{Error, Result};
use crate::mem;
use crate::midi::{MidiServer, RawMidiDevice, SharedMidiEndpoint};
use crate::resources::{self, Resources};

/// Lifecycle states of a chainsetup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Graph topology may be edited.
    Editable,
    /// Endpoints are open and agree on the sample rate.
    Enabled,
    /// An engine is running; topology is immutable.
    Locked,
}

/// One slot in the endpoint vectors: a direct object or its buffered
/// proxy wrapper. Mode switching rebuilds the vector in place.
pub enum Endpoint {
    /// The engine talks straight to the object.
    Direct(Box<dyn AudioObject>),
    /// The engine talks to a ring; the proxy server drives the object.
    Buffered(BufferedProxy),
}

impl Endpoint {
    /// The object behind this slot.
    pub fn object(&self) -> &dyn AudioObject {
        match self {
            Endpoint::Direct(obj) => obj.as_ref(),
            Endpoint::Buffered(proxy) => proxy,
        }
    }

    /// Mutable access to the object behind this slot.
    pub fn object_mut(&mut self) -> &mut dyn AudioObject {
        match self {
            Endpoint::Direct(obj) => obj.as_mut(),
            Endpoint::Buffered(proxy) => proxy,
        }
    }

    /// Whether this slot is proxy-wrapped.
    pub fn is_buffered(&self) -> bool {
        matches!(self, Endpoint::Buffered(_))
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Endpoint({})", self.object().label())
    }
}

/// The container for one run's graph and parameters.
pub struct Chainsetup {
    pub(crate) name: String,
    pub(crate) default_format: AudioFormat,
    pub(crate) inputs: Vec<Endpoint>,
    pub(crate) outputs: Vec<Endpoint>,
    pub(crate) chains: Vec<Chain>,
    pub(crate) midi_devices: Vec<SharedMidiEndpoint>,
    pub(crate) selected_chains: Vec<String>,

    pub(crate) buffering_mode: Option<BufferingMode>,
    pub(crate) overrides: ProfileOverrides,
    pub(crate) multitrack_override: Option<bool>,
    pub(crate) mode_defaults: ModeDefaults,
    pub(crate) active: Option<Selection>,

    pub(crate) length_secs: Option<f64>,
    pub(crate) length_in_samples: Option<i64>,
    pub(crate) looping: bool,
    pub(crate) ignore_xruns: bool,
    pub(crate) precise_sample_rates: bool,

    pub(crate) rate: u32,
    pub(crate) position: i64,
    pub(crate) state: LifecycleState,
    pub(crate) memory_locked: bool,

    pub(crate) pserver: ProxyServer,
    pub(crate) midi_server: MidiServer,
    pub(crate) loop_blocks: HashMap<u32, Arc<LoopBlock>>,
    pub(crate) resources: Resources,
}

impl Chainsetup {
    /// An empty chainsetup configured from `resources`.
    pub fn new(name: impl Into<String>, resources: Resources) -> Result<Self> {
        let default_format: AudioFormat = resources
            .string(resources::DEFAULT_AUDIO_FORMAT, "s16_le,2,44100,i")
            .parse()
            .map_err(|e| Error::InvariantViolation(format!("bad default audio format: {e}")))?;

        let profile = |key: &str, fallback: &str| {
            BufferingProfile::from_resource_str(&resources.string(key, fallback))
        };
        let mode_defaults = ModeDefaults {
            nonrt: profile(resources::BMODE_DEFAULTS_NONRT, "1024,true,50,true,100000,true")?,
            rt: profile(resources::BMODE_DEFAULTS_RT, "1024,true,50,true,100000,true")?,
            rtlowlatency: profile(
                resources::BMODE_DEFAULTS_RTLOWLATENCY,
                "256,true,50,true,100000,false",
            )?,
        };
        let precise = resources.boolean(resources::DEFAULT_PRECISE_SAMPLE_RATES);
        let rate = default_format.rate;

        Ok(Self {
            name: name.into(),
            default_format,
            inputs: Vec::new(),
            outputs: Vec::new(),
            chains: Vec::new(),
            midi_devices: Vec::new(),
            selected_chains: Vec::new(),
            buffering_mode: None,
            overrides: ProfileOverrides::default(),
            multitrack_override: None,
            mode_defaults,
            active: None,
            length_secs: None,
            length_in_samples: None,
            looping: false,
            ignore_xruns: true,
            precise_sample_rates: precise,
            rate,
            position: 0,
            state: LifecycleState::Editable,
            memory_locked: false,
            pserver: ProxyServer::new(),
            midi_server: MidiServer::new(),
            loop_blocks: HashMap::new(),
            resources,
        })
    }

    // --- identity and simple parameters ---

    /// Setup name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the setup.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Whether every endpoint is open and rates agree.
    pub fn is_enabled(&self) -> bool {
        matches!(self.state, LifecycleState::Enabled | LifecycleState::Locked)
    }

    /// Whether an engine is running over this setup.
    pub fn is_locked(&self) -> bool {
        self.state == LifecycleState::Locked
    }

    /// The sample rate: adopted from the inputs while enabled, otherwise
    /// the default format's rate.
    pub fn samples_per_second(&self) -> u32 {
        self.rate
    }

    /// Change the nominal sample rate. Refused while locked; the rate of
    /// a running engine is fixed at enable time.
    pub fn set_samples_per_second(&mut self, rate: u32) -> Result<()> {
        if self.is_locked() {
            return Err(Error::InvariantViolation(
                "cannot change sample rate while locked".into(),
            ));
        }
        self.rate = rate;
        self.default_format.rate = rate;
        Ok(())
    }

    /// Default format applied to endpoints added afterwards.
    pub fn default_format(&self) -> &AudioFormat {
        &self.default_format
    }

    /// Set the default format for subsequently added endpoints.
    pub fn set_default_format(&mut self, format: AudioFormat) {
        self.default_format = format;
        self.rate = format.rate;
    }

    /// Current engine position in sample frames.
    pub fn position_in_samples(&self) -> i64 {
        self.position
    }

    /// Effective block size: the override if set, else the active or
    /// non-realtime default profile.
    pub fn buffersize(&self) -> usize {
        if let Some(b) = self.overrides.buffersize {
            return b;
        }
        match &self.active {
            Some(sel) => sel.profile.buffersize,
            None => self.mode_defaults.nonrt.buffersize,
        }
    }

    /// Pin the block size (`-b`).
    pub fn set_buffersize(&mut self, frames: usize) {
        self.overrides.buffersize = Some(frames);
    }

    /// Pin the buffering mode (`-B`); `None` restores automatic selection.
    pub fn set_buffering_mode(&mut self, mode: Option<BufferingMode>) {
        self.buffering_mode = mode;
    }

    /// The pinned buffering mode, if any.
    pub fn buffering_mode(&self) -> Option<BufferingMode> {
        self.buffering_mode
    }

    /// The selection made by the last `enable()`.
    pub fn active_selection(&self) -> Option<&Selection> {
        self.active.as_ref()
    }

    /// Raise (or drop) scheduling priority (`-r`).
    pub fn toggle_raised_priority(&mut self, on: bool) {
        self.overrides.raised_priority = Some(on);
    }

    /// Scheduling priority used when raised (`-r:prio`).
    pub fn set_sched_priority(&mut self, priority: i32) {
        self.overrides.sched_priority = Some(priority);
    }

    /// Force double-buffering on or off (`-z:db` / `-z:nodb`).
    pub fn toggle_double_buffering(&mut self, on: bool) {
        self.overrides.double_buffer = Some(on);
    }

    /// Double-buffer depth in frames (`-z:db,size`).
    pub fn set_double_buffer_size(&mut self, frames: usize) {
        self.overrides.double_buffer_size = Some(frames);
    }

    /// Force the max-buffers flag.
    pub fn toggle_max_buffers(&mut self, on: bool) {
        self.overrides.max_buffers = Some(on);
    }

    /// Whether xruns abort the run (`false`) or are only counted (`true`).
    pub fn toggle_ignore_xruns(&mut self, on: bool) {
        self.ignore_xruns = on;
    }

    /// Ignore-xruns flag.
    pub fn ignore_xruns(&self) -> bool {
        self.ignore_xruns
    }

    /// Restart from zero instead of draining at end of stream (`-tl`).
    pub fn toggle_looping(&mut self, on: bool) {
        self.looping = on;
    }

    /// Looping flag.
    pub fn is_looping(&self) -> bool {
        self.looping
    }

    /// Insist on exact device sample rates (`-z:psr`).
    pub fn toggle_precise_sample_rates(&mut self, on: bool) {
        self.precise_sample_rates = on;
    }

    /// Multitrack-mode override (`-z:multitrack` / `-z:nomultitrack`).
    pub fn set_multitrack_override(&mut self, forced: Option<bool>) {
        self.multitrack_override = forced;
    }

    /// Pin the processing length in seconds (`-t`).
    pub fn set_length_secs(&mut self, secs: f64) {
        self.length_secs = Some(secs);
    }

    /// Processing length in samples, when known. Computed at enable time:
    /// the pinned length, else the longest finite input; `None` means
    /// infinite.
    pub fn length_in_samples(&self) -> Option<i64> {
        self.length_in_samples
    }

    // --- graph editing ---

    fn require_editable(&self, what: &str) -> Result<()> {
        if self.state != LifecycleState::Editable {
            return Err(Error::InvariantViolation(format!(
                "{what} requires an editable chainsetup (state is {:?})",
                self.state
            )));
        }
        Ok(())
    }

    /// Add an empty chain and select it.
    pub fn add_chain(&mut self, name: impl Into<String>) -> Result<()> {
        self.require_editable("adding a chain")?;
        let name = name.into();
        if self.chains.iter().any(|c| c.name() == name) {
            return Err(Error::InvariantViolation(format!(
                "chain '{name}' already exists"
            )));
        }
        self.chains.push(Chain::new(name.clone()));
        self.selected_chains = vec![name];
        Ok(())
    }

    /// Remove a chain by name.
    pub fn remove_chain(&mut self, name: &str) -> Result<()> {
        self.require_editable("removing a chain")?;
        let index = self
            .chains
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| Error::InvariantViolation(format!("no chain '{name}'")))?;
        self.chains.remove(index);
        self.selected_chains.retain(|n| n != name);
        Ok(())
    }

    /// Select chains by name, creating any that do not exist yet.
    pub fn select_chains(&mut self, names: &[String]) -> Result<()> {
        self.require_editable("selecting chains")?;
        for name in names {
            if !self.chains.iter().any(|c| c.name() == *name) {
                self.chains.push(Chain::new(name.clone()));
            }
        }
        self.selected_chains = names.to_vec();
        Ok(())
    }

    /// Names of the currently selected chains.
    pub fn selected_chain_names(&self) -> &[String] {
        &self.selected_chains
    }

    /// All chains.
    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    /// Mutable chain lookup by name.
    pub fn chain_mut(&mut self, name: &str) -> Option<&mut Chain> {
        self.chains.iter_mut().find(|c| c.name() == name)
    }

    /// Ensure at least one chain exists; used when an endpoint arrives
    /// before any `-a` option.
    pub fn add_default_chain(&mut self) -> Result<()> {
        if self.chains.is_empty() {
            self.add_chain("default")?;
        }
        if self.selected_chains.is_empty() {
            self.selected_chains = vec![self.chains[0].name().to_string()];
        }
        Ok(())
    }

    /// Build an endpoint object from its label: `null`, `rtnull`,
    /// `loop,<tag>`, or a `.wav` path.
    fn create_audio_object(&mut self, label: &str, mode: IoMode) -> Result<Box<dyn AudioObject>> {
        let mut object: Box<dyn AudioObject> = if label == "null" {
            Box::new(NullDevice::new(mode))
        } else if label == "rtnull" {
            Box::new(NullDevice::realtime(mode))
        } else if let Some(tag) = label.strip_prefix("loop,") {
            let tag: u32 = tag.parse().map_err(|_| {
                Error::InvariantViolation(format!("bad loop device tag in '{label}'"))
            })?;
            let block = self
                .loop_blocks
                .entry(tag)
                .or_insert_with(|| LoopBlock::new(tag));
            Box::new(LoopDevice::new(Arc::clone(block), mode))
        } else if label.ends_with(".wav") {
            match mode {
                IoMode::Read => Box::new(WavSource::new(label)),
                _ => Box::new(WavSink::new(label, self.default_format)),
            }
        } else {
            return Err(Error::InvariantViolation(format!(
                "unknown audio object type '{label}'"
            )));
        };
        object.set_format(self.default_format);
        Ok(object)
    }

    /// Add an input endpoint and bind it to every selected chain.
    /// A label already present reuses the existing slot.
    pub fn add_input(&mut self, label: &str) -> Result<usize> {
        self.require_editable("adding an input")?;
        self.add_default_chain()?;

        let index = match self.inputs.iter().position(|e| e.object().label() == label) {
            Some(i) => i,
            None => {
                let object = self.create_audio_object(label, IoMode::Read)?;
                self.inputs.push(Endpoint::Direct(object));
                self.inputs.len() - 1
            }
        };
        for name in self.selected_chains.clone() {
            if let Some(chain) = self.chain_mut(&name) {
                chain.connect_input(index);
            }
        }
        Ok(index)
    }

    /// Add an input object built by the caller.
    pub fn add_input_object(&mut self, object: Box<dyn AudioObject>) -> Result<usize> {
        self.require_editable("adding an input")?;
        self.add_default_chain()?;
        self.inputs.push(Endpoint::Direct(object));
        let index = self.inputs.len() - 1;
        for name in self.selected_chains.clone() {
            if let Some(chain) = self.chain_mut(&name) {
                chain.connect_input(index);
            }
        }
        Ok(index)
    }

    /// Add an output endpoint and bind it to every selected chain.
    pub fn add_output(&mut self, label: &str) -> Result<usize> {
        self.require_editable("adding an output")?;
        self.add_default_chain()?;

        let index = match self.outputs.iter().position(|e| e.object().label() == label) {
            Some(i) => i,
            None => {
                let object = self.create_audio_object(label, IoMode::Write)?;
                self.outputs.push(Endpoint::Direct(object));
                self.outputs.len() - 1
            }
        };
        for name in self.selected_chains.clone() {
            if let Some(chain) = self.chain_mut(&name) {
                chain.connect_output(index);
            }
        }
        Ok(index)
    }

    /// Add an output object built by the caller.
    pub fn add_output_object(&mut self, object: Box<dyn AudioObject>) -> Result<usize> {
        self.require_editable("adding an output")?;
        self.add_default_chain()?;
        self.outputs.push(Endpoint::Direct(object));
        let index = self.outputs.len() - 1;
        for name in self.selected_chains.clone() {
            if let Some(chain) = self.chain_mut(&name) {
                chain.connect_output(index);
            }
        }
        Ok(index)
    }

    /// Remove the input at `index`. Chains bound to it are disconnected
    /// (dropping back to uninitialized); bindings past it are re-indexed.
    pub fn remove_input(&mut self, index: usize) -> Result<()> {
        self.require_editable("removing an input")?;
        if index >= self.inputs.len() {
            return Err(Error::InvariantViolation(format!(
                "no input at index {index}"
            )));
        }
        self.inputs.remove(index);
        for chain in &mut self.chains {
            match chain.input() {
                Some(i) if i == index => chain.disconnect_input(),
                Some(i) if i > index => chain.connect_input(i - 1),
                _ => {}
            }
        }
        Ok(())
    }

    /// Remove the output at `index`; the mirror of
    /// [`remove_input`](Self::remove_input).
    pub fn remove_output(&mut self, index: usize) -> Result<()> {
        self.require_editable("removing an output")?;
        if index >= self.outputs.len() {
            return Err(Error::InvariantViolation(format!(
                "no output at index {index}"
            )));
        }
        self.outputs.remove(index);
        for chain in &mut self.chains {
            match chain.output() {
                Some(o) if o == index => chain.disconnect_output(),
                Some(o) if o > index => chain.connect_output(o - 1),
                _ => {}
            }
        }
        Ok(())
    }

    /// Attach the default output (from the resources map) to every chain
    /// that has no output yet.
    pub fn attach_default_output(&mut self) -> Result<()> {
        let unbound: Vec<String> = self
            .chains
            .iter()
            .filter(|c| c.output().is_none())
            .map(|c| c.name().to_string())
            .collect();
        if unbound.is_empty() {
            return Ok(());
        }
        let label = self.resources.string(resources::DEFAULT_OUTPUT, "null");
        info!(%label, "attaching default output");
        let previous = std::mem::replace(&mut self.selected_chains, unbound);
        let result = self.add_output(&label);
        self.selected_chains = previous;
        result.map(|_| ())
    }

    /// Append an operator to the named chain.
    pub fn add_operator_to(&mut self, chain: &str, op: Box<dyn Operator>) -> Result<()> {
        self.require_editable("adding an operator")?;
        let chain = self
            .chain_mut(chain)
            .ok_or_else(|| Error::InvariantViolation(format!("no chain '{chain}'")))?;
        chain.add_operator(op);
        Ok(())
    }

    /// Attach a controller to the selected operator of the named chain.
    pub fn add_controller_to(
        &mut self,
        chain: &str,
        param_index: usize,
        low: f64,
        high: f64,
        source: Box<dyn ControlSource>,
    ) -> Result<()> {
        self.require_editable("adding a controller")?;
        let chain = self
            .chain_mut(chain)
            .ok_or_else(|| Error::InvariantViolation(format!("no chain '{chain}'")))?;
        chain.add_controller(param_index, low, high, source)?;
        Ok(())
    }

    /// Register a MIDI device (`-Md`).
    pub fn add_midi_device(&mut self, label: &str) -> Result<()> {
        self.require_editable("adding a midi device")?;
        let device: Box<dyn crate::midi::MidiEndpoint> =
            if let Some(path) = label.strip_prefix("rawmidi,") {
                Box::new(RawMidiDevice::new(path))
            } else {
                return Err(Error::InvariantViolation(format!(
                    "unknown midi device type '{label}'"
                )));
            };
        self.midi_devices.push(Arc::new(Mutex::new(device)));
        Ok(())
    }

    /// The endpoint vectors (inputs, outputs).
    pub fn endpoints(&self) -> (&[Endpoint], &[Endpoint]) {
        (&self.inputs, &self.outputs)
    }

    // --- validity and statistics ---

    /// A chainsetup is valid for enable when it has at least one input,
    /// one output and one chain, and every chain is bound on both sides.
    pub fn is_valid(&self) -> bool {
        if self.inputs.is_empty() || self.outputs.is_empty() || self.chains.is_empty() {
            return false;
        }
        self.chains
            .iter()
            .all(|c| c.input().is_some() && c.output().is_some())
    }

    /// Topology facts for the buffering-mode selector.
    pub fn graph_stats(&self) -> GraphStats {
        let count_rt = |eps: &[Endpoint]| eps.iter().filter(|e| e.object().is_realtime()).count();
        let rt_in = count_rt(&self.inputs);
        let rt_out = count_rt(&self.outputs);
        GraphStats {
            realtime_inputs: rt_in,
            realtime_outputs: rt_out,
            nonrt_inputs: self.inputs.len() - rt_in,
            nonrt_outputs: self.outputs.len() - rt_out,
            chains: self.chains.len(),
            operators: self.chains.iter().map(|c| c.operator_count()).sum(),
        }
    }

    fn has_realtime_objects(&self) -> bool {
        let stats = self.graph_stats();
        stats.realtime_inputs > 0 || stats.realtime_outputs > 0
    }

    fn has_nonrealtime_objects(&self) -> bool {
        let stats = self.graph_stats();
        stats.nonrt_inputs > 0 || stats.nonrt_outputs > 0
    }

    fn proxy_client_count(&self) -> usize {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .filter(|e| e.is_buffered())
            .count()
    }

    // --- buffering mode enactment ---

    fn select_and_enable_buffering(&mut self) {
        let stats = self.graph_stats();
        let config = SelectorConfig {
            pinned: self.buffering_mode,
            multitrack_override: self.multitrack_override,
            rt_caps: mem::has_rt_caps(),
            defaults: self.mode_defaults,
            overrides: self.overrides,
        };
        let mut selection = select_buffering_mode(stats, &config);

        // Memory locking follows raised priority.
        if selection.profile.raised_priority {
            self.memory_locked = mem::lock_all_memory();
        } else if self.memory_locked {
            mem::unlock_all_memory();
            self.memory_locked = false;
        }

        // Double-buffering only helps when the graph mixes realtime and
        // non-realtime endpoints; uniform graphs run direct.
        let mut double_buffer = selection.profile.double_buffer;
        if double_buffer && !self.has_realtime_objects() {
            debug!("no realtime objects; forcing direct mode");
            double_buffer = false;
        }
        if double_buffer && !self.has_nonrealtime_objects() {
            debug!("only realtime objects; forcing direct mode");
            double_buffer = false;
        }
        selection.profile.double_buffer = double_buffer;

        if double_buffer {
            let buffersize = selection.profile.buffersize.max(1);
            let buffers = (selection.profile.double_buffer_size / buffersize).max(1);
            self.pserver
                .set_buffer_defaults(buffers, buffersize, self.rate);
            if self.proxy_client_count() == 0 {
                debug!("switching endpoints to proxy mode");
                self.switch_to_proxy_mode();
            }
        } else if self.proxy_client_count() > 0 {
            debug!("switching endpoints to direct mode");
            self.switch_to_direct_mode();
        }

        self.active = Some(selection);
    }

    fn switch_to_proxy_mode(&mut self) {
        wrap_endpoints(&mut self.inputs, IoMode::Read, &mut self.pserver);
        wrap_endpoints(&mut self.outputs, IoMode::Write, &mut self.pserver);
    }

    fn switch_to_direct_mode(&mut self) {
        // Drop the server's clones first so the proxies hold the only
        // remaining references.
        self.pserver.clear_clients();
        unwrap_endpoints(&mut self.inputs);
        unwrap_endpoints(&mut self.outputs);
    }

    // --- lifecycle ---

    /// Open every endpoint, negotiate the sample rate, enable MIDI, and
    /// compute the processing length.
    ///
    /// On failure every endpoint opened by this call is closed again and
    /// the setup stays editable.
    pub fn enable(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Locked => {
                return Err(Error::InvariantViolation(
                    "cannot enable a locked chainsetup".into(),
                ))
            }
            LifecycleState::Enabled => return Ok(()),
            LifecycleState::Editable => {}
        }
        if !self.is_valid() {
            return Err(Error::InvariantViolation(format!(
                "chainsetup '{}' is not valid for enable \
                 (needs >= 1 input, output and connected chain)",
                self.name
            )));
        }

        self.select_and_enable_buffering();

        match self.enable_objects() {
            Ok(()) => {
                self.state = LifecycleState::Enabled;
                info!(name = %self.name, rate = self.rate, "chainsetup enabled");
                Ok(())
            }
            Err(e) => {
                warn!(name = %self.name, error = %e, "enable failed, rolling back");
                self.close_all_objects();
                if self.memory_locked {
                    mem::unlock_all_memory();
                    self.memory_locked = false;
                }
                Err(e)
            }
        }
    }

    fn enable_objects(&mut self) -> Result<()> {
        let buffersize = self
            .active
            .as_ref()
            .map(|s| s.profile.buffersize)
            .unwrap_or_else(|| self.buffersize());

        // Open inputs and adopt the common rate.
        let mut first_rate = 0u32;
        for ep in self.inputs.iter_mut() {
            let obj = ep.object_mut();
            obj.set_buffersize(buffersize);
            obj.open()?;
            if first_rate == 0 {
                first_rate = obj.format().rate;
            }
        }
        for ep in &self.inputs {
            let obj = ep.object();
            if obj.format().rate != first_rate {
                return Err(Error::SampleRateMismatch {
                    label: obj.label().to_string(),
                    expected: first_rate,
                    found: obj.format().rate,
                });
            }
        }
        self.rate = first_rate;

        // Propagate the rate to the outputs, then open and verify them.
        for ep in self.outputs.iter_mut() {
            let obj = ep.object_mut();
            if !obj.is_open() {
                let mut format = *obj.format();
                format.rate = first_rate;
                obj.set_format(format);
            }
            obj.set_buffersize(buffersize);
            obj.open()?;
            if obj.format().rate != first_rate {
                return Err(Error::SampleRateMismatch {
                    label: obj.label().to_string(),
                    expected: first_rate,
                    found: obj.format().rate,
                });
            }
        }

        // MIDI: enable the server and open devices non-blocking.
        if !self.midi_devices.is_empty() {
            for device in &self.midi_devices {
                let mut dev = device.lock();
                dev.set_nonblocking(true);
                dev.open()?;
                self.midi_server.register_device(Arc::clone(device));
            }
            self.midi_server.enable();
        }

        // Processing length: pinned, else longest finite input.
        self.length_in_samples = match self.length_secs {
            Some(secs) => Some((secs * first_rate as f64).round() as i64),
            None => {
                let max = self
                    .inputs
                    .iter()
                    .map(|e| e.object().length_in_samples())
                    .filter(|&l| l > 0)
                    .max();
                max
            }
        };
        self.position = 0;
        Ok(())
    }

    fn close_all_objects(&mut self) {
        if self.midi_server.is_enabled() {
            self.midi_server.disable();
        }
        self.midi_server.clear_devices();
        for device in &self.midi_devices {
            device.lock().close();
        }
        for ep in self.outputs.iter_mut() {
            let obj = ep.object_mut();
            if obj.is_open() {
                debug!(label = obj.label(), "closing endpoint");
                obj.close();
            }
        }
        for ep in self.inputs.iter_mut() {
            let obj = ep.object_mut();
            if obj.is_open() {
                debug!(label = obj.label(), "closing endpoint");
                obj.close();
            }
        }
    }

    /// The mirror of [`enable`](Self::enable): close MIDI, outputs and
    /// inputs, release the memory lock.
    pub fn disable(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Locked => Err(Error::InvariantViolation(
                "cannot disable a locked chainsetup".into(),
            )),
            LifecycleState::Editable => Ok(()),
            LifecycleState::Enabled => {
                info!(name = %self.name, "disabling chainsetup");
                self.pserver.stop();
                self.close_all_objects();
                if self.memory_locked {
                    mem::unlock_all_memory();
                    self.memory_locked = false;
                }
                self.state = LifecycleState::Editable;
                Ok(())
            }
        }
    }

    /// Interpret one option token (see [`crate::parse`] for the grammar).
    pub fn interpret_option(&mut self, token: &str) -> Result<()> {
        crate::parse::interpret_option(self, token)
    }

    /// Interpret a token sequence, pairing bare `-i` / `-o` arguments.
    pub fn interpret_options(&mut self, tokens: &[String]) -> Result<()> {
        crate::parse::interpret_options(self, tokens)
    }

    pub(crate) fn lock(&mut self) -> Result<()> {
        if self.state != LifecycleState::Enabled {
            return Err(Error::InvariantViolation(
                "engine start requires an enabled chainsetup".into(),
            ));
        }
        self.state = LifecycleState::Locked;
        Ok(())
    }

    pub(crate) fn unlock(&mut self) {
        if self.state == LifecycleState::Locked {
            self.state = LifecycleState::Enabled;
        }
    }
}

fn wrap_endpoints(eps: &mut Vec<Endpoint>, direction: IoMode, pserver: &mut ProxyServer) {
    let old = std::mem::take(eps);
    *eps = old
        .into_iter()
        .map(|ep| match ep {
            Endpoint::Direct(obj) if !obj.is_realtime() && !obj.is_loop_device() => {
                let shared = Arc::new(Mutex::new(obj));
                let ring = pserver.register_client(Arc::clone(&shared), direction);
                Endpoint::Buffered(BufferedProxy::new(shared, ring))
            }
            other => other,
        })
        .collect();
}

fn unwrap_endpoints(eps: &mut Vec<Endpoint>) {
    let old = std::mem::take(eps);
    *eps = old
        .into_iter()
        .map(|ep| match ep {
            Endpoint::Buffered(proxy) => {
                let shared = proxy.release();
                let object = Arc::try_unwrap(shared)
                    .ok()
                    .expect("proxied endpoint uniquely owned after unregister")
                    .into_inner();
                Endpoint::Direct(object)
            }
            direct => direct,
        })
        .collect();
}

impl Drop for Chainsetup {
    fn drop(&mut self) {
        if self.is_enabled() {
            self.state = LifecycleState::Enabled;
            let _ = self.disable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadena_core::Amplify;

    fn fresh(name: &str) -> Chainsetup {
        Chainsetup::new(name, Resources::defaults()).unwrap()
    }

    #[test]
    fn new_setup_is_editable_and_empty() {
        let cs = fresh("test");
        assert_eq!(cs.state(), LifecycleState::Editable);
        assert!(!cs.is_valid());
        assert_eq!(cs.buffersize(), 1024);
    }

    #[test]
    fn add_input_creates_default_chain() {
        let mut cs = fresh("test");
        cs.add_input("null").unwrap();
        assert_eq!(cs.chains().len(), 1);
        assert_eq!(cs.chains()[0].name(), "default");
        assert_eq!(cs.chains()[0].input(), Some(0));
    }

    #[test]
    fn duplicate_labels_share_a_slot() {
        let mut cs = fresh("test");
        cs.select_chains(&["a".into()]).unwrap();
        let first = cs.add_input("null").unwrap();
        cs.select_chains(&["b".into()]).unwrap();
        let second = cs.add_input("null").unwrap();
        assert_eq!(first, second);
        assert_eq!(cs.endpoints().0.len(), 1);
    }

    #[test]
    fn loop_devices_share_state_by_tag() {
        let mut cs = fresh("test");
        cs.select_chains(&["a".into()]).unwrap();
        cs.add_input("null").unwrap();
        cs.add_output("loop,1").unwrap();
        cs.select_chains(&["b".into()]).unwrap();
        cs.add_input("loop,1").unwrap();
        cs.add_output("null").unwrap();
        assert_eq!(cs.loop_blocks.len(), 1);
        // Both references appear as distinct endpoints over one block.
        assert_eq!(cs.endpoints().0.len(), 2);
        assert_eq!(cs.endpoints().1.len(), 2);
    }

    #[test]
    fn enable_requires_valid_graph() {
        let mut cs = fresh("test");
        assert!(matches!(
            cs.enable(),
            Err(Error::InvariantViolation(_))
        ));

        cs.add_input("null").unwrap();
        // Chain has no output yet.
        assert!(cs.enable().is_err());
        cs.add_output("null").unwrap();
        cs.enable().unwrap();
        assert!(cs.is_enabled());
        cs.disable().unwrap();
        assert_eq!(cs.state(), LifecycleState::Editable);
    }

    #[test]
    fn enable_twice_is_idempotent() {
        let mut cs = fresh("test");
        cs.add_input("null").unwrap();
        cs.add_output("null").unwrap();
        cs.enable().unwrap();
        cs.enable().unwrap();
        assert!(cs.is_enabled());
        cs.disable().unwrap();
        cs.enable().unwrap();
        assert!(cs.is_enabled());
    }

    #[test]
    fn topology_edits_refused_while_enabled() {
        let mut cs = fresh("test");
        cs.add_input("null").unwrap();
        cs.add_output("null").unwrap();
        cs.enable().unwrap();

        assert!(cs.add_chain("late").is_err());
        assert!(cs.add_input("rtnull").is_err());
        assert!(cs
            .add_operator_to("default", Box::new(Amplify::default()))
            .is_err());
    }

    #[test]
    fn rate_change_refused_while_locked() {
        let mut cs = fresh("test");
        cs.add_input("null").unwrap();
        cs.add_output("null").unwrap();
        cs.enable().unwrap();
        cs.lock().unwrap();
        assert!(cs.set_samples_per_second(96000).is_err());
        cs.unlock();
        assert!(cs.set_samples_per_second(96000).is_ok());
    }

    #[test]
    fn nonuniform_graph_gets_proxy_mode() {
        let mut cs = fresh("test");
        // Non-realtime input, realtime output: double-buffering applies.
        cs.add_input("null").unwrap();
        cs.add_output("rtnull").unwrap();
        cs.enable().unwrap();
        assert_eq!(cs.proxy_client_count(), 1);
        let (inputs, outputs) = cs.endpoints();
        assert!(inputs[0].is_buffered());
        assert!(!outputs[0].is_buffered());
        cs.disable().unwrap();
    }

    #[test]
    fn uniform_graph_stays_direct() {
        let mut cs = fresh("test");
        cs.add_input("null").unwrap();
        cs.add_output("null").unwrap();
        cs.enable().unwrap();
        assert_eq!(cs.proxy_client_count(), 0);
        assert!(!cs.active_selection().unwrap().profile.double_buffer);
        cs.disable().unwrap();
    }

    #[test]
    fn default_output_attaches_to_unbound_chains() {
        let mut cs = fresh("test");
        cs.add_input("null").unwrap();
        assert!(!cs.is_valid());
        cs.attach_default_output().unwrap();
        assert!(cs.is_valid());
        assert_eq!(cs.endpoints().1[0].object().label(), "null");
    }

    #[test]
    fn unknown_object_type_is_refused() {
        let mut cs = fresh("test");
        assert!(cs.add_input("file.xyz").is_err());
    }

    #[test]
    fn removing_an_input_reindexes_bindings() {
        let mut cs = fresh("test");
        cs.select_chains(&["a".into()]).unwrap();
        cs.add_input("null").unwrap();
        cs.select_chains(&["b".into()]).unwrap();
        cs.add_input("rtnull").unwrap();

        cs.remove_input(0).unwrap();
        let a = &cs.chains()[0];
        let b = &cs.chains()[1];
        assert_eq!(a.input(), None);
        assert_eq!(b.input(), Some(0));
        assert!(!a.is_initialized());

        assert!(cs.remove_input(5).is_err());
    }
}
