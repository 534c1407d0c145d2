//! The realtime cycle loop.
//!
//! One [`Engine`] borrows an enabled [`Chainsetup`] for the duration of a
//! run, locking its topology. Per cycle:
//!
//! 1. queued commands are applied (stop, deferred seeks, parameter edits);
//! 2. every chain's controllers tick;
//! 3. one block is read from every non-loop input;
//! 4. each chain copies its input block, runs its pipeline, and its result
//!    is mixed additively into its output's pending buffer;
//! 5. pending buffers are written, one write per output per cycle;
//! 6. the position advances and deferred seeks are applied.
//!
//! Outputs are zero-initialized each cycle, so chains sharing an output
//! sum. Loop-device inputs are read at dispatch time and loop outputs are
//! flushed as soon as their last feeding chain has run, so a reader chain
//! placed after the writer observes the same cycle's block.
//!
//! The loop itself is infallible: endpoint trouble marks streams finished
//! or counts xruns, and the run winds down by draining the proxy rings.

use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use cadena_core::SampleBuffer;

use crate::error::{Error, Result};
use crate::mem;
use crate::setup::{Chainsetup, Endpoint};

/// How long to wait for the proxy server to prime or drain rings.
const RING_WAIT: Duration = Duration::from_secs(5);
/// Depth of the command queue.
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Commands accepted while the engine runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineCommand {
    /// Stop at the next cycle boundary.
    Stop,
    /// Reposition every seekable endpoint at the end of the cycle.
    Seek(i64),
    /// Write one operator parameter at the next cycle boundary.
    SetParam {
        /// Chain index.
        chain: usize,
        /// Operator index within the chain.
        operator: usize,
        /// Parameter index within the operator.
        param: usize,
        /// New value.
        value: f64,
    },
}

/// Cloneable sender half of the engine command queue.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: Sender<EngineCommand>,
}

impl EngineHandle {
    /// Request a cooperative stop.
    pub fn stop(&self) {
        let _ = self.tx.try_send(EngineCommand::Stop);
    }

    /// Request a seek, applied at the end of the current cycle.
    pub fn seek(&self, position_in_samples: i64) {
        let _ = self.tx.try_send(EngineCommand::Seek(position_in_samples));
    }

    /// Queue a parameter edit for the next cycle boundary.
    pub fn set_param(&self, chain: usize, operator: usize, param: usize, value: f64) {
        let _ = self.tx.try_send(EngineCommand::SetParam {
            chain,
            operator,
            param,
            value,
        });
    }
}

/// Counters reported when a run finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Completed engine cycles.
    pub cycles: u64,
    /// Sample frames pushed to outputs.
    pub frames: u64,
    /// Xruns across all endpoints.
    pub xruns: u64,
}

/// The chain processor: owns the per-run scratch state and drives cycles.
pub struct Engine<'a> {
    setup: &'a mut Chainsetup,
    rx: Receiver<EngineCommand>,
    tx: Sender<EngineCommand>,
    /// One scratch block per input slot.
    input_blocks: Vec<SampleBuffer>,
    /// One pending mix buffer per output slot.
    pending: Vec<SampleBuffer>,
    /// Inputs that are loop pseudo-devices (read at dispatch time).
    loop_input: Vec<bool>,
    /// For loop outputs, the index of the last chain feeding them.
    loop_flush_after: Vec<Option<usize>>,
    blocksize: usize,
    running: bool,
    pending_seek: Option<i64>,
    stats: RunStats,
}

impl<'a> Engine<'a> {
    /// Lock `setup` and prepare per-run state.
    ///
    /// Fails when the setup is not enabled or a chain's controllers do not
    /// resolve; the setup is left enabled (not locked) on failure.
    pub fn new(setup: &'a mut Chainsetup) -> Result<Self> {
        setup.lock()?;
        let blocksize = setup
            .active_selection()
            .map(|s| s.profile.buffersize)
            .unwrap_or_else(|| setup.buffersize());
        let rate = setup.samples_per_second();

        let mut init = || -> Result<()> {
            for c in 0..setup.chains.len() {
                let input_index = setup.chains[c].input().ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "chain '{}' has no input",
                        setup.chains[c].name()
                    ))
                })?;
                let channels = setup.inputs[input_index].object().format().channels;
                setup.chains[c].init(channels, blocksize, rate)?;
            }
            Ok(())
        };
        if let Err(e) = init() {
            setup.unlock();
            return Err(e);
        }

        let input_blocks: Vec<SampleBuffer> = setup
            .inputs
            .iter()
            .map(|ep| SampleBuffer::new(ep.object().format().channels, blocksize, rate))
            .collect();
        let pending: Vec<SampleBuffer> = setup
            .outputs
            .iter()
            .map(|ep| SampleBuffer::new(ep.object().format().channels.max(1), blocksize, rate))
            .collect();
        let loop_input: Vec<bool> = setup
            .inputs
            .iter()
            .map(|ep| ep.object().is_loop_device())
            .collect();

        let mut loop_flush_after: Vec<Option<usize>> = setup
            .outputs
            .iter()
            .map(|ep| {
                if ep.object().is_loop_device() {
                    Some(0)
                } else {
                    None
                }
            })
            .collect();
        for (o, slot) in loop_flush_after.iter_mut().enumerate() {
            if slot.is_some() {
                let last = setup
                    .chains
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.output() == Some(o))
                    .map(|(i, _)| i)
                    .max();
                *slot = last;
            }
        }

        let (tx, rx) = bounded(COMMAND_QUEUE_DEPTH);
        info!(blocksize, rate, "engine initialized");
        Ok(Self {
            setup,
            rx,
            tx,
            input_blocks,
            pending,
            loop_input,
            loop_flush_after,
            blocksize,
            running: false,
            pending_seek: None,
            stats: RunStats::default(),
        })
    }

    /// A handle for stopping, seeking and live parameter edits.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.tx.clone(),
        }
    }

    /// Run until the streams finish or a stop is requested; returns the
    /// run counters. Never fails: per-cycle trouble is counted, not
    /// raised.
    pub fn run(mut self) -> RunStats {
        let profile = self
            .setup
            .active_selection()
            .map(|s| s.profile)
            .expect("engine runs over an enabled setup");

        if profile.raised_priority {
            mem::set_rt_priority(profile.sched_priority);
        }

        let buffered = self.setup.pserver.client_count() > 0;
        if buffered {
            self.setup.pserver.start();
            self.wait_for_prime();
        }

        info!("engine running");
        self.running = true;
        while self.running {
            self.cycle();
        }

        if buffered {
            self.drain_output_rings();
            self.setup.pserver.stop();
        }

        self.stats.xruns = self.collect_xruns();
        info!(
            cycles = self.stats.cycles,
            frames = self.stats.frames,
            xruns = self.stats.xruns,
            "engine finished"
        );
        self.stats
    }

    /// Block until every input ring is primed (full or finished).
    fn wait_for_prime(&self) {
        let deadline = Instant::now() + RING_WAIT;
        loop {
            let ready = self.setup.inputs.iter().all(|ep| match ep {
                Endpoint::Buffered(proxy) => {
                    proxy.ring().write_space() == 0 || proxy.ring().is_finished()
                }
                Endpoint::Direct(_) => true,
            });
            if ready {
                return;
            }
            if Instant::now() > deadline {
                warn!("proxy rings not primed within timeout, starting anyway");
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Block until every output ring has been drained by the server.
    fn drain_output_rings(&self) {
        let deadline = Instant::now() + RING_WAIT;
        loop {
            let drained = self.setup.outputs.iter().all(|ep| match ep {
                Endpoint::Buffered(proxy) => proxy.ring().read_space() == 0,
                Endpoint::Direct(_) => true,
            });
            if drained {
                return;
            }
            if Instant::now() > deadline {
                warn!("output rings not drained within timeout");
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn collect_xruns(&self) -> u64 {
        self.setup
            .inputs
            .iter()
            .chain(self.setup.outputs.iter())
            .map(|ep| ep.object().xruns())
            .sum()
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            match command {
                EngineCommand::Stop => {
                    debug!("stop requested");
                    self.running = false;
                }
                EngineCommand::Seek(pos) => {
                    self.pending_seek = Some(pos.max(0));
                }
                EngineCommand::SetParam {
                    chain,
                    operator,
                    param,
                    value,
                } => {
                    if let Some(chain) = self.setup.chains.get_mut(chain) {
                        if let Some(op) = chain.operator_mut(operator) {
                            op.set_param(param, value);
                        }
                    }
                }
            }
        }
    }

    fn apply_seek(&mut self, pos: i64) {
        debug!(pos, "applying deferred seek");
        for ep in self.setup.inputs.iter_mut() {
            let obj = ep.object_mut();
            if obj.supports_seeking() {
                obj.seek_position_in_samples(pos);
            }
        }
        for ep in self.setup.outputs.iter_mut() {
            let obj = ep.object_mut();
            if obj.supports_seeking() {
                obj.seek_position_in_samples(pos);
            }
        }
        self.setup.position = pos;
    }

    /// One pass of the dataflow. Updates `self.running` when the streams
    /// end.
    fn cycle(&mut self) {
        self.apply_commands();
        if !self.running {
            return;
        }

        let length = self.setup.length_in_samples;
        let position = self.setup.position;

        // Clamp the final block so finite runs end on the exact frame.
        let mut request = self.blocksize;
        if let Some(length) = length {
            let remaining = length - position;
            if remaining <= 0 {
                self.finish_or_loop();
                return;
            }
            request = request.min(remaining as usize);
        }

        // 1. Controllers tick before any processing for this cycle.
        let position_secs = position as f64 / self.setup.rate.max(1) as f64;
        for chain in self.setup.chains.iter_mut() {
            chain.controller_update(position_secs);
        }

        // 2. Read one block from every non-loop input.
        let mut cycle_frames = 0usize;
        let mut all_finished = true;
        for (i, ep) in self.setup.inputs.iter_mut().enumerate() {
            if self.loop_input[i] {
                all_finished = false;
                continue;
            }
            let obj = ep.object_mut();
            let block = &mut self.input_blocks[i];
            if obj.finished() {
                block.set_length_in_samples(0);
            } else {
                block.set_length_in_samples(request);
                obj.read_buffer(block);
                if block.frames() > request {
                    // A proxied ring hands back whole slots; trim so a
                    // pinned length ends on the exact frame.
                    block.set_length_in_samples(request);
                }
                if !obj.finished() || block.frames() > 0 {
                    all_finished = false;
                }
            }
            cycle_frames = cycle_frames.max(block.frames());
        }
        if self.loop_input.iter().all(|&is_loop| is_loop) {
            // Every input is a loop device; cycles are clocked by the
            // requested block size.
            cycle_frames = request;
        }

        if cycle_frames == 0 {
            if all_finished {
                self.finish_or_loop();
            }
            return;
        }

        // 3. Zero the pending output mixes for this cycle.
        for out in self.pending.iter_mut() {
            out.set_length_in_samples(cycle_frames);
            out.zero();
        }

        // 4. Dispatch chains in order, mixing into pending outputs.
        for c in 0..self.setup.chains.len() {
            let (input_index, output_index) = {
                let chain = &self.setup.chains[c];
                match (chain.input(), chain.output()) {
                    (Some(i), Some(o)) => (i, o),
                    _ => continue,
                }
            };

            if self.loop_input[input_index] {
                // Loop inputs are read at dispatch time so a block
                // published earlier this cycle is visible.
                let block = &mut self.input_blocks[input_index];
                block.set_length_in_samples(cycle_frames);
                self.setup.inputs[input_index]
                    .object_mut()
                    .read_buffer(block);
                block.set_length_in_samples(cycle_frames);
            }

            let chain = &mut self.setup.chains[c];
            chain.process(&self.input_blocks[input_index]);
            self.pending[output_index].add_from(chain.result());

            if self.loop_flush_after[output_index] == Some(c) {
                self.setup.outputs[output_index]
                    .object_mut()
                    .write_buffer(&self.pending[output_index]);
            }
        }

        // 5. Write every real output exactly once.
        for (o, ep) in self.setup.outputs.iter_mut().enumerate() {
            if self.loop_flush_after[o].is_some() {
                continue;
            }
            ep.object_mut().write_buffer(&self.pending[o]);
        }

        // 6. Advance, then apply a deferred seek.
        self.setup.position += cycle_frames as i64;
        self.stats.cycles += 1;
        self.stats.frames += cycle_frames as u64;

        if let Some(length) = length {
            if self.setup.position >= length {
                self.finish_or_loop();
            }
        }
        if let Some(pos) = self.pending_seek.take() {
            self.apply_seek(pos);
        }
    }

    /// End of stream: either restart from zero (looping) or stop.
    fn finish_or_loop(&mut self) {
        if self.setup.looping {
            debug!("end of stream, looping back to zero");
            self.apply_seek(0);
        } else {
            debug!("end of stream, draining complete");
            self.running = false;
        }
    }
}

impl Drop for Engine<'_> {
    fn drop(&mut self) {
        self.setup.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Resources;

    fn nullsetup() -> Chainsetup {
        let mut cs = Chainsetup::new("engine-test", Resources::defaults()).unwrap();
        cs.add_input("null").unwrap();
        cs.add_output("null").unwrap();
        cs
    }

    #[test]
    fn engine_requires_enabled_setup() {
        let mut cs = nullsetup();
        assert!(Engine::new(&mut cs).is_err());
    }

    #[test]
    fn engine_locks_and_unlocks_setup() {
        let mut cs = nullsetup();
        cs.enable().unwrap();
        {
            let engine = Engine::new(&mut cs).unwrap();
            let _ = engine.handle();
        }
        // Dropping the engine releases the lock.
        assert!(cs.is_enabled());
        assert!(!cs.is_locked());
        cs.disable().unwrap();
    }

    #[test]
    fn length_bounded_run_stops_by_itself() {
        let mut cs = nullsetup();
        cs.set_length_secs(1024.0 * 3.0 / 44100.0);
        cs.enable().unwrap();
        let engine = Engine::new(&mut cs).unwrap();
        let stats = engine.run();
        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.frames, 3 * 1024);
        assert_eq!(stats.xruns, 0);
    }

    #[test]
    fn stop_command_ends_an_infinite_run() {
        let mut cs = nullsetup();
        cs.enable().unwrap();
        let engine = Engine::new(&mut cs).unwrap();
        let handle = engine.handle();
        let stats = std::thread::scope(|s| {
            let worker = s.spawn(move || engine.run());
            std::thread::sleep(Duration::from_millis(50));
            handle.stop();
            worker.join().unwrap()
        });
        assert!(stats.cycles > 0);
    }

    #[test]
    fn queued_param_edit_lands_at_cycle_boundary() {
        use cadena_core::Amplify;

        let mut cs = nullsetup();
        cs.add_operator_to("default", Box::new(Amplify::new(100.0)))
            .unwrap();
        cs.set_length_secs(1024.0 * 2.0 / 44100.0);
        cs.enable().unwrap();
        let engine = Engine::new(&mut cs).unwrap();
        engine.handle().set_param(0, 0, 0, 42.0);
        engine.run();
        assert_eq!(cs.chains()[0].operator(0).unwrap().param(0), 42.0);
        cs.disable().unwrap();
    }
}
