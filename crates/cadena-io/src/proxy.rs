//! The proxy buffer subsystem: bounded rings of sample blocks between
//! non-realtime endpoints and the engine, serviced by one background
//! worker.
//!
//! Three pieces:
//!
//! - [`ProxyRing`] — a single-producer/single-consumer ring of
//!   [`SampleBuffer`] slots with free-running atomic indices. For an input
//!   the server produces and the engine consumes; for an output the roles
//!   swap.
//! - [`ProxyServer`] — the worker. It scans every registered client, moves
//!   one block per ring per pass, and sleeps 50 ms when no ring advanced.
//! - [`BufferedProxy`] — the [`AudioObject`] adaptor the engine sees. An
//!   empty ring on read (or full ring on write) falls back to synchronous
//!   I/O on the underlying endpoint and counts one xrun.
//!
//! The ring indices advance monotonically and wrap modulo the slot count;
//! `read_space + write_space == buffercount` always holds.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cadena_core::{AudioFormat, SampleBuffer};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::object::{AudioObject, IoMode, SharedAudioObject};
use crate::Result;

/// Slots allocated per client when no defaults are set.
pub const BUFFERCOUNT_DEFAULT: usize = 32;
/// Frames per slot when no defaults are set.
pub const BUFFERSIZE_DEFAULT: usize = 1024;
/// How long the worker sleeps when every ring is full/empty.
const IDLE_SLEEP: Duration = Duration::from_millis(50);

/// A bounded SPSC ring of sample blocks.
///
/// Exactly one thread may call the produce side and one the consume side.
/// The indices are free-running; slot access wraps modulo the capacity.
pub struct ProxyRing {
    slots: Vec<UnsafeCell<SampleBuffer>>,
    readptr: AtomicUsize,
    writeptr: AtomicUsize,
    finished: AtomicBool,
    direction: IoMode,
}

// SAFETY: slot contents are only touched through `produce` / `consume`.
// The producer only accesses the slot at `writeptr` while `write_space > 0`
// and the consumer only the slot at `readptr` while `read_space > 0`;
// under the SPSC discipline those are never the same slot, and the
// acquire/release index updates order the handoff.
unsafe impl Sync for ProxyRing {}

impl ProxyRing {
    /// A ring of `buffercount` slots of `frames × channels` samples.
    pub fn new(
        buffercount: usize,
        channels: usize,
        frames: usize,
        rate: u32,
        direction: IoMode,
    ) -> Self {
        assert!(buffercount > 0, "ring needs at least one slot");
        let slots = (0..buffercount)
            .map(|_| UnsafeCell::new(SampleBuffer::new(channels, frames, rate)))
            .collect();
        Self {
            slots,
            readptr: AtomicUsize::new(0),
            writeptr: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            direction,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Direction of the client this ring buffers.
    pub fn direction(&self) -> IoMode {
        self.direction
    }

    /// Blocks queued and ready to consume.
    pub fn read_space(&self) -> usize {
        self.writeptr
            .load(Ordering::Acquire)
            .wrapping_sub(self.readptr.load(Ordering::Acquire))
    }

    /// Free slots available to produce into.
    pub fn write_space(&self) -> usize {
        self.capacity() - self.read_space()
    }

    /// Whether the producing side has reported end of stream. Queued
    /// blocks stay readable after this flips.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Mark end of stream.
    pub fn set_finished(&self, value: bool) {
        self.finished.store(value, Ordering::Release);
    }

    /// Fill the next free slot. Returns `false` without calling `f` when
    /// the ring is full. Producer side only.
    pub fn produce(&self, f: impl FnOnce(&mut SampleBuffer)) -> bool {
        if self.write_space() == 0 {
            return false;
        }
        let index = self.writeptr.load(Ordering::Relaxed) % self.capacity();
        // SAFETY: see the Sync impl; this slot is exclusively the
        // producer's while write_space > 0.
        f(unsafe { &mut *self.slots[index].get() });
        self.writeptr.fetch_add(1, Ordering::Release);
        true
    }

    /// Drain the next queued slot. Returns `false` without calling `f`
    /// when the ring is empty. Consumer side only.
    pub fn consume(&self, f: impl FnOnce(&mut SampleBuffer)) -> bool {
        if self.read_space() == 0 {
            return false;
        }
        let index = self.readptr.load(Ordering::Relaxed) % self.capacity();
        // SAFETY: see the Sync impl; this slot is exclusively the
        // consumer's while read_space > 0.
        f(unsafe { &mut *self.slots[index].get() });
        self.readptr.fetch_add(1, Ordering::Release);
        true
    }

    /// Discard every queued block and clear the finished flag.
    ///
    /// Both sides must be quiescent (the server stopped); used when a
    /// proxied endpoint seeks.
    pub fn flush(&self) {
        self.readptr
            .store(self.writeptr.load(Ordering::Acquire), Ordering::Release);
        self.finished.store(false, Ordering::Release);
    }
}

struct Client {
    endpoint: SharedAudioObject,
    ring: Arc<ProxyRing>,
}

struct ServerState {
    running: AtomicBool,
    stop_request: AtomicBool,
    exit_request: AtomicBool,
    full: AtomicBool,
    clients: Mutex<Vec<Client>>,
}

/// The background worker serving every buffered endpoint.
///
/// Control follows the original three-flag protocol: `start` and `stop`
/// toggle processing without touching the rings, `exit` is terminal and
/// joins the worker. Both stop and exit requests are observed within one
/// idle sleep interval.
pub struct ProxyServer {
    state: Arc<ServerState>,
    handle: Option<thread::JoinHandle<()>>,
    buffercount: usize,
    buffersize: usize,
    rate: u32,
}

impl ProxyServer {
    /// A server with default ring geometry and no clients.
    pub fn new() -> Self {
        Self {
            state: Arc::new(ServerState {
                running: AtomicBool::new(false),
                stop_request: AtomicBool::new(false),
                exit_request: AtomicBool::new(false),
                full: AtomicBool::new(false),
                clients: Mutex::new(Vec::new()),
            }),
            handle: None,
            buffercount: BUFFERCOUNT_DEFAULT,
            buffersize: BUFFERSIZE_DEFAULT,
            rate: 44100,
        }
    }

    /// Set the ring geometry used for subsequently registered clients.
    pub fn set_buffer_defaults(&mut self, buffers: usize, frames: usize, rate: u32) {
        self.buffercount = buffers.max(1);
        self.buffersize = frames.max(1);
        self.rate = rate;
    }

    /// Register an endpoint; returns the ring the engine side drives.
    pub fn register_client(&mut self, endpoint: SharedAudioObject, direction: IoMode) -> Arc<ProxyRing> {
        let channels = endpoint.lock().format().channels.max(1);
        let ring = Arc::new(ProxyRing::new(
            self.buffercount,
            channels,
            self.buffersize,
            self.rate,
            direction,
        ));
        debug!(
            buffers = self.buffercount,
            frames = self.buffersize,
            ?direction,
            "registering proxy client"
        );
        self.state.clients.lock().push(Client {
            endpoint,
            ring: Arc::clone(&ring),
        });
        ring
    }

    /// Drop every registered client and its ring.
    pub fn clear_clients(&mut self) {
        self.state.clients.lock().clear();
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.state.clients.lock().len()
    }

    /// Start (or resume) processing; spawns the worker on first use.
    pub fn start(&mut self) {
        if self.handle.is_none() {
            let state = Arc::clone(&self.state);
            self.handle = Some(
                thread::Builder::new()
                    .name("cadena-proxy".to_string())
                    .spawn(move || io_thread(state))
                    .expect("spawning proxy server thread"),
            );
        }
        self.state.stop_request.store(false, Ordering::Release);
        self.state.running.store(true, Ordering::Release);
        debug!("proxy server started");
    }

    /// Pause processing; rings keep their contents.
    pub fn stop(&self) {
        self.state.stop_request.store(true, Ordering::Release);
        debug!("proxy server stop requested");
    }

    /// Whether the worker is processing.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Whether the last scan moved no blocks: every input ring was full
    /// and every output ring empty.
    pub fn is_full(&self) -> bool {
        self.state.full.load(Ordering::Acquire)
    }

    /// Terminal shutdown: request exit and join the worker.
    pub fn exit(&mut self) {
        self.state.stop_request.store(true, Ordering::Release);
        self.state.exit_request.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("proxy server thread panicked");
            }
        }
        self.state.running.store(false, Ordering::Release);
    }
}

impl Default for ProxyServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.exit();
    }
}

fn io_thread(state: Arc<ServerState>) {
    debug!("proxy server worker up");
    loop {
        if state.exit_request.load(Ordering::Acquire) {
            break;
        }
        if !state.running.load(Ordering::Acquire) {
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        let mut processed = 0;
        {
            let clients = state.clients.lock();
            for client in clients.iter() {
                let ring = &client.ring;
                if ring.is_finished() {
                    continue;
                }
                match ring.direction() {
                    IoMode::Read => {
                        // Producer side: pre-read one block from the input.
                        if ring.write_space() > 0 {
                            let mut endpoint = client.endpoint.lock();
                            ring.produce(|slot| {
                                slot.set_length_in_samples(slot.capacity());
                                endpoint.read_buffer(slot);
                            });
                            if endpoint.finished() {
                                ring.set_finished(true);
                            }
                            processed += 1;
                        }
                    }
                    IoMode::Write | IoMode::ReadWrite => {
                        // Consumer side: drain one block to the output.
                        if ring.read_space() > 0 {
                            let mut endpoint = client.endpoint.lock();
                            ring.consume(|slot| endpoint.write_buffer(slot));
                            processed += 1;
                        }
                    }
                }
            }
        }

        if state.stop_request.swap(false, Ordering::AcqRel) {
            state.running.store(false, Ordering::Release);
        }
        state.full.store(processed == 0, Ordering::Release);
        if processed == 0 {
            thread::sleep(IDLE_SLEEP);
        }
    }
    debug!("proxy server worker exiting");
}

/// The engine-facing adaptor over a buffered endpoint.
///
/// Reads and writes go through the ring; when the ring cannot serve a
/// block the adaptor falls back to synchronous I/O on the underlying
/// endpoint and counts one xrun. Lifecycle calls delegate to the
/// underlying endpoint.
pub struct BufferedProxy {
    label: String,
    mode: IoMode,
    format: AudioFormat,
    buffersize: usize,
    ring: Arc<ProxyRing>,
    inner: SharedAudioObject,
    xruns: u64,
    finished: bool,
}

impl BufferedProxy {
    /// Wrap `inner`, exchanging blocks through `ring`.
    pub fn new(inner: SharedAudioObject, ring: Arc<ProxyRing>) -> Self {
        let (label, mode, format, buffersize) = {
            let ep = inner.lock();
            (
                format!("buffered => {}", ep.label()),
                ep.io_mode(),
                *ep.format(),
                ep.buffersize(),
            )
        };
        Self {
            label,
            mode,
            format,
            buffersize,
            ring,
            inner,
            xruns: 0,
            finished: false,
        }
    }

    /// Hand back the shared endpoint for a switch to direct mode.
    pub fn release(self) -> SharedAudioObject {
        self.inner
    }

    /// The ring this adaptor drives.
    pub fn ring(&self) -> &Arc<ProxyRing> {
        &self.ring
    }
}

impl AudioObject for BufferedProxy {
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
        self.inner.lock().set_format(format);
    }

    fn set_buffersize(&mut self, frames: usize) {
        self.buffersize = frames;
        self.inner.lock().set_buffersize(frames);
    }

    fn buffersize(&self) -> usize {
        self.buffersize
    }

    fn open(&mut self) -> Result<()> {
        let mut ep = self.inner.lock();
        ep.open()?;
        self.format = *ep.format();
        self.finished = false;
        // Stale blocks and the finished flag from a previous run would
        // otherwise end the next run immediately. The server is paused
        // whenever endpoints are opened.
        self.ring.flush();
        Ok(())
    }

    fn close(&mut self) {
        self.inner.lock().close();
    }

    fn is_open(&self) -> bool {
        self.inner.lock().is_open()
    }

    fn read_buffer(&mut self, buf: &mut SampleBuffer) -> usize {
        if self.ring.consume(|slot| buf.copy_from(slot)) {
            if buf.frames() == 0 {
                self.finished = true;
            }
            return buf.frames();
        }
        if self.ring.is_finished() {
            // The server delivered everything and saw end of stream.
            self.finished = true;
            buf.set_length_in_samples(0);
            return 0;
        }
        // Ring starved: synchronous fallback, one xrun.
        self.xruns += 1;
        let mut ep = self.inner.lock();
        let frames = ep.read_buffer(buf);
        if ep.finished() {
            self.finished = true;
        }
        frames
    }

    fn write_buffer(&mut self, buf: &SampleBuffer) {
        if !self.ring.produce(|slot| slot.copy_from(buf)) {
            // Ring saturated: synchronous fallback, one xrun.
            self.xruns += 1;
            self.inner.lock().write_buffer(buf);
        }
    }

    fn position_in_samples(&self) -> i64 {
        self.inner.lock().position_in_samples()
    }

    fn length_in_samples(&self) -> i64 {
        self.inner.lock().length_in_samples()
    }

    fn supports_seeking(&self) -> bool {
        self.inner.lock().supports_seeking()
    }

    fn seek_position_in_samples(&mut self, pos: i64) {
        // In-flight blocks are stale after a reposition.
        self.ring.flush();
        self.inner.lock().seek_position_in_samples(pos);
        self.finished = false;
    }

    fn finished(&self) -> bool {
        self.finished
    }

    fn xruns(&self) -> u64 {
        self.xruns
    }
}
