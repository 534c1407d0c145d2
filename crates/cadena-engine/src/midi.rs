//! MIDI endpoints and the background MIDI server.
//!
//! The server follows the same worker discipline as the proxy buffer
//! server: one thread, cooperative stop/exit flags observed within a
//! sleep interval, all blocking I/O kept off the engine thread. Received
//! bytes are fanned out over a bounded channel; the engine never touches
//! MIDI devices directly.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use cadena_io::{IoError, Result as IoResult};

/// How long the worker sleeps between polls.
const POLL_SLEEP: Duration = Duration::from_millis(10);
/// Depth of the event fan-out channel.
const EVENT_QUEUE_DEPTH: usize = 256;

/// A raw MIDI byte sequence read in one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiBytes {
    /// Index of the producing device.
    pub device: usize,
    /// The raw bytes.
    pub bytes: Vec<u8>,
}

/// A MIDI endpoint: opened non-blocking and polled by the server.
pub trait MidiEndpoint: Send {
    /// Device identity, e.g. `rawmidi,/dev/midi`.
    fn label(&self) -> &str;

    /// Open the device. Idempotent.
    fn open(&mut self) -> IoResult<()>;

    /// Close the device. Idempotent.
    fn close(&mut self);

    /// Whether the device is open.
    fn is_open(&self) -> bool;

    /// Request non-blocking reads. Must be set before `open`.
    fn set_nonblocking(&mut self, on: bool);

    /// Read whatever bytes are pending into `out`; returns the count.
    /// Never blocks when non-blocking mode is on.
    fn poll(&mut self, out: &mut Vec<u8>) -> usize;
}

/// A raw MIDI device file (`/dev/midi*`, `/dev/snd/midi*`).
pub struct RawMidiDevice {
    label: String,
    path: std::path::PathBuf,
    file: Option<std::fs::File>,
    nonblocking: bool,
}

impl RawMidiDevice {
    /// Device backed by `path`.
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        let path = path.into();
        Self {
            label: format!("rawmidi,{}", path.display()),
            path,
            file: None,
            nonblocking: false,
        }
    }
}

impl MidiEndpoint for RawMidiDevice {
    fn label(&self) -> &str {
        &self.label
    }

    fn open(&mut self) -> IoResult<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let mut options = std::fs::OpenOptions::new();
        options.read(true);
        #[cfg(unix)]
        if self.nonblocking {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_NONBLOCK);
        }
        let file = options.open(&self.path).map_err(|source| IoError::File {
            label: self.label.clone(),
            source,
        })?;
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn set_nonblocking(&mut self, on: bool) {
        self.nonblocking = on;
    }

    fn poll(&mut self, out: &mut Vec<u8>) -> usize {
        let Some(file) = self.file.as_mut() else {
            return 0;
        };
        let mut chunk = [0u8; 64];
        match file.read(&mut chunk) {
            Ok(n) => {
                out.extend_from_slice(&chunk[..n]);
                n
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                warn!(label = %self.label, error = %e, "midi read failed");
                0
            }
        }
    }
}

/// A MIDI endpoint shared with the server thread.
pub type SharedMidiEndpoint = Arc<Mutex<Box<dyn MidiEndpoint>>>;

struct ServerState {
    running: AtomicBool,
    exit_request: AtomicBool,
    devices: Mutex<Vec<SharedMidiEndpoint>>,
    tx: Sender<MidiBytes>,
}

/// The background MIDI polling worker.
pub struct MidiServer {
    state: Arc<ServerState>,
    rx: Receiver<MidiBytes>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MidiServer {
    /// A server with no devices, not yet running.
    pub fn new() -> Self {
        let (tx, rx) = bounded(EVENT_QUEUE_DEPTH);
        Self {
            state: Arc::new(ServerState {
                running: AtomicBool::new(false),
                exit_request: AtomicBool::new(false),
                devices: Mutex::new(Vec::new()),
                tx,
            }),
            rx,
            handle: None,
        }
    }

    /// Attach a device the worker will poll.
    pub fn register_device(&mut self, device: SharedMidiEndpoint) {
        self.state.devices.lock().push(device);
    }

    /// Drop every registered device.
    pub fn clear_devices(&mut self) {
        self.state.devices.lock().clear();
    }

    /// Receiver for incoming bytes; clone freely.
    pub fn events(&self) -> Receiver<MidiBytes> {
        self.rx.clone()
    }

    /// Whether the worker is polling.
    pub fn is_enabled(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Start polling; spawns the worker on first use.
    pub fn enable(&mut self) {
        if self.handle.is_none() {
            let state = Arc::clone(&self.state);
            self.handle = Some(
                thread::Builder::new()
                    .name("cadena-midi".to_string())
                    .spawn(move || poll_thread(state))
                    .expect("spawning midi server thread"),
            );
        }
        self.state.running.store(true, Ordering::Release);
        debug!("midi server enabled");
    }

    /// Pause polling; devices stay registered.
    pub fn disable(&mut self) {
        self.state.running.store(false, Ordering::Release);
        debug!("midi server disabled");
    }

    /// Terminal shutdown: join the worker.
    pub fn exit(&mut self) {
        self.state.running.store(false, Ordering::Release);
        self.state.exit_request.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("midi server thread panicked");
            }
        }
    }
}

impl Default for MidiServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MidiServer {
    fn drop(&mut self) {
        self.exit();
    }
}

fn poll_thread(state: Arc<ServerState>) {
    debug!("midi server worker up");
    let mut scratch = Vec::with_capacity(64);
    loop {
        if state.exit_request.load(Ordering::Acquire) {
            break;
        }
        if !state.running.load(Ordering::Acquire) {
            thread::sleep(POLL_SLEEP);
            continue;
        }

        {
            let devices = state.devices.lock();
            for (index, device) in devices.iter().enumerate() {
                scratch.clear();
                let got = device.lock().poll(&mut scratch);
                if got == 0 {
                    continue;
                }
                let event = MidiBytes {
                    device: index,
                    bytes: scratch.clone(),
                };
                match state.tx.try_send(event) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Disconnected(_)) => return,
                }
            }
        }
        thread::sleep(POLL_SLEEP);
    }
    debug!("midi server worker exiting");
}
