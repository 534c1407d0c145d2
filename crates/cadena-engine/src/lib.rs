//! Cadena Engine - the control plane of the Cadena audio framework.
//!
//! This crate ties the data plane (`cadena-core`) and the endpoint layer
//! (`cadena-io`) into runnable graphs:
//!
//! - [`Chainsetup`] — the editable graph of one run with its
//!   editable → enabled → locked lifecycle
//! - [`bmode`] — the buffering-mode selector and its parameter profiles
//! - [`Engine`] — the realtime cycle loop
//! - [`parse`] — the chainsetup text format (tokenizer, interpreter,
//!   serializer)
//! - [`MidiServer`] — the background MIDI polling worker
//! - [`Resources`] — string-keyed configuration defaults
//!
//! ```no_run
//! use cadena_engine::{parse_chainsetup, Engine, Resources};
//!
//! let text = "-a:1 -i:take.wav -ea:80 -o:mix.wav";
//! let mut setup = parse_chainsetup(text, Resources::defaults())?;
//! setup.enable()?;
//! let stats = Engine::new(&mut setup)?.run();
//! println!("{} cycles, {} xruns", stats.cycles, stats.xruns);
//! setup.disable()?;
//! # Ok::<(), cadena_engine::Error>(())
//! ```

pub mod bmode;
pub mod engine;
pub mod error;
pub mod mem;
pub mod midi;
pub mod parse;
pub mod resources;
pub mod setup;

pub use bmode::{
    select_buffering_mode, BufferingMode, BufferingProfile, GraphStats, ModeDefaults,
    ProfileOverrides, Selection, SelectorConfig,
};
pub use engine::{Engine, EngineCommand, EngineHandle, RunStats};
pub use error::{Error, Result};
pub use midi::{MidiBytes, MidiEndpoint, MidiServer, RawMidiDevice};
pub use parse::{parse_chainsetup, serialize, tokenize, ParseError};
pub use resources::{ResourceError, Resources};
pub use setup::{Chainsetup, Endpoint, LifecycleState};
