//! Buffering-mode selection: picks one operating profile from the graph
//! topology, user pinning and per-field overrides.
//!
//! [`select_buffering_mode`] is a pure function: the same graph statistics
//! and configuration always produce the same mode and parameter set. The
//! resulting [`BufferingProfile`] is immutable for the duration of a run.

use std::str::FromStr;

use tracing::{debug, info};

use crate::error::Error;

/// The three operating profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingMode {
    /// Batch processing: big blocks, double-buffering, no deadlines.
    NonRt,
    /// Realtime with conservative buffering.
    Rt,
    /// Realtime with small blocks for minimum latency.
    RtLowLatency,
}

impl BufferingMode {
    /// Token used by `-B` and the resources file.
    pub const fn token(self) -> &'static str {
        match self {
            BufferingMode::NonRt => "nonrt",
            BufferingMode::Rt => "rt",
            BufferingMode::RtLowLatency => "rtlowlatency",
        }
    }
}

impl std::fmt::Display for BufferingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for BufferingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nonrt" => Ok(BufferingMode::NonRt),
            "rt" => Ok(BufferingMode::Rt),
            "rtlowlatency" => Ok(BufferingMode::RtLowLatency),
            other => Err(Error::InvariantViolation(format!(
                "unknown buffering mode '{other}'"
            ))),
        }
    }
}

/// The parameter set carried by one buffering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferingProfile {
    /// Engine block size in sample frames.
    pub buffersize: usize,
    /// Whether to raise scheduling priority and lock memory.
    pub raised_priority: bool,
    /// Scheduling priority when raised.
    pub sched_priority: i32,
    /// Whether devices should allocate maximum hardware buffering.
    pub max_buffers: bool,
    /// Whether non-realtime endpoints go through the proxy server.
    pub double_buffer: bool,
    /// Total double-buffer depth in sample frames.
    pub double_buffer_size: usize,
}

impl BufferingProfile {
    /// Parse the 6-field resource string
    /// `bufsize,raised,priority,maxbuffers,dbsize,db`.
    pub fn from_resource_str(s: &str) -> Result<Self, Error> {
        let fields: Vec<&str> = s.split(',').collect();
        if fields.len() != 6 {
            return Err(Error::InvariantViolation(format!(
                "buffering profile '{s}' needs 6 fields"
            )));
        }
        let parse_bool = |f: &str| f == "true";
        let buffersize = fields[0]
            .parse::<usize>()
            .map_err(|_| Error::InvariantViolation(format!("bad buffer size in '{s}'")))?;
        let sched_priority = fields[2]
            .parse::<i32>()
            .map_err(|_| Error::InvariantViolation(format!("bad priority in '{s}'")))?;
        let double_buffer_size = fields[4]
            .parse::<usize>()
            .map_err(|_| Error::InvariantViolation(format!("bad double-buffer size in '{s}'")))?;

        Ok(Self {
            buffersize,
            raised_priority: parse_bool(fields[1]),
            sched_priority,
            max_buffers: parse_bool(fields[3]),
            double_buffer: parse_bool(fields[5]),
            double_buffer_size,
        })
    }

    /// The inverse of [`from_resource_str`](Self::from_resource_str).
    pub fn to_resource_str(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.buffersize,
            self.raised_priority,
            self.sched_priority,
            self.max_buffers,
            self.double_buffer_size,
            self.double_buffer,
        )
    }
}

/// The per-mode default profiles, usually loaded from the resources map.
#[derive(Debug, Clone, Copy)]
pub struct ModeDefaults {
    /// Defaults for [`BufferingMode::NonRt`].
    pub nonrt: BufferingProfile,
    /// Defaults for [`BufferingMode::Rt`].
    pub rt: BufferingProfile,
    /// Defaults for [`BufferingMode::RtLowLatency`].
    pub rtlowlatency: BufferingProfile,
}

impl ModeDefaults {
    /// Profile for `mode`.
    pub fn profile(&self, mode: BufferingMode) -> BufferingProfile {
        match mode {
            BufferingMode::NonRt => self.nonrt,
            BufferingMode::Rt => self.rt,
            BufferingMode::RtLowLatency => self.rtlowlatency,
        }
    }
}

/// Per-field user overrides; a set field beats the mode default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileOverrides {
    /// `-b` block size.
    pub buffersize: Option<usize>,
    /// `-r` raised priority.
    pub raised_priority: Option<bool>,
    /// `-r:prio` scheduling priority.
    pub sched_priority: Option<i32>,
    /// Max-buffers toggle.
    pub max_buffers: Option<bool>,
    /// `-z:db` / `-z:nodb`.
    pub double_buffer: Option<bool>,
    /// `-z:db,size`.
    pub double_buffer_size: Option<usize>,
}

impl ProfileOverrides {
    fn apply(&self, mut profile: BufferingProfile) -> BufferingProfile {
        if let Some(v) = self.buffersize {
            profile.buffersize = v;
        }
        if let Some(v) = self.raised_priority {
            profile.raised_priority = v;
        }
        if let Some(v) = self.sched_priority {
            profile.sched_priority = v;
        }
        if let Some(v) = self.max_buffers {
            profile.max_buffers = v;
        }
        if let Some(v) = self.double_buffer {
            profile.double_buffer = v;
        }
        if let Some(v) = self.double_buffer_size {
            profile.double_buffer_size = v;
        }
        profile
    }
}

/// Graph topology facts the selector depends on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStats {
    /// Inputs whose timing is hardware-dictated.
    pub realtime_inputs: usize,
    /// Outputs whose timing is hardware-dictated.
    pub realtime_outputs: usize,
    /// Inputs that can be freely pre-read.
    pub nonrt_inputs: usize,
    /// Outputs that can be freely drained.
    pub nonrt_outputs: usize,
    /// Number of chains.
    pub chains: usize,
    /// Total operators across chains.
    pub operators: usize,
}

impl GraphStats {
    fn has_realtime(&self) -> bool {
        self.realtime_inputs > 0 || self.realtime_outputs > 0
    }
}

/// Configuration the selector merges with the graph statistics.
#[derive(Debug, Clone, Copy)]
pub struct SelectorConfig {
    /// Mode explicitly pinned by the user, if any.
    pub pinned: Option<BufferingMode>,
    /// Multitrack-mode override (`-z:multitrack` / `-z:nomultitrack`).
    pub multitrack_override: Option<bool>,
    /// Whether memory locking and FIFO scheduling are available.
    pub rt_caps: bool,
    /// Per-mode default profiles.
    pub defaults: ModeDefaults,
    /// Per-field user overrides.
    pub overrides: ProfileOverrides,
}

/// Outcome of a selection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// The chosen mode.
    pub mode: BufferingMode,
    /// Its effective parameter set after overrides.
    pub profile: BufferingProfile,
    /// Whether multitrack operation was inferred or forced on.
    pub multitrack: bool,
}

/// Pick the active buffering mode and parameters.
///
/// Rules are evaluated top-down, first match wins:
///
/// 1. an explicitly pinned mode is used as-is;
/// 2. multitrack is inferred when the graph mixes realtime and
///    non-realtime endpoints on both sides and runs more than one chain
///    (unless overridden either way);
/// 3. no realtime endpoint → `nonrt`;
/// 4. multitrack → `rt`;
/// 5. realtime scheduling unavailable → `rt` with raised priority dropped;
/// 6. no operators and one-way realtime → `rt`;
/// 7. otherwise → `rtlowlatency`.
pub fn select_buffering_mode(stats: GraphStats, config: &SelectorConfig) -> Selection {
    let multitrack = match config.multitrack_override {
        Some(forced) => forced,
        None => {
            stats.realtime_inputs > 0
                && stats.realtime_outputs > 0
                && stats.nonrt_inputs > 0
                && stats.nonrt_outputs > 0
                && stats.chains > 1
        }
    };
    if multitrack {
        info!("multitrack mode enabled");
    }

    let mut drop_raised = false;
    let mode = if let Some(pinned) = config.pinned {
        debug!(%pinned, "buffering mode pinned by user");
        pinned
    } else if !stats.has_realtime() {
        debug!("bmode selection: no realtime endpoints");
        BufferingMode::NonRt
    } else if multitrack {
        debug!("bmode selection: multitrack graph");
        BufferingMode::Rt
    } else if !config.rt_caps {
        debug!("bmode selection: no realtime scheduling capabilities");
        drop_raised = true;
        BufferingMode::Rt
    } else if stats.operators == 0
        && (stats.realtime_inputs == 0 || stats.realtime_outputs == 0)
    {
        debug!("bmode selection: one-way realtime graph without operators");
        BufferingMode::Rt
    } else {
        debug!("bmode selection: realtime low-latency default");
        BufferingMode::RtLowLatency
    };

    let mut profile = config.overrides.apply(config.defaults.profile(mode));
    if drop_raised {
        profile.raised_priority = false;
    }
    info!(%mode, ?profile, "buffering mode selected");

    Selection {
        mode,
        profile,
        multitrack,
    }
}
