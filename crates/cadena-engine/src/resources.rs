//! The resources map: string-keyed defaults consumed by the chainsetup.
//!
//! Compiled-in defaults cover every recognized key; a TOML file of
//! `key = "value"` pairs can override them. The chainsetup reads these at
//! construction; nothing else in the engine touches the file system for
//! configuration.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

/// Recognized resource keys.
pub const DEFAULT_AUDIO_FORMAT: &str = "default-audio-format";
/// Output attached when a chainsetup names none.
pub const DEFAULT_OUTPUT: &str = "default-output";
/// Whether endpoints should insist on exact sample rates.
pub const DEFAULT_PRECISE_SAMPLE_RATES: &str = "default-to-precise-sample-rates";
/// Buffering parameters for the `nonrt` mode.
pub const BMODE_DEFAULTS_NONRT: &str = "bmode-defaults-nonrt";
/// Buffering parameters for the `rt` mode.
pub const BMODE_DEFAULTS_RT: &str = "bmode-defaults-rt";
/// Buffering parameters for the `rtlowlatency` mode.
pub const BMODE_DEFAULTS_RTLOWLATENCY: &str = "bmode-defaults-rtlowlatency";
/// Default MIDI device.
pub const MIDI_DEVICE: &str = "midi-device";

/// Error loading a resources file.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The file could not be read.
    #[error("cannot read resources file '{path}': {source}")]
    Read {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not a flat TOML table of strings.
    #[error("cannot parse resources file '{path}': {source}")]
    Toml {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
}

/// String-keyed configuration defaults.
#[derive(Debug, Clone)]
pub struct Resources {
    values: BTreeMap<String, String>,
}

impl Resources {
    /// The compiled-in defaults.
    pub fn defaults() -> Self {
        let mut values = BTreeMap::new();
        let mut set = |k: &str, v: &str| values.insert(k.to_string(), v.to_string());
        set(DEFAULT_AUDIO_FORMAT, "s16_le,2,44100,i");
        set(DEFAULT_OUTPUT, "null");
        set(DEFAULT_PRECISE_SAMPLE_RATES, "false");
        set(BMODE_DEFAULTS_NONRT, "1024,true,50,true,100000,true");
        set(BMODE_DEFAULTS_RT, "1024,true,50,true,100000,true");
        set(BMODE_DEFAULTS_RTLOWLATENCY, "256,true,50,true,100000,false");
        set(MIDI_DEVICE, "rawmidi,/dev/midi");
        Self { values }
    }

    /// Defaults overlaid with `key = "value"` pairs from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ResourceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ResourceError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let overrides: BTreeMap<String, String> =
            toml::from_str(&text).map_err(|source| ResourceError::Toml {
                path: path.display().to_string(),
                source,
            })?;

        let mut resources = Self::defaults();
        resources.values.extend(overrides);
        Ok(resources)
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Look up a key, falling back to `default`.
    pub fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Interpret a key as a boolean; unknown keys and values read false.
    pub fn boolean(&self, key: &str) -> bool {
        matches!(self.get(key), Some("true") | Some("yes") | Some("1"))
    }

    /// Set a key programmatically.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl Default for Resources {
    fn default() -> Self {
        Self::defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_cover_recognized_keys() {
        let r = Resources::defaults();
        assert_eq!(r.get(DEFAULT_OUTPUT), Some("null"));
        assert_eq!(r.get(BMODE_DEFAULTS_RTLOWLATENCY), Some("256,true,50,true,100000,false"));
        assert!(!r.boolean(DEFAULT_PRECISE_SAMPLE_RATES));
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default-output = \"out.wav\"").unwrap();
        writeln!(file, "default-to-precise-sample-rates = \"true\"").unwrap();

        let r = Resources::from_file(file.path()).unwrap();
        assert_eq!(r.get(DEFAULT_OUTPUT), Some("out.wav"));
        assert!(r.boolean(DEFAULT_PRECISE_SAMPLE_RATES));
        // Untouched keys keep their defaults.
        assert_eq!(r.get(BMODE_DEFAULTS_RT), Some("1024,true,50,true,100000,true"));
    }

    #[test]
    fn missing_file_errors() {
        assert!(matches!(
            Resources::from_file("/nonexistent/cadenarc.toml"),
            Err(ResourceError::Read { .. })
        ));
    }
}
