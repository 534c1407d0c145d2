//! Audio format description: sample rate, channel layout and PCM encoding.
//!
//! [`AudioFormat`] is fixed while an endpoint is open. The text form used by
//! the chainsetup format is `encoding,channels,rate[,i|n]`, e.g.
//! `s16_le,2,44100,i`. Bare bit widths (`8`, `16`, `24`, `32`) are accepted
//! as shorthand for the little-endian signed encoding of that width (`8`
//! maps to `u8`, matching historical usage).

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// PCM sample encoding used on the wire (files, devices).
///
/// Internally all audio is carried as floating point; these encodings only
/// matter at the import/export boundary of
/// [`SampleBuffer`](crate::SampleBuffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    /// Unsigned 8-bit.
    U8,
    /// Signed 8-bit.
    S8,
    /// Signed 16-bit little-endian.
    S16Le,
    /// Signed 16-bit big-endian.
    S16Be,
    /// Signed 24-bit little-endian (packed, 3 bytes).
    S24Le,
    /// Signed 24-bit big-endian (packed, 3 bytes).
    S24Be,
    /// Signed 32-bit little-endian.
    S32Le,
    /// Signed 32-bit big-endian.
    S32Be,
    /// IEEE 754 32-bit float little-endian.
    F32Le,
}

impl SampleEncoding {
    /// Size of one sample of this encoding in bytes.
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            SampleEncoding::U8 | SampleEncoding::S8 => 1,
            SampleEncoding::S16Le | SampleEncoding::S16Be => 2,
            SampleEncoding::S24Le | SampleEncoding::S24Be => 3,
            SampleEncoding::S32Le | SampleEncoding::S32Be | SampleEncoding::F32Le => 4,
        }
    }

    /// Significant bits per sample.
    pub const fn bits(self) -> u32 {
        match self {
            SampleEncoding::U8 | SampleEncoding::S8 => 8,
            SampleEncoding::S16Le | SampleEncoding::S16Be => 16,
            SampleEncoding::S24Le | SampleEncoding::S24Be => 24,
            SampleEncoding::S32Le | SampleEncoding::S32Be | SampleEncoding::F32Le => 32,
        }
    }

    /// Canonical token used in the chainsetup text format.
    pub const fn token(self) -> &'static str {
        match self {
            SampleEncoding::U8 => "u8",
            SampleEncoding::S8 => "s8",
            SampleEncoding::S16Le => "s16_le",
            SampleEncoding::S16Be => "s16_be",
            SampleEncoding::S24Le => "s24_le",
            SampleEncoding::S24Be => "s24_be",
            SampleEncoding::S32Le => "s32_le",
            SampleEncoding::S32Be => "s32_be",
            SampleEncoding::F32Le => "f32_le",
        }
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for SampleEncoding {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let enc = match s {
            "u8" | "8" => SampleEncoding::U8,
            "s8" => SampleEncoding::S8,
            "s16_le" | "s16" | "16" => SampleEncoding::S16Le,
            "s16_be" => SampleEncoding::S16Be,
            "s24_le" | "s24" | "24" => SampleEncoding::S24Le,
            "s24_be" => SampleEncoding::S24Be,
            "s32_le" | "s32" | "32" => SampleEncoding::S32Le,
            "s32_be" => SampleEncoding::S32Be,
            "f32_le" | "f32" => SampleEncoding::F32Le,
            other => return Err(FormatParseError::UnknownEncoding(other.to_string())),
        };
        Ok(enc)
    }
}

/// Error parsing an [`AudioFormat`] or [`SampleEncoding`] from its text form.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatParseError {
    /// The encoding token is not recognized.
    #[error("unknown sample encoding '{0}'")]
    UnknownEncoding(String),

    /// A numeric field failed to parse or was zero.
    #[error("invalid {field} '{value}' in audio format")]
    InvalidField {
        /// Which field was invalid (`channels` or `rate`).
        field: &'static str,
        /// The offending token.
        value: String,
    },

    /// The interleaving flag was not `i` or `n`.
    #[error("invalid interleaving flag '{0}' (expected 'i' or 'n')")]
    InvalidInterleaving(String),

    /// Wrong number of comma-separated fields.
    #[error("audio format needs 3 or 4 fields, got {0}")]
    FieldCount(usize),
}

/// Sample rate, channel count, encoding and interleaving of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Samples per second per channel.
    pub rate: u32,
    /// Number of channels.
    pub channels: usize,
    /// Wire encoding.
    pub encoding: SampleEncoding,
    /// Whether samples are interleaved on the wire.
    pub interleaved: bool,
}

impl AudioFormat {
    /// Create a format; `rate` and `channels` must be positive.
    pub fn new(encoding: SampleEncoding, channels: usize, rate: u32) -> Self {
        debug_assert!(rate > 0 && channels > 0);
        Self {
            rate,
            channels,
            encoding,
            interleaved: true,
        }
    }

    /// Bytes in one frame (one sample per channel).
    pub const fn frame_size(&self) -> usize {
        self.encoding.bytes_per_sample() * self.channels
    }
}

impl Default for AudioFormat {
    /// CD-style default: `s16_le,2,44100,i`.
    fn default() -> Self {
        AudioFormat::new(SampleEncoding::S16Le, 2, 44100)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.encoding,
            self.channels,
            self.rate,
            if self.interleaved { "i" } else { "n" }
        )
    }
}

impl FromStr for AudioFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').collect();
        if fields.len() != 3 && fields.len() != 4 {
            return Err(FormatParseError::FieldCount(fields.len()));
        }

        let encoding: SampleEncoding = fields[0].parse()?;
        let channels: usize =
            fields[1]
                .parse()
                .ok()
                .filter(|&c| c > 0)
                .ok_or_else(|| FormatParseError::InvalidField {
                    field: "channels",
                    value: fields[1].to_string(),
                })?;
        let rate: u32 =
            fields[2]
                .parse()
                .ok()
                .filter(|&r| r > 0)
                .ok_or_else(|| FormatParseError::InvalidField {
                    field: "rate",
                    value: fields[2].to_string(),
                })?;

        let interleaved = match fields.get(3) {
            None | Some(&"i") => true,
            Some(&"n") => false,
            Some(other) => return Err(FormatParseError::InvalidInterleaving(other.to_string())),
        };

        Ok(AudioFormat {
            rate,
            channels,
            encoding,
            interleaved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_sizes() {
        assert_eq!(SampleEncoding::U8.bytes_per_sample(), 1);
        assert_eq!(SampleEncoding::S16Le.bytes_per_sample(), 2);
        assert_eq!(SampleEncoding::S24Be.bytes_per_sample(), 3);
        assert_eq!(SampleEncoding::S32Le.bytes_per_sample(), 4);
        assert_eq!(SampleEncoding::F32Le.bytes_per_sample(), 4);
    }

    #[test]
    fn format_display_parse_roundtrip() {
        let fmt = AudioFormat::new(SampleEncoding::S24Be, 4, 96000);
        let text = fmt.to_string();
        assert_eq!(text, "s24_be,4,96000,i");
        assert_eq!(text.parse::<AudioFormat>().unwrap(), fmt);
    }

    #[test]
    fn format_parse_shorthand_bits() {
        let fmt: AudioFormat = "16,2,44100".parse().unwrap();
        assert_eq!(fmt.encoding, SampleEncoding::S16Le);
        assert_eq!(fmt.channels, 2);
        assert_eq!(fmt.rate, 44100);
        assert!(fmt.interleaved);
    }

    #[test]
    fn format_parse_noninterleaved() {
        let fmt: AudioFormat = "f32_le,1,48000,n".parse().unwrap();
        assert!(!fmt.interleaved);
    }

    #[test]
    fn format_parse_rejects_bad_fields() {
        assert!("s16_le,0,44100".parse::<AudioFormat>().is_err());
        assert!("s16_le,2,0".parse::<AudioFormat>().is_err());
        assert!("s16_le,2,44100,x".parse::<AudioFormat>().is_err());
        assert!("pdp11,2,44100".parse::<AudioFormat>().is_err());
        assert!("s16_le,2".parse::<AudioFormat>().is_err());
    }

    #[test]
    fn frame_size() {
        assert_eq!(AudioFormat::default().frame_size(), 4);
        assert_eq!(AudioFormat::new(SampleEncoding::S24Le, 3, 48000).frame_size(), 9);
    }
}
