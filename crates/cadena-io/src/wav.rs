//! WAV file endpoints backed by hound.
//!
//! [`WavSource`] streams a RIFF/WAVE file one block at a time and supports
//! sample-accurate seeking; [`WavSink`] creates a file and appends blocks.
//! Supported encodings are the little-endian WAV family: u8, s16, s24, s32
//! integer PCM and f32 float. Big-endian and s8 encodings are refused at
//! open time.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use cadena_core::{AudioFormat, SampleBuffer, SampleEncoding};
use hound::{SampleFormat, WavReader, WavWriter};
use tracing::warn;

use crate::object::{AudioObject, IoMode, LENGTH_UNKNOWN};
use crate::{IoError, Result};

fn encoding_from_spec(label: &str, spec: hound::WavSpec) -> Result<SampleEncoding> {
    match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 8) => Ok(SampleEncoding::U8),
        (SampleFormat::Int, 16) => Ok(SampleEncoding::S16Le),
        (SampleFormat::Int, 24) => Ok(SampleEncoding::S24Le),
        (SampleFormat::Int, 32) => Ok(SampleEncoding::S32Le),
        (SampleFormat::Float, 32) => Ok(SampleEncoding::F32Le),
        _ => Err(IoError::UnsupportedEncoding {
            label: label.to_string(),
            encoding: format!("{:?}, {} bits", spec.sample_format, spec.bits_per_sample),
        }),
    }
}

fn spec_from_format(label: &str, format: &AudioFormat) -> Result<hound::WavSpec> {
    let (bits, sample_format) = match format.encoding {
        SampleEncoding::U8 => (8, SampleFormat::Int),
        SampleEncoding::S16Le => (16, SampleFormat::Int),
        SampleEncoding::S24Le => (24, SampleFormat::Int),
        SampleEncoding::S32Le => (32, SampleFormat::Int),
        SampleEncoding::F32Le => (32, SampleFormat::Float),
        other => {
            return Err(IoError::UnsupportedEncoding {
                label: label.to_string(),
                encoding: other.to_string(),
            })
        }
    };
    Ok(hound::WavSpec {
        channels: format.channels as u16,
        sample_rate: format.rate,
        bits_per_sample: bits,
        sample_format,
    })
}

/// A WAV file input.
pub struct WavSource {
    label: String,
    path: PathBuf,
    format: AudioFormat,
    buffersize: usize,
    reader: Option<WavReader<BufReader<File>>>,
    position: i64,
    length: i64,
    finished: bool,
}

impl WavSource {
    /// Create a source for `path`. The format is read from the file header
    /// at open time.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            label: path.display().to_string(),
            path,
            format: AudioFormat::default(),
            buffersize: 0,
            reader: None,
            position: 0,
            length: LENGTH_UNKNOWN,
            finished: false,
        }
    }
}

impl AudioObject for WavSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn io_mode(&self) -> IoMode {
        IoMode::Read
    }

    fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn set_format(&mut self, format: AudioFormat) {
        self.format = format;
    }

    fn set_buffersize(&mut self, frames: usize) {
        self.buffersize = frames;
    }

    fn buffersize(&self) -> usize {
        self.buffersize
    }

    fn open(&mut self) -> Result<()> {
        if self.reader.is_some() {
            return Ok(());
        }
        let reader = WavReader::open(&self.path).map_err(|e| match e {
            hound::Error::IoError(source) => IoError::File {
                label: self.label.clone(),
                source,
            },
            other => IoError::Wav {
                label: self.label.clone(),
                source: other,
            },
        })?;

        let spec = reader.spec();
        let encoding = encoding_from_spec(&self.label, spec)?;
        self.format = AudioFormat::new(encoding, spec.channels as usize, spec.sample_rate);
        self.length = reader.duration() as i64;
        self.position = 0;
        self.finished = false;
        self.reader = Some(reader);
        Ok(())
    }

    fn close(&mut self) {
        self.reader = None;
    }

    fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    fn read_buffer(&mut self, buf: &mut SampleBuffer) -> usize {
        let requested = buf.frames();
        let channels = self.format.channels;
        buf.set_channel_count(channels);
        buf.set_rate(self.format.rate);

        let Some(reader) = self.reader.as_mut() else {
            buf.set_length_in_samples(0);
            return 0;
        };

        let scale = (1i64 << (self.format.encoding.bits() - 1)) as f64;
        let float = self.format.encoding == SampleEncoding::F32Le;

        let mut frames_read = 0;
        'frames: for frame in 0..requested {
            for ch in 0..channels {
                // hound centres 8-bit data, so integer samples of every
                // width normalize by the same power-of-two scale.
                let sample = if float {
                    reader
                        .samples::<f32>()
                        .next()
                        .map(|r| r.map(|v| v as f64))
                } else {
                    reader
                        .samples::<i32>()
                        .next()
                        .map(|r| r.map(|v| v as f64 / scale))
                };
                match sample {
                    Some(Ok(v)) => buf.channel_mut(ch)[frame] = v,
                    Some(Err(e)) => {
                        warn!(label = %self.label, error = %e, "wav read failed mid-stream");
                        self.finished = true;
                        break 'frames;
                    }
                    None => break 'frames,
                }
            }
            frames_read += 1;
        }

        buf.set_length_in_samples(frames_read);
        self.position += frames_read as i64;
        if frames_read < requested {
            self.finished = true;
        }
        frames_read
    }

    fn write_buffer(&mut self, _buf: &SampleBuffer) {
        debug_assert!(false, "write on a read-only wav source");
    }

    fn position_in_samples(&self) -> i64 {
        self.position
    }

    fn length_in_samples(&self) -> i64 {
        self.length
    }

    fn supports_seeking(&self) -> bool {
        true
    }

    fn seek_position_in_samples(&mut self, pos: i64) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        let pos = pos.clamp(0, self.length.max(0));
        if reader.seek(pos as u32).is_ok() {
            self.position = pos;
            self.finished = false;
        } else {
            warn!(label = %self.label, pos, "wav seek failed");
        }
    }

    fn finished(&self) -> bool {
        self.finished
    }
}

/// A WAV file output.
pub struct WavSink {
    label: String,
    path: PathBuf,
    format: AudioFormat,
    buffersize: usize,
    writer: Option<WavWriter<BufWriter<File>>>,
    position: i64,
}

impl WavSink {
    /// Create a sink writing to `path` with `format`. The file is created
    /// (truncating any existing one) at open time.
    pub fn new(path: impl Into<PathBuf>, format: AudioFormat) -> Self {
        let path = path.into();
        Self {
            label: path.display().to_string(),
            path,
            format,
            buffersize: 0,
            writer: None,
            position: 0,
        }
    }
}

impl AudioObject for WavSink {
    fn label(&self) -> &str {
        &self.label
    }

    fn io_mode(&self) -> IoMode {
        IoMode::Write
    }

    fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn set_format(&mut self, format: AudioFormat) {
        self.format = format;
    }

    fn set_buffersize(&mut self, frames: usize) {
        self.buffersize = frames;
    }

    fn buffersize(&self) -> usize {
        self.buffersize
    }

    fn open(&mut self) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        let spec = spec_from_format(&self.label, &self.format)?;
        let writer = WavWriter::create(&self.path, spec).map_err(|e| match e {
            hound::Error::IoError(source) => IoError::File {
                label: self.label.clone(),
                source,
            },
            other => IoError::Wav {
                label: self.label.clone(),
                source: other,
            },
        })?;
        self.writer = Some(writer);
        self.position = 0;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                warn!(label = %self.label, error = %e, "wav finalize failed");
            }
        }
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    fn read_buffer(&mut self, buf: &mut SampleBuffer) -> usize {
        debug_assert!(false, "read on a write-only wav sink");
        buf.set_length_in_samples(0);
        0
    }

    fn write_buffer(&mut self, buf: &SampleBuffer) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if buf.channel_count() == 0 {
            return;
        }
        let channels = self.format.channels;
        let scale = (1i64 << (self.format.encoding.bits() - 1)) as f64;

        let mut failed = false;
        for frame in 0..buf.frames() {
            for ch in 0..channels {
                // A narrow chain feeding a wide sink repeats its channels.
                let v = buf.channel(ch % buf.channel_count())[frame];
                let res = match self.format.encoding {
                    SampleEncoding::F32Le => writer.write_sample(v as f32),
                    SampleEncoding::U8 => {
                        let q = (v * 128.0).round().clamp(-128.0, 127.0) as i8;
                        writer.write_sample(q)
                    }
                    SampleEncoding::S16Le => {
                        let q = (v * scale).round().clamp(-scale, scale - 1.0) as i16;
                        writer.write_sample(q)
                    }
                    _ => {
                        let q = (v * scale).round().clamp(-scale, scale - 1.0) as i32;
                        writer.write_sample(q)
                    }
                };
                if let Err(e) = res {
                    warn!(label = %self.label, error = %e, "wav write failed");
                    failed = true;
                    break;
                }
            }
            if failed {
                break;
            }
        }
        if !failed {
            self.position += buf.frames() as i64;
        }
    }

    fn position_in_samples(&self) -> i64 {
        self.position
    }

    fn length_in_samples(&self) -> i64 {
        self.position
    }

    fn seek_position_in_samples(&mut self, _pos: i64) {
        // Sinks are append-only.
    }

    fn finished(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sine(frames: usize) -> Vec<f64> {
        (0..frames)
            .map(|i| (i as f64 * 0.05).sin() * 0.8)
            .collect()
    }

    #[test]
    fn sink_then_source_roundtrip_s16() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rt.wav");
        let format = AudioFormat::new(SampleEncoding::S16Le, 1, 44100);

        let data = sine(300);
        let mut sink = WavSink::new(&path, format);
        sink.open().unwrap();
        let mut buf = SampleBuffer::new(1, 300, 44100);
        buf.channel_mut(0).copy_from_slice(&data);
        sink.write_buffer(&buf);
        assert_eq!(sink.position_in_samples(), 300);
        sink.close();

        let mut source = WavSource::new(&path);
        source.open().unwrap();
        assert_eq!(source.length_in_samples(), 300);
        assert_eq!(source.format().rate, 44100);

        let mut read = SampleBuffer::new(1, 300, 44100);
        assert_eq!(source.read_buffer(&mut read), 300);
        for (a, b) in data.iter().zip(read.channel(0)) {
            assert!((a - b).abs() < 1.0 / 32768.0);
        }
    }

    #[test]
    fn source_reports_finished_on_short_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.wav");
        let format = AudioFormat::new(SampleEncoding::S16Le, 2, 44100);

        let mut sink = WavSink::new(&path, format);
        sink.open().unwrap();
        sink.write_buffer(&SampleBuffer::new(2, 100, 44100));
        sink.close();

        let mut source = WavSource::new(&path);
        source.open().unwrap();
        let mut buf = SampleBuffer::new(2, 256, 44100);
        assert_eq!(source.read_buffer(&mut buf), 100);
        assert_eq!(buf.frames(), 100);
        assert!(source.finished());

        buf.set_length_in_samples(256);
        assert_eq!(source.read_buffer(&mut buf), 0);
    }

    #[test]
    fn source_seek_repositions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seek.wav");
        let format = AudioFormat::new(SampleEncoding::F32Le, 1, 48000);

        let mut sink = WavSink::new(&path, format);
        sink.open().unwrap();
        let mut buf = SampleBuffer::new(1, 64, 48000);
        for (i, s) in buf.channel_mut(0).iter_mut().enumerate() {
            *s = i as f64 / 64.0;
        }
        sink.write_buffer(&buf);
        sink.close();

        let mut source = WavSource::new(&path);
        source.open().unwrap();
        let mut read = SampleBuffer::new(1, 16, 48000);
        source.read_buffer(&mut read);
        assert_eq!(source.position_in_samples(), 16);

        source.seek_position_in_samples(32);
        assert_eq!(source.position_in_samples(), 32);
        read.set_length_in_samples(16);
        source.read_buffer(&mut read);
        assert!((read.channel(0)[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn missing_file_is_a_setup_error() {
        let mut source = WavSource::new("/nonexistent/path/nope.wav");
        assert!(matches!(source.open(), Err(IoError::File { .. })));
    }

    #[test]
    fn sink_rejects_big_endian() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("be.wav");
        let format = AudioFormat::new(SampleEncoding::S16Be, 2, 44100);
        let mut sink = WavSink::new(&path, format);
        assert!(matches!(
            sink.open(),
            Err(IoError::UnsupportedEncoding { .. })
        ));
    }

    #[test]
    fn open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("idem.wav");
        let format = AudioFormat::new(SampleEncoding::S16Le, 1, 44100);
        let mut sink = WavSink::new(&path, format);
        sink.open().unwrap();
        sink.open().unwrap();
        sink.close();
        sink.close();
    }
}
