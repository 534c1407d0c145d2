//! The unit of data flow: a planar block of floating-point samples.
//!
//! A [`SampleBuffer`] holds `channels × frames` samples as per-channel
//! arrays. Buffers are reused across engine cycles: shrinking the frame
//! count never reallocates, and growing only reallocates past the high-water
//! capacity. Import/export converts between the internal float
//! representation and the wire encodings of
//! [`SampleEncoding`](crate::SampleEncoding).
//!
//! Samples are `f64` internally so that every integer PCM encoding up to
//! 32 bits survives an import/export round trip bit-exactly.

use crate::format::SampleEncoding;

/// Internal sample type.
pub type Sample = f64;

/// Upper bound of the nominal sample range.
pub const SAMPLE_MAX: Sample = 1.0;
/// Lower bound of the nominal sample range.
pub const SAMPLE_MIN: Sample = -1.0;

/// A mutable block of planar audio samples.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    /// One `Vec<Sample>` per channel, each kept at `capacity` length.
    data: Vec<Vec<Sample>>,
    /// Valid frames; always `<= capacity`.
    frames: usize,
    /// Allocated frames per channel.
    capacity: usize,
    /// Sample rate the block was produced at.
    rate: u32,
}

impl SampleBuffer {
    /// Allocate a buffer of `channels × frames` zeroed samples.
    pub fn new(channels: usize, frames: usize, rate: u32) -> Self {
        Self {
            data: vec![vec![0.0; frames]; channels],
            frames,
            capacity: frames,
            rate,
        }
    }

    /// Number of channels.
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.data.len()
    }

    /// Valid frames in the block.
    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Allocated frames per channel (high-water mark).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sample rate of the block.
    #[inline]
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Set the sample rate tag (does not resample).
    pub fn set_rate(&mut self, rate: u32) {
        self.rate = rate;
    }

    /// Samples of one channel, limited to the valid frame count.
    #[inline]
    pub fn channel(&self, index: usize) -> &[Sample] {
        &self.data[index][..self.frames]
    }

    /// Mutable samples of one channel.
    #[inline]
    pub fn channel_mut(&mut self, index: usize) -> &mut [Sample] {
        &mut self.data[index][..self.frames]
    }

    /// Resize the channel layout. New channels start silent.
    pub fn set_channel_count(&mut self, channels: usize) {
        if channels < self.data.len() {
            self.data.truncate(channels);
        } else {
            while self.data.len() < channels {
                self.data.push(vec![0.0; self.capacity]);
            }
        }
    }

    /// Resize the valid frame count.
    ///
    /// Growing past the current capacity reallocates; shrinking only moves
    /// the length marker, so the engine can cut the final block of a finite
    /// stream short without touching the allocator.
    pub fn set_length_in_samples(&mut self, frames: usize) {
        if frames > self.capacity {
            for ch in &mut self.data {
                ch.resize(frames, 0.0);
            }
            self.capacity = frames;
        }
        self.frames = frames;
    }

    /// Deep-copy samples and metadata from `other`.
    pub fn copy_from(&mut self, other: &SampleBuffer) {
        self.set_channel_count(other.channel_count());
        self.set_length_in_samples(other.frames());
        self.rate = other.rate;
        for (dst, src) in self.data.iter_mut().zip(&other.data) {
            dst[..other.frames].copy_from_slice(&src[..other.frames]);
        }
    }

    /// Mix `other` into this buffer with saturating addition.
    ///
    /// Channel `k` of `other` lands on channel `k % self.channel_count()`,
    /// so a wide chain folds down onto a narrow sink and a mono chain feeds
    /// every sink channel it maps to. Sums clamp to the nominal range.
    pub fn add_from(&mut self, other: &SampleBuffer) {
        let dst_channels = self.channel_count();
        if dst_channels == 0 {
            return;
        }
        let frames = self.frames.min(other.frames());
        for (k, src) in other.data.iter().enumerate() {
            let dst = &mut self.data[k % dst_channels];
            for i in 0..frames {
                dst[i] = (dst[i] + src[i]).clamp(SAMPLE_MIN, SAMPLE_MAX);
            }
        }
    }

    /// Scale every sample by `factor`.
    pub fn mul(&mut self, factor: Sample) {
        for ch in &mut self.data {
            for s in &mut ch[..self.frames] {
                *s *= factor;
            }
        }
    }

    /// Overwrite the valid region with silence.
    pub fn zero(&mut self) {
        for ch in &mut self.data {
            for s in &mut ch[..self.frames] {
                *s = 0.0;
            }
        }
    }

    /// Clamp every sample to the nominal range.
    pub fn limit_values(&mut self) {
        for ch in &mut self.data {
            for s in &mut ch[..self.frames] {
                *s = s.clamp(SAMPLE_MIN, SAMPLE_MAX);
            }
        }
    }

    /// Decode interleaved wire data into this buffer.
    ///
    /// The channel count stays as configured; the frame count becomes
    /// `bytes.len() / frame_size`. Trailing bytes that do not fill a whole
    /// frame are ignored.
    pub fn import_interleaved(&mut self, bytes: &[u8], encoding: SampleEncoding) {
        let channels = self.channel_count();
        if channels == 0 {
            return;
        }
        let bps = encoding.bytes_per_sample();
        let frames = bytes.len() / (bps * channels);
        self.set_length_in_samples(frames);

        for frame in 0..frames {
            for ch in 0..channels {
                let off = (frame * channels + ch) * bps;
                self.data[ch][frame] = decode_sample(&bytes[off..off + bps], encoding);
            }
        }
    }

    /// Encode the valid region as interleaved wire data, appending to `out`.
    ///
    /// Values outside the nominal range clamp to the integer extremes.
    pub fn export_interleaved(&self, encoding: SampleEncoding, out: &mut Vec<u8>) {
        let channels = self.channel_count();
        out.reserve(self.frames * channels * encoding.bytes_per_sample());
        for frame in 0..self.frames {
            for ch in 0..channels {
                encode_sample(self.data[ch][frame], encoding, out);
            }
        }
    }
}

#[inline]
fn decode_sample(bytes: &[u8], encoding: SampleEncoding) -> Sample {
    match encoding {
        SampleEncoding::U8 => (bytes[0] as Sample - 128.0) / 128.0,
        SampleEncoding::S8 => bytes[0] as i8 as Sample / 128.0,
        SampleEncoding::S16Le => i16::from_le_bytes([bytes[0], bytes[1]]) as Sample / 32768.0,
        SampleEncoding::S16Be => i16::from_be_bytes([bytes[0], bytes[1]]) as Sample / 32768.0,
        SampleEncoding::S24Le => {
            let v = (bytes[0] as i32) | ((bytes[1] as i32) << 8) | ((bytes[2] as i8 as i32) << 16);
            v as Sample / 8_388_608.0
        }
        SampleEncoding::S24Be => {
            let v = (bytes[2] as i32) | ((bytes[1] as i32) << 8) | ((bytes[0] as i8 as i32) << 16);
            v as Sample / 8_388_608.0
        }
        SampleEncoding::S32Le => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as Sample / 2_147_483_648.0
        }
        SampleEncoding::S32Be => {
            i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as Sample / 2_147_483_648.0
        }
        SampleEncoding::F32Le => {
            f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as Sample
        }
    }
}

#[inline]
fn encode_sample(value: Sample, encoding: SampleEncoding, out: &mut Vec<u8>) {
    match encoding {
        SampleEncoding::U8 => {
            let v = ((value * 128.0).round() + 128.0).clamp(0.0, 255.0) as u8;
            out.push(v);
        }
        SampleEncoding::S8 => {
            let v = (value * 128.0).round().clamp(-128.0, 127.0) as i8;
            out.push(v as u8);
        }
        SampleEncoding::S16Le => {
            let v = (value * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        SampleEncoding::S16Be => {
            let v = (value * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
            out.extend_from_slice(&v.to_be_bytes());
        }
        SampleEncoding::S24Le => {
            let v = (value * 8_388_608.0)
                .round()
                .clamp(-8_388_608.0, 8_388_607.0) as i32;
            out.extend_from_slice(&v.to_le_bytes()[..3]);
        }
        SampleEncoding::S24Be => {
            let v = (value * 8_388_608.0)
                .round()
                .clamp(-8_388_608.0, 8_388_607.0) as i32;
            let b = v.to_be_bytes();
            out.extend_from_slice(&b[1..4]);
        }
        SampleEncoding::S32Le => {
            let v = (value * 2_147_483_648.0)
                .round()
                .clamp(-2_147_483_648.0, 2_147_483_647.0) as i32;
            out.extend_from_slice(&v.to_le_bytes());
        }
        SampleEncoding::S32Be => {
            let v = (value * 2_147_483_648.0)
                .round()
                .clamp(-2_147_483_648.0, 2_147_483_647.0) as i32;
            out.extend_from_slice(&v.to_be_bytes());
        }
        SampleEncoding::F32Le => {
            out.extend_from_slice(&(value as f32).to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ENCODINGS: [SampleEncoding; 9] = [
        SampleEncoding::U8,
        SampleEncoding::S8,
        SampleEncoding::S16Le,
        SampleEncoding::S16Be,
        SampleEncoding::S24Le,
        SampleEncoding::S24Be,
        SampleEncoding::S32Le,
        SampleEncoding::S32Be,
        SampleEncoding::F32Le,
    ];

    #[test]
    fn shrink_never_reallocates() {
        let mut buf = SampleBuffer::new(2, 1024, 44100);
        buf.set_length_in_samples(100);
        assert_eq!(buf.frames(), 100);
        assert_eq!(buf.capacity(), 1024);
        buf.set_length_in_samples(1024);
        assert_eq!(buf.capacity(), 1024);
    }

    #[test]
    fn grow_extends_capacity() {
        let mut buf = SampleBuffer::new(1, 16, 44100);
        buf.set_length_in_samples(64);
        assert_eq!(buf.frames(), 64);
        assert_eq!(buf.capacity(), 64);
    }

    #[test]
    fn new_channels_are_silent() {
        let mut buf = SampleBuffer::new(1, 8, 44100);
        buf.channel_mut(0).fill(0.5);
        buf.set_channel_count(3);
        assert!(buf.channel(1).iter().all(|&s| s == 0.0));
        assert!(buf.channel(2).iter().all(|&s| s == 0.0));
        assert!(buf.channel(0).iter().all(|&s| s == 0.5));
    }

    #[test]
    fn copy_from_matches() {
        let mut a = SampleBuffer::new(2, 4, 48000);
        a.channel_mut(0).copy_from_slice(&[0.1, 0.2, 0.3, 0.4]);
        a.channel_mut(1).copy_from_slice(&[-0.1, -0.2, -0.3, -0.4]);

        let mut b = SampleBuffer::new(1, 1, 44100);
        b.copy_from(&a);
        assert_eq!(b.channel_count(), 2);
        assert_eq!(b.frames(), 4);
        assert_eq!(b.rate(), 48000);
        assert_eq!(b.channel(0), a.channel(0));
        assert_eq!(b.channel(1), a.channel(1));
    }

    #[test]
    fn add_from_sums_and_saturates() {
        let mut out = SampleBuffer::new(1, 3, 44100);
        out.channel_mut(0).copy_from_slice(&[0.5, 0.9, -0.9]);

        let mut other = SampleBuffer::new(1, 3, 44100);
        other.channel_mut(0).copy_from_slice(&[0.25, 0.5, -0.5]);

        out.add_from(&other);
        assert_eq!(out.channel(0), &[0.75, 1.0, -1.0]);
    }

    #[test]
    fn add_from_wraps_channels() {
        // Stereo chain into mono sink: both chain channels land on channel 0.
        let mut out = SampleBuffer::new(1, 2, 44100);
        let mut chain = SampleBuffer::new(2, 2, 44100);
        chain.channel_mut(0).copy_from_slice(&[0.25, 0.25]);
        chain.channel_mut(1).copy_from_slice(&[0.25, 0.5]);

        out.add_from(&chain);
        assert_eq!(out.channel(0), &[0.5, 0.75]);
    }

    #[test]
    fn mul_zero_limit() {
        let mut buf = SampleBuffer::new(1, 3, 44100);
        buf.channel_mut(0).copy_from_slice(&[0.5, -0.25, 1.0]);
        buf.mul(4.0);
        assert_eq!(buf.channel(0), &[2.0, -1.0, 4.0]);
        buf.limit_values();
        assert_eq!(buf.channel(0), &[1.0, -1.0, 1.0]);
        buf.zero();
        assert_eq!(buf.channel(0), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn integer_roundtrips_are_bit_exact() {
        // Exercise the full range of each integer encoding via export∘import.
        for enc in ALL_ENCODINGS {
            if enc == SampleEncoding::F32Le {
                continue;
            }
            let bps = enc.bytes_per_sample();
            // A spread of raw frames covering extremes and mid-range values.
            let mut bytes = Vec::new();
            for pattern in [0x00u8, 0x7f, 0x80, 0xff, 0x01, 0xfe] {
                bytes.extend(std::iter::repeat(pattern).take(bps * 2));
            }

            let mut buf = SampleBuffer::new(2, 0, 44100);
            buf.import_interleaved(&bytes, enc);

            let mut back = Vec::new();
            buf.export_interleaved(enc, &mut back);
            assert_eq!(back, bytes, "round trip failed for {enc}");
        }
    }

    #[test]
    fn f32_roundtrip_is_exact() {
        let samples: Vec<f32> = (0..64).map(|i| ((i as f32) * 0.13).sin()).collect();
        let mut bytes = Vec::new();
        for s in &samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }

        let mut buf = SampleBuffer::new(1, 0, 44100);
        buf.import_interleaved(&bytes, SampleEncoding::F32Le);

        let mut back = Vec::new();
        buf.export_interleaved(SampleEncoding::F32Le, &mut back);
        assert_eq!(back, bytes);
    }

    #[test]
    fn out_of_range_clamps_on_integer_export() {
        let mut buf = SampleBuffer::new(1, 2, 44100);
        buf.channel_mut(0).copy_from_slice(&[1.5, -1.5]);

        let mut bytes = Vec::new();
        buf.export_interleaved(SampleEncoding::S16Le, &mut bytes);
        assert_eq!(
            bytes,
            [32767i16.to_le_bytes(), (-32768i16).to_le_bytes()].concat()
        );
    }

    #[test]
    fn import_ignores_partial_trailing_frame() {
        let mut buf = SampleBuffer::new(2, 0, 44100);
        // 2 channels × s16 = 4 bytes per frame; 6 bytes = 1 frame + trailing junk.
        buf.import_interleaved(&[0, 0, 0, 0, 1, 2], SampleEncoding::S16Le);
        assert_eq!(buf.frames(), 1);
    }
}
