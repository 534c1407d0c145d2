//! Property-based tests for the sample buffer conversion layer.
//!
//! Verifies the wire-format guarantees: integer PCM encodings round-trip
//! bit-exactly through the internal float representation, f32 round-trips
//! exactly, and out-of-range values clamp instead of wrapping.

use proptest::prelude::*;

use cadena_core::{SampleBuffer, SampleEncoding, SAMPLE_MAX, SAMPLE_MIN};

const INT_ENCODINGS: [SampleEncoding; 8] = [
    SampleEncoding::U8,
    SampleEncoding::S8,
    SampleEncoding::S16Le,
    SampleEncoding::S16Be,
    SampleEncoding::S24Le,
    SampleEncoding::S24Be,
    SampleEncoding::S32Le,
    SampleEncoding::S32Be,
];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Arbitrary raw bytes survive import∘export unchanged for every
    /// integer encoding (truncated to whole frames).
    #[test]
    fn integer_import_export_roundtrip(
        bytes in prop::collection::vec(any::<u8>(), 0..512),
        enc_index in 0usize..8,
        channels in 1usize..4,
    ) {
        let enc = INT_ENCODINGS[enc_index];
        let frame = enc.bytes_per_sample() * channels;
        let whole = bytes.len() / frame * frame;

        let mut buf = SampleBuffer::new(channels, 0, 44100);
        buf.import_interleaved(&bytes, enc);

        let mut back = Vec::new();
        buf.export_interleaved(enc, &mut back);
        prop_assert_eq!(&back[..], &bytes[..whole]);
    }

    /// Finite f32 samples survive export∘import exactly.
    #[test]
    fn f32_export_import_roundtrip(
        samples in prop::collection::vec(-1.0f64..1.0f64, 1..256),
    ) {
        // Quantize to f32 first; the buffer stores wider floats internally.
        let quantized: Vec<f64> = samples.iter().map(|&s| s as f32 as f64).collect();

        let mut buf = SampleBuffer::new(1, quantized.len(), 48000);
        buf.channel_mut(0).copy_from_slice(&quantized);

        let mut bytes = Vec::new();
        buf.export_interleaved(SampleEncoding::F32Le, &mut bytes);

        let mut back = SampleBuffer::new(1, 0, 48000);
        back.import_interleaved(&bytes, SampleEncoding::F32Le);
        prop_assert_eq!(back.channel(0), &quantized[..]);
    }

    /// Imported samples always land inside the nominal range.
    #[test]
    fn imported_samples_are_in_range(
        bytes in prop::collection::vec(any::<u8>(), 0..256),
        enc_index in 0usize..8,
    ) {
        let enc = INT_ENCODINGS[enc_index];
        let mut buf = SampleBuffer::new(1, 0, 44100);
        buf.import_interleaved(&bytes, enc);
        for &s in buf.channel(0) {
            prop_assert!((SAMPLE_MIN..=SAMPLE_MAX).contains(&s));
        }
    }

    /// Saturating mix of two in-range buffers stays in range and matches
    /// the clamped sample-wise sum.
    #[test]
    fn add_from_is_clamped_sum(
        a in prop::collection::vec(-1.0f64..=1.0f64, 32),
        b in prop::collection::vec(-1.0f64..=1.0f64, 32),
    ) {
        let mut out = SampleBuffer::new(1, 32, 44100);
        out.channel_mut(0).copy_from_slice(&a);
        let mut src = SampleBuffer::new(1, 32, 44100);
        src.channel_mut(0).copy_from_slice(&b);

        out.add_from(&src);
        for i in 0..32 {
            let expected = (a[i] + b[i]).clamp(SAMPLE_MIN, SAMPLE_MAX);
            prop_assert_eq!(out.channel(0)[i], expected);
        }
    }
}
