//! Benchmarks for the SampleBuffer hot operations.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cadena_core::{SampleBuffer, SampleEncoding};

fn bench_add_from(c: &mut Criterion) {
    let mut out = SampleBuffer::new(2, 1024, 44100);
    let mut src = SampleBuffer::new(2, 1024, 44100);
    for ch in 0..2 {
        for (i, s) in src.channel_mut(ch).iter_mut().enumerate() {
            *s = ((i as f64) * 0.01).sin() * 0.5;
        }
    }

    c.bench_function("add_from 2ch 1024", |b| {
        b.iter(|| {
            out.zero();
            out.add_from(black_box(&src));
        })
    });
}

fn bench_import_export(c: &mut Criterion) {
    let mut src = SampleBuffer::new(2, 1024, 44100);
    for ch in 0..2 {
        for (i, s) in src.channel_mut(ch).iter_mut().enumerate() {
            *s = ((i as f64) * 0.02).sin() * 0.8;
        }
    }
    let mut bytes = Vec::new();
    src.export_interleaved(SampleEncoding::S16Le, &mut bytes);

    c.bench_function("import s16le 2ch 1024", |b| {
        let mut buf = SampleBuffer::new(2, 1024, 44100);
        b.iter(|| buf.import_interleaved(black_box(&bytes), SampleEncoding::S16Le))
    });

    c.bench_function("export s16le 2ch 1024", |b| {
        let mut out = Vec::with_capacity(bytes.len());
        b.iter(|| {
            out.clear();
            src.export_interleaved(SampleEncoding::S16Le, black_box(&mut out));
        })
    });
}

criterion_group!(benches, bench_add_from, bench_import_export);
criterion_main!(benches);
