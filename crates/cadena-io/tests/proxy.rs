//! Integration tests for the proxy buffer server: a real worker thread
//! against file and null endpoints.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use cadena_core::{AudioFormat, SampleBuffer, SampleEncoding};
use cadena_io::{
    AudioObject, BufferedProxy, IoMode, NullDevice, ProxyServer, SharedAudioObject, WavSink,
    WavSource,
};

fn shared(obj: impl AudioObject + 'static) -> SharedAudioObject {
    let boxed: Box<dyn AudioObject> = Box::new(obj);
    Arc::new(Mutex::new(boxed))
}

/// Poll `cond` until it holds or `timeout` expires.
fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn write_ramp_wav(path: &std::path::Path, frames: usize) {
    let format = AudioFormat::new(SampleEncoding::F32Le, 1, 44100);
    let mut sink = WavSink::new(path, format);
    sink.open().unwrap();
    let mut buf = SampleBuffer::new(1, frames, 44100);
    for (i, s) in buf.channel_mut(0).iter_mut().enumerate() {
        *s = (i as f64 / frames as f64) as f32 as f64;
    }
    sink.write_buffer(&buf);
    sink.close();
}

#[test]
fn server_prereads_finite_input() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("in.wav");
    // Not a multiple of the slot size: the last slot is a short read,
    // which is what marks the ring finished.
    write_ramp_wav(&path, 250);

    let mut source = WavSource::new(&path);
    source.open().unwrap();
    let endpoint = shared(source);

    let mut server = ProxyServer::new();
    server.set_buffer_defaults(4, 64, 44100);
    let ring = server.register_client(Arc::clone(&endpoint), IoMode::Read);
    server.start();

    assert!(wait_for(
        || ring.read_space() == 4 && ring.is_finished(),
        Duration::from_secs(2)
    ));

    server.exit();

    let mut total = 0;
    let mut first = f64::NAN;
    while ring.consume(|slot| {
        if total == 0 {
            first = slot.channel(0)[0];
        }
        total += slot.frames();
    }) {}
    assert_eq!(total, 250);
    assert_eq!(first, 0.0);
}

#[test]
fn backpressure_sets_full_and_one_advance_clears_it() {
    // Infinite input, buffercount 4, consumer never advances.
    let mut dev = NullDevice::new(IoMode::Read);
    dev.set_format(AudioFormat::new(SampleEncoding::S16Le, 1, 44100));
    dev.open().unwrap();
    let endpoint = shared(dev);

    let mut server = ProxyServer::new();
    server.set_buffer_defaults(4, 64, 44100);
    let ring = server.register_client(endpoint, IoMode::Read);
    server.start();

    assert!(wait_for(
        || ring.read_space() == 4 && server.is_full(),
        Duration::from_secs(2)
    ));
    // Producer has stopped: the ring stays at capacity.
    std::thread::sleep(Duration::from_millis(120));
    assert_eq!(ring.read_space(), 4);
    assert!(server.is_full());

    // One consumer advance; the server refills within a sleep interval.
    assert!(ring.consume(|_| {}));
    assert!(wait_for(|| ring.read_space() == 4, Duration::from_millis(500)));

    server.exit();
}

#[test]
fn server_drains_output_ring() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("out.wav");
    let format = AudioFormat::new(SampleEncoding::F32Le, 1, 44100);

    let mut sink = WavSink::new(&path, format);
    sink.open().unwrap();
    let endpoint = shared(sink);

    let mut server = ProxyServer::new();
    server.set_buffer_defaults(4, 32, 44100);
    let ring = server.register_client(Arc::clone(&endpoint), IoMode::Write);
    server.start();

    // Engine side: produce three blocks of a known value.
    for round in 0..3 {
        assert!(wait_for(|| ring.write_space() > 0, Duration::from_secs(2)));
        assert!(ring.produce(|slot| {
            slot.set_length_in_samples(32);
            slot.channel_mut(0).fill(round as f64 * 0.25);
        }));
    }

    assert!(wait_for(|| ring.read_space() == 0, Duration::from_secs(2)));
    server.exit();
    endpoint.lock().close();

    let mut source = WavSource::new(&path);
    source.open().unwrap();
    assert_eq!(source.length_in_samples(), 96);
    let mut buf = SampleBuffer::new(1, 96, 44100);
    source.read_buffer(&mut buf);
    assert_eq!(buf.channel(0)[0], 0.0);
    assert_eq!(buf.channel(0)[32], 0.25);
    assert_eq!(buf.channel(0)[64], 0.5);
}

#[test]
fn stop_pauses_without_freeing_rings() {
    let mut dev = NullDevice::new(IoMode::Read);
    dev.set_format(AudioFormat::new(SampleEncoding::S16Le, 1, 44100));
    dev.open().unwrap();

    let mut server = ProxyServer::new();
    server.set_buffer_defaults(4, 64, 44100);
    let ring = server.register_client(shared(dev), IoMode::Read);
    server.start();

    assert!(wait_for(|| ring.read_space() == 4, Duration::from_secs(2)));
    server.stop();
    assert!(wait_for(|| !server.is_running(), Duration::from_secs(2)));

    // Drain two blocks while paused: the server must not refill.
    assert!(ring.consume(|_| {}));
    assert!(ring.consume(|_| {}));
    std::thread::sleep(Duration::from_millis(120));
    assert_eq!(ring.read_space(), 2);

    server.start();
    assert!(wait_for(|| ring.read_space() == 4, Duration::from_secs(2)));
    server.exit();
}

#[test]
fn proxy_seek_flushes_and_falls_back_synchronously() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("seekable.wav");
    write_ramp_wav(&path, 512);

    let mut source = WavSource::new(&path);
    source.open().unwrap();
    let endpoint = shared(source);

    let mut server = ProxyServer::new();
    server.set_buffer_defaults(4, 64, 44100);
    let ring = server.register_client(Arc::clone(&endpoint), IoMode::Read);
    let mut proxy = BufferedProxy::new(endpoint, ring);

    server.start();
    assert!(wait_for(|| proxy.ring().read_space() == 4, Duration::from_secs(2)));
    server.stop();
    assert!(wait_for(|| !server.is_running(), Duration::from_secs(2)));

    // Seek discards the four queued blocks and repositions the file.
    proxy.seek_position_in_samples(128);
    assert_eq!(proxy.ring().read_space(), 0);
    assert_eq!(proxy.position_in_samples(), 128);

    // With the server paused the next read is a synchronous fallback.
    let mut buf = SampleBuffer::new(1, 64, 44100);
    assert_eq!(proxy.read_buffer(&mut buf), 64);
    assert_eq!(proxy.xruns(), 1);
    let expected = (128.0 / 512.0_f64) as f32 as f64;
    assert!((buf.channel(0)[0] - expected).abs() < 1e-9);

    server.exit();
}

#[test]
fn buffered_reads_come_from_the_ring() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("ringread.wav");
    write_ramp_wav(&path, 120);

    let mut source = WavSource::new(&path);
    source.open().unwrap();
    let endpoint = shared(source);

    let mut server = ProxyServer::new();
    server.set_buffer_defaults(2, 64, 44100);
    let ring = server.register_client(Arc::clone(&endpoint), IoMode::Read);
    let mut proxy = BufferedProxy::new(endpoint, ring);

    server.start();
    assert!(wait_for(
        || proxy.ring().read_space() == 2 && proxy.ring().is_finished(),
        Duration::from_secs(2)
    ));
    server.exit();

    let mut buf = SampleBuffer::new(1, 64, 44100);
    assert_eq!(proxy.read_buffer(&mut buf), 64);
    buf.set_length_in_samples(64);
    assert_eq!(proxy.read_buffer(&mut buf), 56);
    // Ring empty and marked finished: end of stream, no xrun.
    buf.set_length_in_samples(64);
    assert_eq!(proxy.read_buffer(&mut buf), 0);
    assert!(proxy.finished());
    assert_eq!(proxy.xruns(), 0);
}
