use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rtmixer::{Mixer, RingBuffer, Session, SessionConfig};

const BLOCK_FRAMES: usize = 512;

/// Benchmark mixing N long play buffers into a stereo block
fn bench_play_buffers(c: &mut Criterion) {
    let mut group = c.benchmark_group("play_buffers");

    for voices in [1usize, 16, 128] {
        let config = SessionConfig::output(2, 48000).with_queue_capacity(256);
        let (mut session, mut executor) = Session::new(&config).unwrap();

        // Long enough to never complete during the benchmark
        let buffer: std::sync::Arc<[f32]> = vec![0.1f32; 48000 * 600].into();
        for i in 0..voices {
            let channel = i % 2 + 1;
            session
                .play_buffer(buffer.clone(), vec![channel], 0, true)
                .unwrap();
        }

        let mut output = vec![0.0f32; BLOCK_FRAMES * 2];
        executor.process(&[], &mut output);

        group.bench_with_input(BenchmarkId::from_parameter(voices), &voices, |b, _| {
            b.iter(|| {
                executor.process(&[], black_box(&mut output));
            });
        });
    }
    group.finish();
}

/// Benchmark a ring buffer playback kept fed by the benchmark loop
fn bench_play_ringbuffer(c: &mut Criterion) {
    let config = SessionConfig::output(2, 48000);
    let (mut session, mut executor) = Session::new(&config).unwrap();

    let (mut writer, reader) = RingBuffer::<f32>::with_element_len(2, 4096).unwrap().split();
    session.play_ringbuffer(reader, None, 0, true).unwrap();

    let input = vec![0.2f32; BLOCK_FRAMES * 2];
    let mut output = vec![0.0f32; BLOCK_FRAMES * 2];

    c.bench_function("play_ringbuffer_stereo", |b| {
        b.iter(|| {
            writer.write(&input);
            executor.process(&[], black_box(&mut output));
        });
    });
}

/// Benchmark an idle block (timing gate only, actions far in the future)
fn bench_waiting_actions(c: &mut Criterion) {
    let config = SessionConfig::output(2, 48000).with_queue_capacity(1024);
    let (mut session, mut executor) = Session::new(&config).unwrap();

    for i in 0..1000u64 {
        session
            .play_buffer(vec![0.0f32; 64], 1usize, u64::MAX / 2 + i, false)
            .unwrap();
    }

    let mut output = vec![0.0f32; BLOCK_FRAMES * 2];
    c.bench_function("gate_1000_waiting", |b| {
        b.iter(|| {
            executor.process(&[], black_box(&mut output));
        });
    });
}

criterion_group!(
    benches,
    bench_play_buffers,
    bench_play_ringbuffer,
    bench_waiting_actions
);
criterion_main!(benches);
