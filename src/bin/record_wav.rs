// Record the default input device into a float WAV file
//
// Usage: record_wav <output.wav> [seconds]

use std::thread;
use std::time::{Duration, Instant};

use hound::{WavSpec, WavWriter};
use log::{error, info, warn};

use rtmixer::{MixerError, MixerResult, MixerStream, Recorder, RingBuffer, SessionConfig};

const RING_FRAMES: usize = 65536;
const DEFAULT_SECONDS: f64 = 5.0;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run() {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> MixerResult<()> {
    let mut args = std::env::args().skip(1);
    let path = args.next().unwrap_or_else(|| "recording.wav".to_string());
    let seconds = args
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(DEFAULT_SECONDS);

    let (mut session, stream) = MixerStream::input(&SessionConfig::input(1, 44100))?;
    let channels = stream.channels();
    let poll_interval = session.config().poll_interval();

    let (writer, mut reader) = RingBuffer::<f32>::with_element_len(channels, RING_FRAMES)?.split();
    let handle = session.record_ringbuffer(writer, None, 0, true)?;

    let spec = WavSpec {
        channels: channels as u16,
        sample_rate: stream.sample_rate(),
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut wav = WavWriter::create(&path, spec)?;
    info!("Recording {:.1} s of {} channels to {}", seconds, channels, path);

    let mut block = vec![0.0f32; 4096 * channels];
    let started = Instant::now();
    while started.elapsed() < Duration::from_secs_f64(seconds) {
        drain_into(&mut reader, &mut block, &mut wav)?;
        thread::sleep(poll_interval);
    }

    session.cancel(handle, 0, true)?;
    session.wait(handle, poll_interval)?;
    drain_into(&mut reader, &mut block, &mut wav)?;
    wav.finalize()?;

    let finished = session.take_finished(handle).ok_or(MixerError::MissingRecord(handle))?;
    if finished.stats.overruns > 0 {
        warn!("{} frames were dropped (ring buffer full)", finished.stats.overruns);
    }
    info!("Recorded {} frames", finished.done_frames);

    Ok(())
}

fn drain_into<W>(
    reader: &mut rtmixer::RingReader<f32>,
    block: &mut [f32],
    wav: &mut WavWriter<W>,
) -> MixerResult<()>
where
    W: std::io::Write + std::io::Seek,
{
    loop {
        let elements = reader.read(block);
        if elements == 0 {
            return Ok(());
        }
        for &sample in &block[..elements * reader.element_len()] {
            wav.write_sample(sample)?;
        }
    }
}
