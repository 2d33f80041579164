// Bleeperoo - plays a few hundred random sine bleeps on random channels
//
// Usage: rtmixer [session.ron]
// Set RUST_LOG=debug to see every action being queued and retired.

use std::f32::consts::PI;
use std::time::Duration;

use log::{error, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rtmixer::{Mixer, MixerResult, MixerStream, SessionConfig};

const SEED: u64 = 99;
const BLEEPS: usize = 300;

const ATTACK: f32 = 0.005;
const RELEASE: f32 = 0.1;
const PITCH_RANGE: (f32, f32) = (40.0, 80.0);
const DURATION_RANGE: (f32, f32) = (0.2, 0.6);
const AMPLITUDE_RANGE: (f32, f32) = (0.05, 0.15);
const START_RANGE: (f64, f64) = (0.0, 10.0);

fn main() {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run() {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> MixerResult<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading session config from {}", path);
            SessionConfig::load(path)?
        }
        None => SessionConfig::default().with_queue_capacity(512),
    };

    let (mut session, mut stream) = MixerStream::output(&config)?;
    let channels = stream.channels();
    let sample_rate = stream.sample_rate() as f32;

    let mut rng = StdRng::seed_from_u64(SEED);
    let bleeps: Vec<Vec<f32>> = (0..BLEEPS)
        .map(|_| make_bleep(&mut rng, sample_rate))
        .collect();
    info!("Generated {} bleeps", bleeps.len());

    let start_time = session.time();
    for bleep in bleeps {
        let channel = rng.gen_range(1..=channels);
        let offset = session.frames_from_seconds(rng.gen_range(START_RANGE.0..START_RANGE.1));
        session.play_buffer(bleep, vec![channel], start_time + offset, true)?;
    }

    session.wait_all(Duration::from_millis(100))?;

    let stats = session.engine_stats();
    info!(
        "Done: {} blocks, {} result queue overflows, callback load {:.1}%",
        stats.blocks,
        stats.result_queue_overflows,
        stream.load.percentage()
    );
    for notification in stream.poll_notifications() {
        info!("{:?}: {}", notification.level, notification.message);
    }

    Ok(())
}

fn make_bleep(rng: &mut StdRng, sample_rate: f32) -> Vec<f32> {
    let duration = rng.gen_range(DURATION_RANGE.0..DURATION_RANGE.1);
    let amplitude = rng.gen_range(AMPLITUDE_RANGE.0..AMPLITUDE_RANGE.1);
    let pitch = rng.gen_range(PITCH_RANGE.0..PITCH_RANGE.1);
    // MIDI pitch to frequency
    let frequency = 2f32.powf((pitch - 69.0) / 12.0) * 440.0;

    let len = (sample_rate * duration) as usize;
    let fade_in = ((sample_rate * ATTACK) as usize).max(1);
    let fade_out = ((sample_rate * RELEASE) as usize).max(1);

    (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate;
            let mut sample = amplitude * (2.0 * PI * frequency * t).sin();
            if i < fade_in {
                sample *= i as f32 / fade_in as f32;
            }
            let from_end = len - 1 - i;
            if from_end < fade_out {
                sample *= from_end as f32 / fade_out as f32;
            }
            sample
        })
        .collect()
}
