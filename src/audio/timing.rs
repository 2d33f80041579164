// Stream clock - temps du stream en frames, partagé audio ↔ contrôle

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared stream time, counted in frames since the stream started.
///
/// The audio callback advances it once per block; the control thread reads
/// it to schedule actions (`start = session.time() + ...`).
#[derive(Clone)]
pub struct StreamClock {
    /// Frame position of the next block (incremented by the audio callback)
    position: Arc<AtomicU64>,
    sample_rate: u32,
}

impl StreamClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            position: Arc::new(AtomicU64::new(0)),
            sample_rate,
        }
    }

    /// Current stream time in frames (called from the control thread)
    pub fn now(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Advance by one block (called from the audio callback)
    pub fn advance(&self, frames: usize) {
        self.position.fetch_add(frames as u64, Ordering::Release);
    }

    /// Jump to an externally reported stream time
    pub fn set(&self, frames: u64) {
        self.position.store(frames, Ordering::Release);
    }

    pub fn frames_from_seconds(&self, seconds: f64) -> u64 {
        if seconds <= 0.0 {
            return 0;
        }
        (seconds * self.sample_rate as f64).round() as u64
    }

    pub fn seconds_from_frames(&self, frames: u64) -> f64 {
        frames as f64 / self.sample_rate.max(1) as f64
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_creation() {
        let clock = StreamClock::new(48000);
        assert_eq!(clock.now(), 0);
        assert_eq!(clock.sample_rate(), 48000);
    }

    #[test]
    fn test_advance_frames() {
        let clock = StreamClock::new(48000);
        let audio_side = clock.clone();
        audio_side.advance(480);
        assert_eq!(clock.now(), 480);
        audio_side.advance(480);
        assert_eq!(clock.now(), 960);

        audio_side.set(10);
        assert_eq!(clock.now(), 10);
    }

    #[test]
    fn test_seconds_conversion() {
        let clock = StreamClock::new(44100);
        assert_eq!(clock.frames_from_seconds(1.0), 44100);
        assert_eq!(clock.frames_from_seconds(0.1), 4410);
        assert_eq!(clock.frames_from_seconds(-1.0), 0);
        assert!((clock.seconds_from_frames(22050) - 0.5).abs() < 1e-9);
    }
}
