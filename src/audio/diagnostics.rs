// Diagnostics - compteurs lock-free partagés entre le callback et le contrôle
//
// Runtime audio conditions (ring buffer underruns/overruns, result queue
// pressure, belated actions dropped) are never errors on the audio thread.
// They are counted here with relaxed atomics and read from the control side.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Block statistics, per action and for the whole executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStats {
    /// Number of blocks processed
    pub blocks: u64,
    /// Smallest block seen (0 while `blocks == 0`)
    pub min_blocksize: usize,
    /// Largest block seen
    pub max_blocksize: usize,
    /// Frames a ring buffer source could not supply
    pub underruns: u64,
    /// Frames a ring buffer sink could not accept
    pub overruns: u64,
}

impl BlockStats {
    #[inline]
    pub fn record_block(&mut self, frames: usize) {
        if self.blocks == 0 {
            self.min_blocksize = frames;
            self.max_blocksize = frames;
        } else {
            self.min_blocksize = self.min_blocksize.min(frames);
            self.max_blocksize = self.max_blocksize.max(frames);
        }
        self.blocks += 1;
    }

    #[inline]
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Default)]
struct Counters {
    blocks: AtomicU64,
    underruns: AtomicU64,
    overruns: AtomicU64,
    result_queue_overflows: AtomicU64,
    timeouts: AtomicU64,
}

/// Executor counters, shared between the audio thread (writer) and the
/// control thread (reader).
#[derive(Clone, Default)]
pub struct EngineStats {
    inner: Arc<Counters>,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub blocks: u64,
    pub underruns: u64,
    pub overruns: u64,
    pub result_queue_overflows: u64,
    pub timeouts: u64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_block(&self) {
        self.inner.blocks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_underrun(&self, frames: u64) {
        self.inner.underruns.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_overrun(&self, frames: u64) {
        self.inner.overruns.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_result_queue_overflow(&self) {
        self.inner
            .result_queue_overflows
            .fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_timeout(&self) {
        self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            blocks: self.inner.blocks.load(Ordering::Relaxed),
            underruns: self.inner.underruns.load(Ordering::Relaxed),
            overruns: self.inner.overruns.load(Ordering::Relaxed),
            result_queue_overflows: self.inner.result_queue_overflows.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Callback load monitor
///
/// Measures how much of the real-time budget the callback uses. Only one
/// callback out of `measure_every_n` is timed to keep the overhead down.
#[derive(Clone)]
pub struct CallbackLoad {
    busy_ns: Arc<AtomicU64>,
    budget_ns: Arc<AtomicU64>,
    measured: Arc<AtomicU64>,
    sample_rate: f64,
    measure_every_n: u32,
    counter: Arc<AtomicU32>,
}

impl CallbackLoad {
    pub fn new(sample_rate: u32, measure_every_n: u32) -> Self {
        Self {
            busy_ns: Arc::new(AtomicU64::new(0)),
            budget_ns: Arc::new(AtomicU64::new(0)),
            measured: Arc::new(AtomicU64::new(0)),
            sample_rate: sample_rate.max(1) as f64,
            measure_every_n: measure_every_n.max(1),
            counter: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Returns `Some` if this callback should be timed
    #[inline]
    pub fn start_measure(&self) -> Option<Instant> {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        if count % self.measure_every_n == 0 {
            Some(Instant::now())
        } else {
            None
        }
    }

    /// Close a measurement for a callback that covered `frames` frames
    #[inline]
    pub fn end_measure(&self, start: Option<Instant>, frames: usize) {
        if let Some(start) = start {
            let elapsed_ns = start.elapsed().as_nanos() as u64;
            let budget_ns = (frames as f64 / self.sample_rate * 1_000_000_000.0) as u64;

            self.busy_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
            self.budget_ns.fetch_add(budget_ns, Ordering::Relaxed);
            self.measured.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Percentage of the real-time budget used (can exceed 100 when overloaded)
    pub fn percentage(&self) -> f32 {
        let busy = self.busy_ns.load(Ordering::Relaxed);
        let budget = self.budget_ns.load(Ordering::Relaxed);
        if budget == 0 {
            return 0.0;
        }
        (busy as f64 / budget as f64 * 100.0) as f32
    }

    pub fn measured_callbacks(&self) -> u64 {
        self.measured.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.busy_ns.store(0, Ordering::Relaxed);
        self.budget_ns.store(0, Ordering::Relaxed);
        self.measured.store(0, Ordering::Relaxed);
        self.counter.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_block_stats_min_max() {
        let mut stats = BlockStats::default();
        stats.record_block(256);
        stats.record_block(64);
        stats.record_block(512);

        assert_eq!(stats.blocks, 3);
        assert_eq!(stats.min_blocksize, 64);
        assert_eq!(stats.max_blocksize, 512);

        stats.reset();
        assert_eq!(stats, BlockStats::default());
    }

    #[test]
    fn test_engine_stats_shared_between_clones() {
        let stats = EngineStats::new();
        let audio_side = stats.clone();

        audio_side.record_block();
        audio_side.record_underrun(32);
        audio_side.record_overrun(8);
        audio_side.record_result_queue_overflow();
        audio_side.record_timeout();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.blocks, 1);
        assert_eq!(snapshot.underruns, 32);
        assert_eq!(snapshot.overruns, 8);
        assert_eq!(snapshot.result_queue_overflows, 1);
        assert_eq!(snapshot.timeouts, 1);
    }

    #[test]
    fn test_load_measures_one_out_of_n() {
        let load = CallbackLoad::new(44100, 10);
        let measured = (0..100).filter(|_| load.start_measure().is_some()).count();
        assert_eq!(measured, 10);
    }

    #[test]
    fn test_load_percentage_and_reset() {
        let load = CallbackLoad::new(44100, 1);
        assert_eq!(load.percentage(), 0.0);

        for _ in 0..5 {
            let start = load.start_measure();
            thread::sleep(Duration::from_micros(100));
            load.end_measure(start, 512);
        }

        assert!(load.percentage() > 0.0);
        assert_eq!(load.measured_callbacks(), 5);

        load.reset();
        assert_eq!(load.percentage(), 0.0);
        assert_eq!(load.measured_callbacks(), 0);
    }
}
