// Session - côté contrôle (non temps-réel)
//
// Builds actions, pushes them into the command queue, drains the result
// queue and keeps track of which actions are still live. Everything here may
// allocate, log and block; nothing here runs in the audio callback.

pub mod config;
pub mod trait_def;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};

use crate::audio::diagnostics::{BlockStats, EngineStats, EngineStatsSnapshot};
use crate::audio::executor::Executor;
use crate::audio::timing::StreamClock;
use crate::error::{MixerError, MixerResult};
use crate::messaging::action::{
    Action, ActionHandle, Channels, FinishedAction, Payload, ReturnedPayload,
};
use crate::messaging::channels::{ActionReceiver, ActionSender, create_action_queue};
use crate::ringbuffer::{RingReader, RingWriter};

pub use config::SessionConfig;
pub use trait_def::{Mixer, Recorder};

const SAMPLE_SIZE: usize = std::mem::size_of::<f32>();

/// Control side of a mixer/recorder.
///
/// Created together with its [`Executor`], which belongs in the audio
/// callback.
pub struct Session {
    config: SessionConfig,
    commands: ActionSender,
    results: ActionReceiver,
    /// Submitted and not yet seen in the result queue, in submission order
    live: BTreeSet<ActionHandle>,
    /// Retired records not yet claimed with `take_finished`
    finished: HashMap<ActionHandle, FinishedAction>,
    /// Records without a payload, oldest first, bounded by `finished_history`
    history: VecDeque<ActionHandle>,
    next_handle: u64,
    clock: StreamClock,
    stats: EngineStats,
    last_overflows: u64,
}

impl Session {
    pub fn new(config: &SessionConfig) -> MixerResult<(Session, Executor)> {
        config.validate()?;

        let (commands, command_rx) = create_action_queue(config.command_queue_capacity)?;
        let (result_tx, results) = create_action_queue(config.result_queue_capacity)?;
        let clock = StreamClock::new(config.sample_rate);
        let stats = EngineStats::new();

        let executor = Executor::new(
            config.input_channels,
            config.output_channels,
            command_rx,
            result_tx,
            config.max_active_actions,
            clock.clone(),
            stats.clone(),
        );

        debug!(
            "Session created: {} in, {} out, {} Hz, queues {}/{}",
            config.input_channels,
            config.output_channels,
            config.sample_rate,
            config.command_queue_capacity,
            config.result_queue_capacity
        );

        let session = Session {
            config: config.clone(),
            commands,
            results,
            live: BTreeSet::new(),
            finished: HashMap::new(),
            history: VecDeque::with_capacity(config.finished_history),
            next_handle: 1,
            clock,
            stats,
            last_overflows: 0,
        };

        Ok((session, executor))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn input_channels(&self) -> usize {
        self.config.input_channels
    }

    pub fn output_channels(&self) -> usize {
        self.config.output_channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.clock.sample_rate()
    }

    /// Current stream time in frames
    pub fn time(&self) -> u64 {
        self.clock.now()
    }

    pub fn frames_from_seconds(&self, seconds: f64) -> u64 {
        self.clock.frames_from_seconds(seconds)
    }

    /// Cancel `target` once stream time reaches `time` (0 = next block).
    ///
    /// Returns as soon as the cancel action is queued; use [`Session::wait`]
    /// on `target` to know when it actually stopped.
    pub fn cancel(
        &mut self,
        target: ActionHandle,
        time: u64,
        allow_belated: bool,
    ) -> MixerResult<ActionHandle> {
        self.enqueue(Payload::Cancel(target), Vec::new(), time, allow_belated)
    }

    /// Ask the executor for its block statistics and reset them
    pub fn fetch_and_reset_stats(
        &mut self,
        time: u64,
        allow_belated: bool,
    ) -> MixerResult<ActionHandle> {
        self.enqueue(
            Payload::FetchAndResetStats(BlockStats::default()),
            Vec::new(),
            time,
            allow_belated,
        )
    }

    /// Fetch, wait for and return the executor's block statistics
    pub fn stats(&mut self, poll_interval: Duration) -> MixerResult<BlockStats> {
        let handle = self.fetch_and_reset_stats(0, true)?;
        self.wait(handle, poll_interval)?;
        self.take_finished(handle)
            .and_then(|finished| finished.engine_block_stats())
            .ok_or(MixerError::MissingRecord(handle))
    }

    /// Drain the result queue, then return the live set
    pub fn live_actions(&mut self) -> &BTreeSet<ActionHandle> {
        self.drain_results();
        &self.live
    }

    pub fn actions(&mut self) -> &BTreeSet<ActionHandle> {
        self.live_actions()
    }

    pub fn is_live(&mut self, handle: ActionHandle) -> bool {
        self.live_actions().contains(&handle)
    }

    /// Block until `handle` is no longer live.
    ///
    /// Fails with `Disconnected` if the executor goes away while the action
    /// is still live.
    pub fn wait(&mut self, handle: ActionHandle, poll_interval: Duration) -> MixerResult<()> {
        loop {
            if !self.is_live(handle) {
                return Ok(());
            }
            if self.results.is_abandoned() {
                // Last results may have landed just before the executor went away
                return if self.is_live(handle) {
                    Err(MixerError::Disconnected)
                } else {
                    Ok(())
                };
            }
            thread::sleep(poll_interval);
        }
    }

    /// Block until no action is live
    pub fn wait_all(&mut self, poll_interval: Duration) -> MixerResult<()> {
        loop {
            if self.live_actions().is_empty() {
                return Ok(());
            }
            if self.results.is_abandoned() {
                return if self.live_actions().is_empty() {
                    Ok(())
                } else {
                    Err(MixerError::Disconnected)
                };
            }
            thread::sleep(poll_interval);
        }
    }

    /// Claim the retired record of `handle`.
    ///
    /// Records of actions that hand something back (recordings, ring buffer
    /// halves, statistics) wait here until claimed. Play and cancel records
    /// only stay among the last `finished_history` retirements.
    pub fn take_finished(&mut self, handle: ActionHandle) -> Option<FinishedAction> {
        self.drain_results();
        self.finished.remove(&handle)
    }

    /// Drop all unclaimed retired records
    pub fn clear_finished(&mut self) {
        self.drain_results();
        self.finished.clear();
        self.history.clear();
    }

    /// Number of retired records currently held
    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    pub fn engine_stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    fn drain_results(&mut self) {
        while let Some(action) = self.results.recv() {
            let finished = FinishedAction::from(action);
            if !self.live.remove(&finished.handle) {
                error!("{} came back but was not live", finished.handle);
            }
            debug!("{} retired: {:?}", finished.handle, finished.state);
            self.keep_finished(finished);
        }

        let overflows = self.stats.snapshot().result_queue_overflows;
        if overflows > self.last_overflows {
            warn!(
                "Result queue full {} times, consider a larger result_queue_capacity",
                overflows - self.last_overflows
            );
            self.last_overflows = overflows;
        }
    }

    fn keep_finished(&mut self, finished: FinishedAction) {
        let handle = finished.handle;
        if !matches!(finished.payload, ReturnedPayload::None) {
            self.finished.insert(handle, finished);
            return;
        }
        if self.config.finished_history == 0 {
            return;
        }
        if self.history.len() == self.config.finished_history {
            if let Some(oldest) = self.history.pop_front() {
                self.finished.remove(&oldest);
            }
        }
        self.history.push_back(handle);
        self.finished.insert(handle, finished);
    }

    fn enqueue(
        &mut self,
        payload: Payload,
        mapping: Vec<usize>,
        time: u64,
        allow_belated: bool,
    ) -> MixerResult<ActionHandle> {
        self.drain_results();
        if self.commands.is_abandoned() {
            return Err(MixerError::Disconnected);
        }

        let handle = ActionHandle(self.next_handle);
        let action = Box::new(Action::new(handle, payload, mapping, time, allow_belated));
        let kind = action.kind();

        if self.commands.send(action).is_err() {
            // The rejected action came back to us and is dropped here
            return Err(MixerError::QueueFull);
        }

        self.next_handle += 1;
        self.live.insert(handle);
        debug!("{} queued: {:?} at {}", handle, kind, time);
        Ok(handle)
    }
}

/// Check a 1-based channel mapping against the available channels
fn validate_mapping(mapping: &[usize], available: usize) -> MixerResult<()> {
    if mapping.is_empty() {
        return Err(MixerError::InvalidChannelMapping(
            "At least one channel is required".to_string(),
        ));
    }
    for (index, &channel) in mapping.iter().enumerate() {
        if channel < 1 {
            return Err(MixerError::InvalidChannelMapping(
                "Channel numbers start with 1".to_string(),
            ));
        }
        if channel > available {
            return Err(MixerError::InvalidChannelMapping(format!(
                "Channel number too large: {} (only {} available)",
                channel, available
            )));
        }
        if mapping[..index].contains(&channel) {
            return Err(MixerError::InvalidChannelMapping(format!(
                "Channel {} used twice",
                channel
            )));
        }
    }
    Ok(())
}

/// Resolve the mapping of a ring buffer action and check the element size
fn ring_mapping(
    channels: Option<Channels>,
    element_len: usize,
    element_size: usize,
    available: usize,
) -> MixerResult<Vec<usize>> {
    let channels = channels.unwrap_or(Channels::Count(element_len));
    let expected = channels.len() * SAMPLE_SIZE;
    if expected != element_size {
        return Err(MixerError::IncompatibleElementSize {
            expected,
            actual: element_size,
        });
    }
    let mapping = channels.into_mapping();
    validate_mapping(&mapping, available)?;
    Ok(mapping)
}

impl Mixer for Session {
    fn play_buffer(
        &mut self,
        buffer: impl Into<Arc<[f32]>>,
        channels: impl Into<Channels>,
        start: u64,
        allow_belated: bool,
    ) -> MixerResult<ActionHandle> {
        let mapping = channels.into().into_mapping();
        validate_mapping(&mapping, self.config.output_channels)?;
        self.enqueue(
            Payload::PlayBuffer(buffer.into()),
            mapping,
            start,
            allow_belated,
        )
    }

    fn play_ringbuffer(
        &mut self,
        reader: RingReader<f32>,
        channels: Option<Channels>,
        start: u64,
        allow_belated: bool,
    ) -> MixerResult<ActionHandle> {
        let mapping = ring_mapping(
            channels,
            reader.element_len(),
            reader.element_size(),
            self.config.output_channels,
        )?;
        self.enqueue(Payload::PlayRingBuffer(reader), mapping, start, allow_belated)
    }
}

impl Recorder for Session {
    fn record_buffer(
        &mut self,
        buffer: Vec<f32>,
        channels: impl Into<Channels>,
        start: u64,
        allow_belated: bool,
    ) -> MixerResult<ActionHandle> {
        let mapping = channels.into().into_mapping();
        validate_mapping(&mapping, self.config.input_channels)?;
        self.enqueue(Payload::RecordBuffer(buffer), mapping, start, allow_belated)
    }

    fn record_ringbuffer(
        &mut self,
        writer: RingWriter<f32>,
        channels: Option<Channels>,
        start: u64,
        allow_belated: bool,
    ) -> MixerResult<ActionHandle> {
        let mapping = ring_mapping(
            channels,
            writer.element_len(),
            writer.element_size(),
            self.config.input_channels,
        )?;
        self.enqueue(
            Payload::RecordRingBuffer(writer),
            mapping,
            start,
            allow_belated,
        )
    }
}
