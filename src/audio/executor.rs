// Exécuteur temps-réel - corps du callback audio
//
// Runs once per block inside the audio callback:
// 1. Retry retirements that did not fit in the result queue last time
// 2. Drain the command queue into the active set
// 3. Gate each active action on its start time, then mix / record / cancel
// 4. Send every action that reached a terminal state to the result queue
//
// ========== SACRED ZONE ==========
// No allocations, no I/O, no locks, no logging in `process`. The active set
// and the pending list have their capacity reserved up front and never grow
// past it.

use crate::audio::diagnostics::{BlockStats, EngineStats};
use crate::audio::timing::StreamClock;
use crate::messaging::action::{Action, ActionHandle, ActionState, Payload};
use crate::messaging::channels::{ActionPtr, ActionReceiver, ActionSender};
use crate::ringbuffer::{RingReader, RingWriter};

/// Where an action's start time falls relative to the current block
enum Gate {
    /// Start time is after this block
    Wait,
    /// Run from this frame offset into the block
    Run(usize),
    /// Start time has passed and belated starts are not allowed
    Timeout,
}

/// Real-time side of a session. Move it into the audio callback.
pub struct Executor {
    input_channels: usize,
    output_channels: usize,
    commands: ActionReceiver,
    results: ActionSender,
    /// Actions currently owned by the executor, in submission order
    active: Vec<ActionPtr>,
    /// Retired actions waiting for room in the result queue
    pending: Vec<ActionPtr>,
    max_active: usize,
    clock: StreamClock,
    stats: EngineStats,
    block_stats: BlockStats,
}

impl Executor {
    pub(crate) fn new(
        input_channels: usize,
        output_channels: usize,
        commands: ActionReceiver,
        results: ActionSender,
        max_active: usize,
        clock: StreamClock,
        stats: EngineStats,
    ) -> Self {
        Self {
            input_channels,
            output_channels,
            commands,
            results,
            active: Vec::with_capacity(max_active),
            pending: Vec::with_capacity(max_active),
            max_active,
            clock,
            stats,
            block_stats: BlockStats::default(),
        }
    }

    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Handle on the counters this executor updates
    pub(crate) fn engine_stats(&self) -> EngineStats {
        self.stats.clone()
    }

    /// Number of actions currently owned by the executor
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Process one block at the shared stream clock's time, then advance the
    /// clock. Returns the block length in frames.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> usize {
        let time = self.clock.now();
        let frames = self.process_at(time, input, output);
        self.clock.advance(frames);
        frames
    }

    /// Process one block starting at stream frame `time`.
    ///
    /// `input` and `output` are interleaved with the session's input and
    /// output channel counts. The block length is taken from `output` (or
    /// from `input` when there are no output channels). Returns the block
    /// length in frames.
    pub fn process_at(&mut self, time: u64, input: &[f32], output: &mut [f32]) -> usize {
        let frames = self.block_frames(input, output);
        output.fill(0.0);

        self.block_stats.record_block(frames);
        self.stats.record_block();

        self.flush_pending();
        self.drain_commands();
        self.run_actions(time, frames, input, output);
        self.retire_finished();

        frames
    }

    fn block_frames(&self, input: &[f32], output: &[f32]) -> usize {
        if self.output_channels > 0 && !output.is_empty() {
            output.len() / self.output_channels
        } else if self.input_channels > 0 {
            input.len() / self.input_channels
        } else {
            0
        }
    }

    fn flush_pending(&mut self) {
        let mut sent = 0;
        for &ptr in &self.pending {
            if !self.results.send_ptr(ptr) {
                self.stats.record_result_queue_overflow();
                break;
            }
            sent += 1;
        }
        self.pending.drain(..sent);
    }

    fn drain_commands(&mut self) {
        while self.active.len() + self.pending.len() < self.max_active {
            match self.commands.recv_ptr() {
                Some(ptr) => self.active.push(ptr),
                None => break,
            }
        }
    }

    fn run_actions(&mut self, time: u64, frames: usize, input: &[f32], output: &mut [f32]) {
        let Self {
            input_channels,
            output_channels,
            active,
            stats,
            block_stats,
            ..
        } = self;

        // A short buffer on either side only covers its own frames
        let input_frames = input.len() / (*input_channels).max(1);
        let output_frames = output.len() / (*output_channels).max(1);

        for index in 0..active.len() {
            // SAFETY: the executor owns every pointer in the active set
            let action = unsafe { active[index].as_mut() };
            if action.state.is_terminal() {
                // Cancelled earlier in this pass
                continue;
            }

            let offset = match gate(action, time, frames) {
                Gate::Wait => continue,
                Gate::Timeout => {
                    action.state = ActionState::CancelledByTimeout;
                    stats.record_timeout();
                    continue;
                }
                Gate::Run(offset) => offset,
            };

            if action.state == ActionState::Queued {
                action.state = ActionState::Active;
                action.actual_time = Some(time + offset as u64);
            }

            let wanted = frames - offset;
            let done = action.done_frames;
            let remaining = action.total_frames - done;

            let processed = match &mut action.payload {
                Payload::Cancel(target) => {
                    cancel_target(active, index, *target);
                    action.state = ActionState::Completed;
                    continue;
                }
                Payload::FetchAndResetStats(slot) => {
                    *slot = *block_stats;
                    block_stats.reset();
                    action.state = ActionState::Completed;
                    continue;
                }
                Payload::PlayBuffer(buffer) => {
                    let n = wanted
                        .min(remaining as usize)
                        .min(output_frames.saturating_sub(offset));
                    if n > 0 {
                        mix_from_buffer(
                            buffer,
                            &action.mapping,
                            done as usize,
                            n,
                            &mut output[offset * *output_channels..],
                            *output_channels,
                        );
                    }
                    n
                }
                Payload::RecordBuffer(buffer) => {
                    let n = wanted
                        .min(remaining as usize)
                        .min(input_frames.saturating_sub(offset));
                    if n > 0 {
                        record_to_buffer(
                            buffer,
                            &action.mapping,
                            done as usize,
                            n,
                            &input[offset * *input_channels..],
                            *input_channels,
                        );
                    }
                    n
                }
                Payload::PlayRingBuffer(reader) => {
                    let n = wanted.min(output_frames.saturating_sub(offset));
                    let got = if n > 0 {
                        mix_from_ring(
                            reader,
                            &action.mapping,
                            n,
                            &mut output[offset * *output_channels..],
                            *output_channels,
                        )
                    } else {
                        0
                    };
                    if got < n {
                        let missing = (n - got) as u64;
                        action.stats.underruns += missing;
                        block_stats.underruns += missing;
                        stats.record_underrun(missing);
                    }
                    n
                }
                Payload::RecordRingBuffer(writer) => {
                    let n = wanted.min(input_frames.saturating_sub(offset));
                    let put = if n > 0 {
                        record_to_ring(
                            writer,
                            &action.mapping,
                            n,
                            &input[offset * *input_channels..],
                            *input_channels,
                        )
                    } else {
                        0
                    };
                    if put < n {
                        let dropped = (n - put) as u64;
                        action.stats.overruns += dropped;
                        block_stats.overruns += dropped;
                        stats.record_overrun(dropped);
                    }
                    n
                }
            };

            action.stats.record_block(processed);
            action.done_frames = done.saturating_add(processed as u64);
            if action.done_frames >= action.total_frames {
                action.state = ActionState::Completed;
            }
        }
    }

    fn retire_finished(&mut self) {
        let Self {
            active,
            pending,
            results,
            stats,
            ..
        } = self;

        active.retain(|&ptr| {
            // SAFETY: still owned by the executor
            let state = unsafe { ptr.as_mut() }.state;
            if !state.is_terminal() {
                return true;
            }
            // Keep result order: nothing overtakes what is already pending
            if !pending.is_empty() || !results.send_ptr(ptr) {
                stats.record_result_queue_overflow();
                pending.push(ptr);
            }
            false
        });
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Outside the callback by now: free what we still own
        for ptr in self.active.drain(..).chain(self.pending.drain(..)) {
            // SAFETY: owned by the executor, never sent anywhere
            drop(unsafe { ptr.into_box() });
        }
    }
}

#[inline]
fn gate(action: &Action, time: u64, frames: usize) -> Gate {
    if action.state == ActionState::Active || action.requested_time == 0 {
        return Gate::Run(0);
    }

    let requested = action.requested_time;
    if requested >= time + frames as u64 {
        Gate::Wait
    } else if requested >= time {
        Gate::Run((requested - time) as usize)
    } else if action.allow_belated {
        Gate::Run(0)
    } else {
        Gate::Timeout
    }
}

/// Mark `target` cancelled if it is still in the active set
#[inline]
fn cancel_target(active: &[ActionPtr], own_index: usize, target: ActionHandle) {
    for (index, &ptr) in active.iter().enumerate() {
        if index == own_index {
            continue;
        }
        // SAFETY: owned by the executor, distinct from the cancel action
        let candidate = unsafe { ptr.as_mut() };
        if candidate.handle == target {
            if !candidate.state.is_terminal() {
                candidate.state = ActionState::Cancelled;
            }
            return;
        }
    }
}

#[inline]
fn mix_from_buffer(
    buffer: &[f32],
    mapping: &[usize],
    start_frame: usize,
    frames: usize,
    output: &mut [f32],
    output_channels: usize,
) {
    let channels = mapping.len();
    let source = &buffer[start_frame * channels..(start_frame + frames) * channels];
    for (source_frame, out_frame) in source
        .chunks_exact(channels)
        .zip(output.chunks_exact_mut(output_channels))
    {
        for (&sample, &channel) in source_frame.iter().zip(mapping) {
            out_frame[channel - 1] += sample;
        }
    }
}

#[inline]
fn record_to_buffer(
    buffer: &mut [f32],
    mapping: &[usize],
    start_frame: usize,
    frames: usize,
    input: &[f32],
    input_channels: usize,
) {
    let channels = mapping.len();
    let target = &mut buffer[start_frame * channels..(start_frame + frames) * channels];
    for (target_frame, in_frame) in target
        .chunks_exact_mut(channels)
        .zip(input.chunks_exact(input_channels))
    {
        for (sample, &channel) in target_frame.iter_mut().zip(mapping) {
            *sample = in_frame[channel - 1];
        }
    }
}

/// Mix up to `frames` frames from the ring buffer. Returns frames read; the
/// rest of the block stays silent for this action.
#[inline]
fn mix_from_ring(
    reader: &mut RingReader<f32>,
    mapping: &[usize],
    frames: usize,
    output: &mut [f32],
    output_channels: usize,
) -> usize {
    let channels = mapping.len();
    let (first, second) = reader.read_regions(frames);
    let got = (first.len() + second.len()) / channels;

    for (source_frame, out_frame) in first
        .chunks_exact(channels)
        .chain(second.chunks_exact(channels))
        .zip(output.chunks_exact_mut(output_channels))
    {
        for (&sample, &channel) in source_frame.iter().zip(mapping) {
            out_frame[channel - 1] += sample;
        }
    }

    reader.advance_read_index(got)
}

/// Copy up to `frames` input frames into the ring buffer. Returns frames
/// written; frames that do not fit are dropped.
#[inline]
fn record_to_ring(
    writer: &mut RingWriter<f32>,
    mapping: &[usize],
    frames: usize,
    input: &[f32],
    input_channels: usize,
) -> usize {
    let channels = mapping.len();
    let (first, second) = writer.write_regions(frames);
    let put = (first.len() + second.len()) / channels;

    for (target_frame, in_frame) in first
        .chunks_exact_mut(channels)
        .chain(second.chunks_exact_mut(channels))
        .zip(input.chunks_exact(input_channels))
    {
        for (sample, &channel) in target_frame.iter_mut().zip(mapping) {
            *sample = in_frame[channel - 1];
        }
    }

    writer.advance_write_index(put)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::action::ActionHandle;
    use crate::messaging::channels::create_action_queue;
    use std::sync::Arc;

    struct Harness {
        commands: ActionSender,
        results: ActionReceiver,
        executor: Executor,
        stats: EngineStats,
    }

    fn harness(input_channels: usize, output_channels: usize, result_capacity: usize) -> Harness {
        let (commands, command_rx) = create_action_queue(16).unwrap();
        let (result_tx, results) = create_action_queue(result_capacity).unwrap();
        let stats = EngineStats::new();
        let executor = Executor::new(
            input_channels,
            output_channels,
            command_rx,
            result_tx,
            64,
            StreamClock::new(48000),
            stats.clone(),
        );
        Harness {
            commands,
            results,
            executor,
            stats,
        }
    }

    fn play(id: u64, samples: Vec<f32>, mapping: Vec<usize>, time: u64, belated: bool) -> Box<Action> {
        let buffer: Arc<[f32]> = samples.into();
        Box::new(Action::new(
            ActionHandle(id),
            Payload::PlayBuffer(buffer),
            mapping,
            time,
            belated,
        ))
    }

    #[test]
    fn test_silence_without_actions() {
        let mut h = harness(0, 2, 16);
        let mut out = vec![1.0f32; 16];
        assert_eq!(h.executor.process(&[], &mut out), 8);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(h.stats.snapshot().blocks, 1);
    }

    #[test]
    fn test_sub_block_start_offset() {
        let mut h = harness(0, 1, 16);
        h.commands.send(play(1, vec![0.5; 4], vec![1], 6, true)).unwrap();

        let mut out = vec![0.0f32; 8];
        h.executor.process_at(4, &[], &mut out);
        // Frames 4..8 of the block are stream frames 8..12: starts at offset 2
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);

        let finished = h.results.recv().unwrap();
        assert_eq!(finished.state, ActionState::Completed);
        assert_eq!(finished.actual_time, Some(6));
        assert_eq!(finished.done_frames, 4);
    }

    #[test]
    fn test_future_action_waits_untouched() {
        let mut h = harness(0, 1, 16);
        h.commands.send(play(1, vec![0.5; 2], vec![1], 100, true)).unwrap();

        let mut out = vec![0.0f32; 8];
        h.executor.process_at(0, &[], &mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(h.executor.active_count(), 1);
        assert!(h.results.recv().is_none());
    }

    #[test]
    fn test_timeout_without_belated() {
        let mut h = harness(0, 1, 16);
        h.commands.send(play(1, vec![0.5; 2], vec![1], 3, false)).unwrap();

        let mut out = vec![0.0f32; 8];
        h.executor.process_at(16, &[], &mut out);
        assert!(out.iter().all(|&s| s == 0.0));

        let finished = h.results.recv().unwrap();
        assert_eq!(finished.state, ActionState::CancelledByTimeout);
        assert_eq!(finished.done_frames, 0);
        assert_eq!(h.stats.snapshot().timeouts, 1);
    }

    #[test]
    fn test_record_buffer_overwrites() {
        let mut h = harness(2, 0, 16);
        let action = Box::new(Action::new(
            ActionHandle(1),
            Payload::RecordBuffer(vec![9.0; 3]),
            vec![2],
            0,
            true,
        ));
        h.commands.send(action).unwrap();

        let input = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8];
        assert_eq!(h.executor.process(&input, &mut []), 4);

        let finished = h.results.recv().unwrap();
        assert_eq!(finished.state, ActionState::Completed);
        match &finished.payload {
            Payload::RecordBuffer(buffer) => assert_eq!(buffer, &vec![0.2, 0.4, 0.6]),
            _ => panic!("unexpected payload"),
        }
    }

    #[test]
    fn test_short_buffers_are_not_indexed_past_their_end() {
        let mut h = harness(1, 1, 16);
        h.commands
            .send(Box::new(Action::new(
                ActionHandle(1),
                Payload::RecordBuffer(vec![0.0; 4]),
                vec![1],
                5,
                true,
            )))
            .unwrap();
        h.commands.send(play(2, vec![0.5; 4], vec![1], 5, true)).unwrap();

        // No input: the record starts but cannot take anything
        let mut out = [0.0f32; 8];
        h.executor.process_at(0, &[], &mut out);
        assert_eq!(out, [0.0, 0.0, 0.0, 0.0, 0.0, 0.5, 0.5, 0.5]);
        assert!(h.results.recv().is_none());

        // No output: the play waits for the next block with output
        let input = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8];
        h.executor.process_at(8, &input, &mut []);
        let recorded = h.results.recv().unwrap();
        assert_eq!(recorded.actual_time, Some(5));
        match &recorded.payload {
            Payload::RecordBuffer(buffer) => assert_eq!(buffer, &vec![0.1, 0.2, 0.3, 0.4]),
            _ => panic!("unexpected payload"),
        }
        assert!(h.results.recv().is_none());

        h.executor.process_at(16, &[], &mut out);
        let played = h.results.recv().unwrap();
        assert_eq!(played.done_frames, 4);
        assert_eq!(out, [0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_retired_actions_freed_after_session_is_gone() {
        let Harness {
            mut commands,
            results,
            mut executor,
            ..
        } = harness(0, 1, 16);
        let buffer: Arc<[f32]> = vec![0.5f32; 4].into();
        commands
            .send(Box::new(Action::new(
                ActionHandle(1),
                Payload::PlayBuffer(Arc::clone(&buffer)),
                vec![1],
                0,
                true,
            )))
            .unwrap();
        drop(commands);
        drop(results);

        let mut out = [0.0f32; 4];
        executor.process(&[], &mut out);
        assert_eq!(executor.active_count(), 0);
        assert_eq!(Arc::strong_count(&buffer), 2);

        drop(executor);
        assert_eq!(Arc::strong_count(&buffer), 1);
    }

    #[test]
    fn test_cancel_stops_target() {
        let mut h = harness(0, 1, 16);
        h.commands.send(play(1, vec![0.25; 64], vec![1], 0, true)).unwrap();

        let mut out = vec![0.0f32; 4];
        h.executor.process(&[], &mut out);
        assert_eq!(out, vec![0.25; 4]);

        h.commands
            .send(Box::new(Action::new(
                ActionHandle(2),
                Payload::Cancel(ActionHandle(1)),
                Vec::new(),
                0,
                true,
            )))
            .unwrap();
        h.executor.process(&[], &mut out);
        // Target precedes the cancel in the active set, so it still plays this block
        assert_eq!(out, vec![0.25; 4]);

        let first = h.results.recv().unwrap();
        let second = h.results.recv().unwrap();
        assert_eq!(first.handle(), ActionHandle(1));
        assert_eq!(first.state, ActionState::Cancelled);
        assert_eq!(second.handle(), ActionHandle(2));
        assert_eq!(second.state, ActionState::Completed);

        h.executor.process(&[], &mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_result_queue_overflow_is_delayed_not_lost() {
        let mut h = harness(0, 1, 1);
        h.commands.send(play(1, vec![0.1; 1], vec![1], 0, true)).unwrap();
        h.commands.send(play(2, vec![0.1; 1], vec![1], 0, true)).unwrap();

        let mut out = vec![0.0f32; 4];
        h.executor.process(&[], &mut out);
        assert_eq!(h.stats.snapshot().result_queue_overflows, 1);

        assert_eq!(h.results.recv().unwrap().handle(), ActionHandle(1));
        assert!(h.results.recv().is_none());

        h.executor.process(&[], &mut out);
        assert_eq!(h.results.recv().unwrap().handle(), ActionHandle(2));
    }

    #[test]
    fn test_fetch_and_reset_stats() {
        let mut h = harness(0, 1, 16);
        let mut out = vec![0.0f32; 32];
        h.executor.process(&[], &mut out);
        h.executor.process(&[], &mut out[..8]);

        h.commands
            .send(Box::new(Action::new(
                ActionHandle(1),
                Payload::FetchAndResetStats(BlockStats::default()),
                Vec::new(),
                0,
                true,
            )))
            .unwrap();
        h.executor.process(&[], &mut out[..16]);

        let finished = h.results.recv().unwrap();
        match finished.payload {
            Payload::FetchAndResetStats(stats) => {
                assert_eq!(stats.blocks, 3);
                assert_eq!(stats.min_blocksize, 8);
                assert_eq!(stats.max_blocksize, 32);
            }
            _ => panic!("unexpected payload"),
        }
    }
}
