use std::sync::Arc;

use crate::error::MixerResult;
use crate::messaging::action::{ActionHandle, Channels};
use crate::ringbuffer::{RingReader, RingWriter};

/// Scheduling of output actions.
///
/// `start` is an absolute stream time in frames, `0` meaning as soon as
/// possible. With `allow_belated`, an action whose start time has already
/// passed begins at the next block instead of being cancelled.
pub trait Mixer {
    /// Mix an interleaved buffer into the output channels
    fn play_buffer(
        &mut self,
        buffer: impl Into<Arc<[f32]>>,
        channels: impl Into<Channels>,
        start: u64,
        allow_belated: bool,
    ) -> MixerResult<ActionHandle>;

    /// Mix frames read from a ring buffer until cancelled.
    ///
    /// With `channels == None` the channel count is the ring buffer's
    /// element length.
    fn play_ringbuffer(
        &mut self,
        reader: RingReader<f32>,
        channels: Option<Channels>,
        start: u64,
        allow_belated: bool,
    ) -> MixerResult<ActionHandle>;
}

/// Scheduling of input actions
pub trait Recorder {
    /// Record into `buffer` until it is full. The buffer comes back through
    /// [`crate::messaging::action::FinishedAction::into_recording`].
    fn record_buffer(
        &mut self,
        buffer: Vec<f32>,
        channels: impl Into<Channels>,
        start: u64,
        allow_belated: bool,
    ) -> MixerResult<ActionHandle>;

    /// Record frames into a ring buffer until cancelled
    fn record_ringbuffer(
        &mut self,
        writer: RingWriter<f32>,
        channels: Option<Channels>,
        start: u64,
        allow_belated: bool,
    ) -> MixerResult<ActionHandle>;
}
