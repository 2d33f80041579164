// Actions - enregistrements échangés entre le contrôle et le callback
//
// An Action is allocated on the control thread, travels to the audio thread
// through the command queue, is advanced block by block by the executor, and
// comes back through the result queue once it reached a terminal state.
// Only the control thread frees it.

use std::fmt;
use std::sync::Arc;

use crate::audio::diagnostics::BlockStats;
use crate::ringbuffer::{RingReader, RingWriter};

/// Total frame count of ring-buffer-backed actions (they never self-complete)
pub const UNLIMITED_FRAMES: u64 = u64::MAX;

/// Opaque action identifier. Ordering follows submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionHandle(pub(crate) u64);

impl ActionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    PlayBuffer,
    PlayRingBuffer,
    RecordBuffer,
    RecordRingBuffer,
    Cancel,
    FetchAndResetStats,
}

/// Lifecycle: `Queued → Active → {Completed | Cancelled | CancelledByTimeout}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Queued,
    Active,
    Completed,
    Cancelled,
    /// Start time had passed and belated starts were not allowed
    CancelledByTimeout,
}

impl ActionState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionState::Completed | ActionState::Cancelled | ActionState::CancelledByTimeout
        )
    }
}

/// Channels used by an action: a count `n` (device channels `1..=n`) or an
/// explicit 1-based mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channels {
    Count(usize),
    Mapping(Vec<usize>),
}

impl Channels {
    pub fn len(&self) -> usize {
        match self {
            Channels::Count(n) => *n,
            Channels::Mapping(mapping) => mapping.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_mapping(self) -> Vec<usize> {
        match self {
            Channels::Count(n) => (1..=n).collect(),
            Channels::Mapping(mapping) => mapping,
        }
    }
}

impl From<usize> for Channels {
    fn from(count: usize) -> Self {
        Channels::Count(count)
    }
}

impl From<Vec<usize>> for Channels {
    fn from(mapping: Vec<usize>) -> Self {
        Channels::Mapping(mapping)
    }
}

impl From<&[usize]> for Channels {
    fn from(mapping: &[usize]) -> Self {
        Channels::Mapping(mapping.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Channels {
    fn from(mapping: [usize; N]) -> Self {
        Channels::Mapping(mapping.to_vec())
    }
}

pub(crate) enum Payload {
    PlayBuffer(Arc<[f32]>),
    PlayRingBuffer(RingReader<f32>),
    RecordBuffer(Vec<f32>),
    RecordRingBuffer(RingWriter<f32>),
    Cancel(ActionHandle),
    /// Filled by the executor when the action fires
    FetchAndResetStats(BlockStats),
}

impl Payload {
    fn kind(&self) -> ActionKind {
        match self {
            Payload::PlayBuffer(_) => ActionKind::PlayBuffer,
            Payload::PlayRingBuffer(_) => ActionKind::PlayRingBuffer,
            Payload::RecordBuffer(_) => ActionKind::RecordBuffer,
            Payload::RecordRingBuffer(_) => ActionKind::RecordRingBuffer,
            Payload::Cancel(_) => ActionKind::Cancel,
            Payload::FetchAndResetStats(_) => ActionKind::FetchAndResetStats,
        }
    }
}

/// One scheduled operation.
///
/// Fields written by the executor (`done_frames`, `actual_time`, `state`,
/// `stats`, the record payloads) are only touched on the audio thread while
/// the action is in flight, and only read back on the control thread after
/// it came out of the result queue.
pub struct Action {
    pub(crate) handle: ActionHandle,
    /// Absolute stream time in frames, 0 = as soon as possible
    pub(crate) requested_time: u64,
    pub(crate) allow_belated: bool,
    /// 1-based device channels
    pub(crate) mapping: Vec<usize>,
    pub(crate) payload: Payload,
    pub(crate) total_frames: u64,
    pub(crate) done_frames: u64,
    pub(crate) actual_time: Option<u64>,
    pub(crate) state: ActionState,
    pub(crate) stats: BlockStats,
}

impl Action {
    pub(crate) fn new(
        handle: ActionHandle,
        payload: Payload,
        mapping: Vec<usize>,
        requested_time: u64,
        allow_belated: bool,
    ) -> Self {
        let channels = mapping.len().max(1) as u64;
        let total_frames = match &payload {
            Payload::PlayBuffer(buffer) => buffer.len() as u64 / channels,
            Payload::RecordBuffer(buffer) => buffer.len() as u64 / channels,
            Payload::PlayRingBuffer(_) | Payload::RecordRingBuffer(_) => UNLIMITED_FRAMES,
            Payload::Cancel(_) | Payload::FetchAndResetStats(_) => 0,
        };

        Self {
            handle,
            requested_time,
            allow_belated,
            mapping,
            payload,
            total_frames,
            done_frames: 0,
            actual_time: None,
            state: ActionState::Queued,
            stats: BlockStats::default(),
        }
    }

    pub fn handle(&self) -> ActionHandle {
        self.handle
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("handle", &self.handle)
            .field("kind", &self.kind())
            .field("requested_time", &self.requested_time)
            .field("allow_belated", &self.allow_belated)
            .field("mapping", &self.mapping)
            .field("total_frames", &self.total_frames)
            .field("done_frames", &self.done_frames)
            .field("state", &self.state)
            .finish()
    }
}

/// What the control side gets back, besides the bookkeeping, once an action
/// has been retired.
#[derive(Debug)]
pub enum ReturnedPayload {
    None,
    Recording(Vec<f32>),
    RingReader(RingReader<f32>),
    RingWriter(RingWriter<f32>),
    Stats(BlockStats),
}

/// A retired action, as observed by the control thread.
#[derive(Debug)]
pub struct FinishedAction {
    pub handle: ActionHandle,
    pub kind: ActionKind,
    pub state: ActionState,
    pub requested_time: u64,
    /// Frame at which execution began, `None` if it never started
    pub actual_time: Option<u64>,
    pub done_frames: u64,
    pub stats: BlockStats,
    pub payload: ReturnedPayload,
}

impl FinishedAction {
    /// Recorded samples of a `RecordBuffer` action
    pub fn into_recording(self) -> Option<Vec<f32>> {
        match self.payload {
            ReturnedPayload::Recording(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn into_ring_reader(self) -> Option<RingReader<f32>> {
        match self.payload {
            ReturnedPayload::RingReader(reader) => Some(reader),
            _ => None,
        }
    }

    pub fn into_ring_writer(self) -> Option<RingWriter<f32>> {
        match self.payload {
            ReturnedPayload::RingWriter(writer) => Some(writer),
            _ => None,
        }
    }

    /// Executor block statistics carried by a `FetchAndResetStats` action
    pub fn engine_block_stats(&self) -> Option<BlockStats> {
        match self.payload {
            ReturnedPayload::Stats(stats) => Some(stats),
            _ => None,
        }
    }
}

impl From<Box<Action>> for FinishedAction {
    fn from(action: Box<Action>) -> Self {
        let Action {
            handle,
            requested_time,
            payload,
            done_frames,
            actual_time,
            state,
            stats,
            ..
        } = *action;
        let kind = payload.kind();

        // Play buffers are shared with the caller, our reference goes away here
        let payload = match payload {
            Payload::PlayBuffer(_) | Payload::Cancel(_) => ReturnedPayload::None,
            Payload::RecordBuffer(buffer) => ReturnedPayload::Recording(buffer),
            Payload::PlayRingBuffer(reader) => ReturnedPayload::RingReader(reader),
            Payload::RecordRingBuffer(writer) => ReturnedPayload::RingWriter(writer),
            Payload::FetchAndResetStats(stats) => ReturnedPayload::Stats(stats),
        };

        Self {
            handle,
            kind,
            state,
            requested_time,
            actual_time,
            done_frames,
            stats,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ringbuffer::RingBuffer;

    #[test]
    fn test_total_frames_from_buffer_length() {
        let buffer: Arc<[f32]> = vec![0.0; 10].into();
        let action = Action::new(
            ActionHandle(1),
            Payload::PlayBuffer(buffer),
            vec![1, 2],
            0,
            true,
        );
        assert_eq!(action.total_frames(), 5);
        assert_eq!(action.kind(), ActionKind::PlayBuffer);
        assert_eq!(action.state, ActionState::Queued);

        // Partial trailing frame is not played
        let action = Action::new(
            ActionHandle(2),
            Payload::RecordBuffer(vec![0.0; 7]),
            vec![1, 2, 3],
            0,
            true,
        );
        assert_eq!(action.total_frames(), 2);
    }

    #[test]
    fn test_ringbuffer_actions_are_unlimited() {
        let (_writer, reader) = RingBuffer::<f32>::new(8).unwrap().split();
        let action = Action::new(
            ActionHandle(3),
            Payload::PlayRingBuffer(reader),
            vec![1],
            0,
            true,
        );
        assert_eq!(action.total_frames(), UNLIMITED_FRAMES);
    }

    #[test]
    fn test_channels_into_mapping() {
        assert_eq!(Channels::from(3).into_mapping(), vec![1, 2, 3]);
        assert_eq!(Channels::from([4, 2]).into_mapping(), vec![4, 2]);
        assert!(Channels::from(0).is_empty());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ActionState::Queued.is_terminal());
        assert!(!ActionState::Active.is_terminal());
        assert!(ActionState::Completed.is_terminal());
        assert!(ActionState::Cancelled.is_terminal());
        assert!(ActionState::CancelledByTimeout.is_terminal());
    }

    #[test]
    fn test_finished_action_hands_back_recording() {
        let mut action = Box::new(Action::new(
            ActionHandle(4),
            Payload::RecordBuffer(vec![0.0; 4]),
            vec![1],
            0,
            true,
        ));
        action.state = ActionState::Completed;
        action.done_frames = 4;

        let finished = FinishedAction::from(action);
        assert_eq!(finished.kind, ActionKind::RecordBuffer);
        assert_eq!(finished.state, ActionState::Completed);
        assert_eq!(finished.into_recording(), Some(vec![0.0; 4]));
    }
}
