// rtmixer - Library exports for binaries, tests and benchmarks

pub mod audio;
pub mod error;
pub mod messaging;
pub mod ringbuffer;
pub mod session;

// Re-export commonly used types for convenience
pub use audio::diagnostics::{BlockStats, CallbackLoad, EngineStats, EngineStatsSnapshot};
pub use audio::executor::Executor;
pub use audio::status::StreamStatus;
pub use audio::stream::MixerStream;
pub use error::{MixerError, MixerResult};
pub use messaging::action::{
    ActionHandle, ActionKind, ActionState, Channels, FinishedAction, ReturnedPayload,
};
pub use ringbuffer::{RingBuffer, RingReader, RingWriter};
pub use session::{Mixer, Recorder, Session, SessionConfig};
