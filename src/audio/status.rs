// Status du stream audio - partagé entre le callback d'erreur et le contrôle

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Error = 3,
}

impl From<u8> for StreamStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => StreamStatus::Starting,
            2 => StreamStatus::Running,
            3 => StreamStatus::Error,
            _ => StreamStatus::Stopped,
        }
    }
}

/// Atomic wrapper to share the status between threads
#[derive(Clone)]
pub struct AtomicStreamStatus {
    inner: Arc<AtomicU8>,
}

impl AtomicStreamStatus {
    pub fn new(status: StreamStatus) -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(status as u8)),
        }
    }

    pub fn get(&self) -> StreamStatus {
        StreamStatus::from(self.inner.load(Ordering::Relaxed))
    }

    pub fn set(&self, status: StreamStatus) {
        self.inner.store(status as u8, Ordering::Relaxed);
    }
}

impl Default for AtomicStreamStatus {
    fn default() -> Self {
        Self::new(StreamStatus::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_shared_between_clones() {
        let status = AtomicStreamStatus::new(StreamStatus::Starting);
        let clone = status.clone();
        clone.set(StreamStatus::Error);
        assert_eq!(status.get(), StreamStatus::Error);
    }

    #[test]
    fn test_unknown_value_maps_to_stopped() {
        assert_eq!(StreamStatus::from(42), StreamStatus::Stopped);
        assert_eq!(StreamStatus::from(2), StreamStatus::Running);
    }
}
