// Notifications du stream - erreurs et événements hors callback temps-réel

use std::time::{SystemTime, UNIX_EPOCH};

/// Severity of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Stream event reported to the control thread.
///
/// Built outside the audio callback only (stream setup, cpal error
/// callback), since it owns a `String`.
#[derive(Debug, Clone)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
}

impl Notification {
    pub fn new(level: NotificationLevel, message: String) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Self {
            level,
            message,
            timestamp,
        }
    }

    pub fn info(message: String) -> Self {
        Self::new(NotificationLevel::Info, message)
    }

    pub fn warning(message: String) -> Self {
        Self::new(NotificationLevel::Warning, message)
    }

    pub fn error(message: String) -> Self {
        Self::new(NotificationLevel::Error, message)
    }
}
