use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// A user-visible transient message (rename failed, persistence failed, ...).
#[derive(Clone, Debug)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Error, message)
    }

    fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Sink the engine pushes transient user-visible messages into.
pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, notification: Notification);
}

/// Bounded FIFO store of recent notifications, usable as a sink directly.
pub struct NotificationStore {
    entries: Mutex<Vec<Notification>>,
    max_entries: usize,
}

impl NotificationStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_entries,
        }
    }

    pub fn entries(&self) -> Vec<Notification> {
        self.entries.lock().clone()
    }

    pub fn error_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|n| n.level == NotificationLevel::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|n| n.level == NotificationLevel::Warning)
            .count()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl NotificationSink for NotificationStore {
    fn notify(&self, notification: Notification) {
        let mut entries = self.entries.lock();
        entries.push(notification);

        // FIFO eviction when exceeding max
        if entries.len() > self.max_entries {
            entries.remove(0);
        }
    }
}
