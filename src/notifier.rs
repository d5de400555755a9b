// =============================================================================
// Notifier — fire-and-forget operator notifications
// =============================================================================
//
// The core never blocks on a notification: `notify` pushes onto an unbounded
// channel and returns immediately; a background dispatcher drains the channel
// into whatever sink is configured. A failed or closed sink loses messages,
// never trading.
// =============================================================================

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// One queued notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub severity: Severity,
    pub message: String,
    pub tags: Vec<String>,
    pub at: DateTime<Utc>,
}

/// Cheap clonable handle held by every subsystem.
#[derive(Clone)]
pub struct NotifyHandle {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotifyHandle {
    /// Create a handle plus the receiving end for a dispatcher task.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a notification. Never blocks, never fails the caller: when the
    /// dispatcher is gone the message is dropped.
    pub fn notify(&self, severity: Severity, message: impl Into<String>, tags: &[&str]) {
        let n = Notification {
            severity,
            message: message.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            at: Utc::now(),
        };
        let _ = self.tx.send(n);
    }
}

impl std::fmt::Debug for NotifyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyHandle").finish()
    }
}

/// Where drained notifications go.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, n: &Notification);
}

/// Default sink: structured log lines. An operator chat transport implements
/// the same trait and swaps in here.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, n: &Notification) {
        match n.severity {
            Severity::Info => info!(tags = ?n.tags, "{}", n.message),
            Severity::Warning => warn!(tags = ?n.tags, "{}", n.message),
            Severity::Critical => error!(tags = ?n.tags, "{}", n.message),
        }
    }
}

/// Drain the queue into `sink` until every handle is dropped.
pub async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    sink: Box<dyn NotificationSink>,
) {
    while let Some(n) = rx.recv().await {
        sink.deliver(&n);
    }
    info!("notification dispatcher stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct CollectingSink(Arc<Mutex<Vec<Notification>>>);

    impl NotificationSink for CollectingSink {
        fn deliver(&self, n: &Notification) {
            self.0.lock().push(n.clone());
        }
    }

    #[tokio::test]
    async fn notifications_flow_through_dispatcher() {
        let (handle, rx) = NotifyHandle::channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(CollectingSink(seen.clone()));

        handle.notify(Severity::Warning, "drawdown nearing limit", &["safestop"]);
        handle.notify(Severity::Critical, "journal poisoned", &["wal", "fatal"]);
        drop(handle);

        run_dispatcher(rx, sink).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].severity, Severity::Warning);
        assert_eq!(seen[1].tags, vec!["wal", "fatal"]);
    }

    #[test]
    fn notify_never_fails_without_dispatcher() {
        let (handle, rx) = NotifyHandle::channel();
        drop(rx);
        // Must not panic or block even though nobody is listening.
        handle.notify(Severity::Info, "orphaned message", &[]);
    }
}
