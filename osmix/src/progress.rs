//! Progress reporting and cooperative cancellation for long operations.
//!
//! Handles are passed explicitly through APIs; there is no global registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Ready,
    Error,
    Debug,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub severity: Severity,
    pub timestamp: SystemTime,
}

type Listener = dyn Fn(&ProgressEvent) + Send + Sync;

/// Progress listener plus abort flag. Cheap to clone; clones share the
/// abort flag.
#[derive(Clone, Default)]
pub struct Progress {
    listener: Option<Arc<Listener>>,
    cancelled: Arc<AtomicBool>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(listener: impl Fn(&ProgressEvent) + Send + Sync + 'static) -> Self {
        Progress {
            listener: Some(Arc::new(listener)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag; set it from any thread to request an abort at the next
    /// blob or block boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn emit(&self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Info | Severity::Ready => log::info!("{message}"),
            Severity::Error => log::error!("{message}"),
            Severity::Debug => log::debug!("{message}"),
        }
        if let Some(listener) = &self.listener {
            listener(&ProgressEvent {
                message,
                severity,
                timestamp: SystemTime::now(),
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_listener_receives_events() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let progress = Progress::with_listener(move |event| {
            assert_eq!(event.severity, Severity::Info);
            counter.fetch_add(1, Ordering::Relaxed);
        });
        progress.emit(Severity::Info, "reading");
        progress.emit(Severity::Info, "done");
        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_cancel_is_shared() {
        let progress = Progress::new();
        let flag = progress.cancel_flag();
        assert!(!progress.is_cancelled());
        flag.store(true, Ordering::Relaxed);
        assert!(progress.is_cancelled());
    }
}
