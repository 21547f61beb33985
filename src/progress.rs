use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadStatus {
    NotStarted,
    Started,
    Downloading,
    Decompressing,
    Preparing,
    Preloaded,
    Failed,
    Cancelled,
}

impl PreloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PreloadStatus::Preloaded | PreloadStatus::Failed | PreloadStatus::Cancelled
        )
    }
}

impl fmt::Display for PreloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PreloadStatus::NotStarted => "not_started",
            PreloadStatus::Started => "started",
            PreloadStatus::Downloading => "downloading",
            PreloadStatus::Decompressing => "decompressing",
            PreloadStatus::Preparing => "preparing",
            PreloadStatus::Preloaded => "preloaded",
            PreloadStatus::Failed => "failed",
            PreloadStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Snapshot of one item handed to observers. `progress` is `None` while
/// the current stage cannot tell how far it got.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreloadState {
    pub identifier: String,
    pub status: PreloadStatus,
    pub progress: Option<f64>,
    pub message: String,
    pub error: Option<String>,
}

pub trait PreloadObserver: Send + Sync {
    fn notify(&self, state: &PreloadState);
}

/// Renders every state change as a log event.
pub struct LogObserver;

impl PreloadObserver for LogObserver {
    fn notify(&self, state: &PreloadState) {
        let progress = state
            .progress
            .map(|value| format!("{:.2}%", value * 100.0))
            .unwrap_or_else(|| "-".to_string());
        info!(
            data_id = %state.identifier,
            status = %state.status,
            progress = %progress,
            "{}",
            state.message
        );
    }
}

/// Live state of one preload item.
///
/// Progress never decreases and stays in `[0, 1]`; once a terminal status
/// is reached every further update is ignored.
pub struct ItemProgress {
    inner: Mutex<Tracked>,
    observers: Mutex<Vec<Arc<dyn PreloadObserver>>>,
}

struct Tracked {
    state: PreloadState,
    high_water: f64,
}

impl ItemProgress {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Tracked {
                state: PreloadState {
                    identifier: identifier.into(),
                    status: PreloadStatus::NotStarted,
                    progress: Some(0.0),
                    message: "Preloading not started yet.".to_string(),
                    error: None,
                },
                high_water: 0.0,
            }),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn PreloadObserver>) {
        lock(&self.observers).push(observer);
    }

    pub fn snapshot(&self) -> PreloadState {
        lock(&self.inner).state.clone()
    }

    pub fn status(&self) -> PreloadStatus {
        lock(&self.inner).state.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Applies an update and notifies observers. Returns false when the
    /// item is already terminal and the update was dropped.
    pub fn update(
        &self,
        status: PreloadStatus,
        progress: Option<f64>,
        message: impl Into<String>,
    ) -> bool {
        self.apply(status, progress, message.into(), None)
    }

    pub fn fail(&self, message: impl Into<String>, error: impl fmt::Display) -> bool {
        self.apply(
            PreloadStatus::Failed,
            None,
            message.into(),
            Some(error.to_string()),
        )
    }

    pub fn cancel(&self, message: impl Into<String>) -> bool {
        self.apply(PreloadStatus::Cancelled, None, message.into(), None)
    }

    fn apply(
        &self,
        status: PreloadStatus,
        progress: Option<f64>,
        message: String,
        error: Option<String>,
    ) -> bool {
        let snapshot = {
            let mut tracked = lock(&self.inner);
            if tracked.state.status.is_terminal() {
                return false;
            }
            let progress = match progress {
                Some(value) => {
                    let value = value.clamp(0.0, 1.0).max(tracked.high_water);
                    tracked.high_water = value;
                    Some(value)
                }
                None if status.is_terminal() => Some(tracked.high_water),
                None => None,
            };
            tracked.state.status = status;
            tracked.state.progress = progress;
            tracked.state.message = message;
            tracked.state.error = error;
            tracked.state.clone()
        };
        let observers = lock(&self.observers).clone();
        for observer in observers {
            observer.notify(&snapshot);
        }
        true
    }
}

/// Cooperative cancellation flag shared by the stages of one batch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
