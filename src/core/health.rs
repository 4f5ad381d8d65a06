use std::sync::{Arc, Mutex};

use log::{error, warn};

use crate::core::Error;

/// Tri-state health of a queue instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueueState {
    /// Normal operation.
    Running,
    /// A housekeeping operation failed; the queue keeps working.
    Cautioned,
    /// The queue hit an unrecoverable error and refuses work until cleared.
    Failed,
}

/// Shared health cell. The last error is kept for inspection until cleared.
#[derive(Debug, Clone)]
pub struct Health {
    name: Arc<str>,
    inner: Arc<Mutex<HealthInner>>,
}

#[derive(Debug)]
struct HealthInner {
    state: QueueState,
    error: Option<Arc<Error>>,
}

impl Health {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            inner: Arc::new(Mutex::new(HealthInner {
                state: QueueState::Running,
                error: None,
            })),
        }
    }

    pub fn state(&self) -> QueueState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(QueueState::Failed)
    }

    pub fn error(&self) -> Option<Arc<Error>> {
        self.inner.lock().ok().and_then(|inner| inner.error.clone())
    }

    /// Records a recoverable error. Never downgrades a failed queue.
    pub fn caution(&self, err: Error) {
        warn!("queue {}: cautioned: {err}", self.name);
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state != QueueState::Failed {
                inner.state = QueueState::Cautioned;
            }
            inner.error = Some(Arc::new(err));
        }
    }

    pub fn fail(&self, err: Error) {
        error!("queue {}: failed: {err}", self.name);
        if let Ok(mut inner) = self.inner.lock() {
            inner.state = QueueState::Failed;
            inner.error = Some(Arc::new(err));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.state = QueueState::Running;
            inner.error = None;
        }
    }

    /// Errors with `Error::Failed` while the queue is in the failed state.
    pub fn ensure_usable(&self) -> crate::core::Result<()> {
        match self.state() {
            QueueState::Failed => Err(Error::Failed(
                self.error()
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| "unknown error".to_string()),
            )),
            _ => Ok(()),
        }
    }
}
