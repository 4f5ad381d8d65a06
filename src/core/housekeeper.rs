use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use log::debug;

use crate::core::audit::sweep;
use crate::core::clock::Clock;
use crate::core::health::Health;
use crate::core::{Error, Result};

const NEVER: i64 = i64::MIN;

/// Owned background worker that expires audit logs.
///
/// Passes are requested with [`maybe_trigger`](Self::maybe_trigger), which is
/// cheap enough to call on every read: it only wakes the worker when more than
/// `interval` has passed since the last pass. [`stop`](Self::stop) lets a
/// running pass finish and joins the thread.
pub struct Housekeeper {
    interval: Duration,
    last_pass_ms: AtomicI64,
    completed: Arc<AtomicU64>,
    trigger: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Sweep {
    dirs: Vec<PathBuf>,
    retention: Duration,
    clock: Arc<dyn Clock>,
    health: Health,
    completed: Arc<AtomicU64>,
}

impl Housekeeper {
    pub fn spawn(
        name: &str,
        dirs: Vec<PathBuf>,
        retention: Duration,
        interval: Duration,
        clock: Arc<dyn Clock>,
        health: Health,
    ) -> Result<Self> {
        let completed = Arc::new(AtomicU64::new(0));
        let sweep = Sweep {
            dirs,
            retention,
            clock,
            health,
            completed: Arc::clone(&completed),
        };
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(format!("{name}-housekeeper"))
            .spawn(move || {
                for () in rx {
                    sweep.run();
                }
            })?;
        Ok(Self {
            interval,
            last_pass_ms: AtomicI64::new(NEVER),
            completed,
            trigger: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Requests a pass if more than `interval` has elapsed since the previous
    /// one. Returns whether a pass was requested.
    pub fn maybe_trigger(&self, now_ms: i64) -> bool {
        let interval_ms = self.interval.as_millis() as i64;
        let last = self.last_pass_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) <= interval_ms {
            return false;
        }
        if self
            .last_pass_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.send()
    }

    /// Requests a pass regardless of the interval.
    pub fn trigger_now(&self, now_ms: i64) -> bool {
        self.last_pass_ms.store(now_ms, Ordering::Release);
        self.send()
    }

    fn send(&self) -> bool {
        match self.trigger.lock() {
            Ok(guard) => guard.as_ref().map_or(false, |tx| tx.send(()).is_ok()),
            Err(_) => false,
        }
    }

    /// Passes finished since spawn.
    pub fn completed_passes(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn stop(&self) -> Result<()> {
        self.trigger
            .lock()
            .map_err(|_| Error::Corrupt("housekeeper lock poisoned"))?
            .take();
        let handle = self
            .handle
            .lock()
            .map_err(|_| Error::Corrupt("housekeeper lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                handle
                    .join()
                    .map_err(|_| Error::Failed("housekeeper thread panicked".to_string()))?;
            }
        }
        Ok(())
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl Sweep {
    fn run(&self) {
        let now = SystemTime::from(self.clock.now());
        for dir in &self.dirs {
            match sweep(dir, self.retention, now) {
                Ok(removed) if !removed.is_empty() => {
                    debug!("expired {} audit logs in {}", removed.len(), dir.display());
                }
                Ok(_) => {}
                Err(err) => self.health.caution(err),
            }
        }
        self.completed.fetch_add(1, Ordering::AcqRel);
    }
}
