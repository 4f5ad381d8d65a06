use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::core::{Error, Result};

/// Re-armable wake signal shared by producers and blocked consumers.
///
/// Waiters snapshot the epoch *before* checking for work and then sleep until
/// the epoch moves, so a notify that lands between the check and the sleep is
/// never lost. Closing the signal bumps the epoch one last time and makes every
/// current and future wait return immediately.
#[derive(Debug, Default)]
pub struct Signal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct SignalState {
    epoch: u64,
    closed: bool,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> Result<u64> {
        Ok(self.lock()?.epoch)
    }

    /// Wakes every waiter. A no-op once closed.
    pub fn notify(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.closed {
            return Ok(());
        }
        state.epoch = state.epoch.wrapping_add(1);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.closed = true;
        state.epoch = state.epoch.wrapping_add(1);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// Blocks until the epoch differs from `seen`, the signal is closed, or
    /// `timeout` elapses. Returns `true` if woken, `false` on timeout.
    pub fn wait(&self, seen: u64, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.lock()?;
        while state.epoch == seen && !state.closed {
            match deadline {
                None => {
                    state = self
                        .cond
                        .wait(state)
                        .map_err(|_| Error::Corrupt("signal lock poisoned"))?;
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    let (next, _) = self
                        .cond
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| Error::Corrupt("signal lock poisoned"))?;
                    state = next;
                }
            }
        }
        Ok(true)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SignalState>> {
        self.state
            .lock()
            .map_err(|_| Error::Corrupt("signal lock poisoned"))
    }
}
