//! Consumer-side queue.
//!
//! Holds delivered-but-unprocessed messages under `{root}/in`. Consumers block
//! in [`receive`](InboundQueue::receive) (auto-acknowledge) or
//! [`accept`](InboundQueue::accept) (hold until
//! [`acknowledge`](InboundQueue::acknowledge) or
//! [`reenqueue`](InboundQueue::reenqueue)).
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use filemq::config::QueueConfig;
//! use filemq::inbound::InboundQueue;
//!
//! let queue = InboundQueue::open("orders", &QueueConfig::new("/var/lib/orders"))?;
//! if let Some(msg) = queue.accept(Some(Duration::from_secs(1)))? {
//!     // process, then retire it
//!     queue.acknowledge(&msg)?;
//! }
//! # Ok::<(), filemq::Error>(())
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::QueueConfig;
use crate::core::audit::AuditLog;
use crate::core::clock::{truncate_ms, unix_ms};
use crate::core::{
    Clock, Error, Health, Housekeeper, KeySequencer, Message, QueueState, Result, Signal, Store,
    SystemClock,
};

pub const INBOUND_EXTENSION: &str = "imq";
const READ_LOG_PREFIX: &str = "read";

pub struct InboundQueue {
    name: String,
    store: Store<Message>,
    sequencer: KeySequencer,
    signal: Signal,
    running: AtomicBool,
    read_log: Option<AuditLog>,
    housekeeper: Option<Housekeeper>,
    health: Health,
    clock: Arc<dyn Clock>,
}

impl InboundQueue {
    pub fn open(name: &str, config: &QueueConfig) -> Result<Self> {
        Self::open_with_clock(name, config, Arc::new(SystemClock))
    }

    /// Opens the queue and recovers any backlog left in `{root}/in`.
    ///
    /// Any failure here is fatal: it is logged and returned, and no queue is
    /// produced.
    pub fn open_with_clock(name: &str, config: &QueueConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let health = Health::new(name);
        Self::build(name, config, clock, health.clone()).map_err(|err| {
            let msg = err.to_string();
            health.fail(err);
            Error::Failed(msg)
        })
    }

    fn build(
        name: &str,
        config: &QueueConfig,
        clock: Arc<dyn Clock>,
        health: Health,
    ) -> Result<Self> {
        config.validate()?;
        let store = Store::open(config.in_dir(), INBOUND_EXTENSION)?;
        let (read_log, housekeeper) = if config.persist_read_logs {
            let log = AuditLog::open(config.read_dir(), READ_LOG_PREFIX)?;
            let keeper = Housekeeper::spawn(
                &format!("{name}-in"),
                vec![log.dir().to_path_buf()],
                config.read_log_retention(),
                config.cleanup_interval(),
                Arc::clone(&clock),
                health.clone(),
            )?;
            (Some(log), Some(keeper))
        } else {
            (None, None)
        };

        let queue = Self {
            name: name.to_string(),
            store,
            sequencer: KeySequencer::new(),
            signal: Signal::new(),
            running: AtomicBool::new(true),
            read_log,
            housekeeper,
            health,
            clock,
        };
        if !queue.store.is_empty() {
            info!(
                "inbound {}: {} messages pending from previous run",
                queue.name,
                queue.store.count()
            );
            queue.signal.notify()?;
        }
        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> usize {
        self.store.count()
    }

    pub fn corrupt_count(&self) -> u64 {
        self.store.corrupt_count()
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.store.keys()
    }

    pub fn state(&self) -> QueueState {
        self.health.state()
    }

    pub fn state_error(&self) -> Option<Arc<Error>> {
        self.health.error()
    }

    pub fn clear_state(&self) {
        self.health.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Durably stores an arriving message and wakes blocked consumers.
    ///
    /// The key is built from the arrival time, a per-instance rolling
    /// sequence, and the sender fingerprint; `received` is set to the arrival
    /// time.
    pub fn enqueue(&self, mut message: Message) -> Result<()> {
        self.health.ensure_usable()?;
        message.validate()?;
        let now = self.clock.now();
        message.received = truncate_ms(now);
        let key = self
            .sequencer
            .next(unix_ms(now))
            .file_name(&message.from.fingerprint(), INBOUND_EXTENSION);
        self.store.enqueue(&key, message)?;
        debug!("inbound {}: queued {key}", self.name);
        if self.is_running() {
            self.signal.notify()?;
        }
        Ok(())
    }

    /// Takes the oldest message and retires it: appends it to the read log and
    /// deletes its file. Blocks up to `timeout` (`None` waits forever).
    /// Returns `Ok(None)` on timeout or once the queue is stopped.
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.take(timeout, true)
    }

    /// Like [`receive`](Self::receive) but leaves the file in place. The
    /// message reappears after a restart unless acknowledged.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.take(timeout, false)
    }

    fn take(&self, timeout: Option<Duration>, log_read: bool) -> Result<Option<Message>> {
        self.health.ensure_usable()?;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if !self.is_running() {
                return Ok(None);
            }
            let seen = self.signal.epoch()?;
            let next = self.store.dequeue().map_err(|err| self.fatal(err))?;
            if let Some(message) = next {
                if log_read {
                    self.retire(&message);
                }
                return Ok(Some(message));
            }
            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    Some(deadline - now)
                }
            };
            if !self.signal.wait(seen, remaining)? {
                return Ok(None);
            }
        }
    }

    /// Retires an accepted message: read log entry plus file deletion.
    pub fn acknowledge(&self, message: &Message) -> Result<()> {
        self.health.ensure_usable()?;
        self.retire(message);
        Ok(())
    }

    /// Puts a message back at the tail for redelivery, under a fresh key.
    ///
    /// On error the message's previous file, if any, is still on disk and
    /// will be recovered on the next open.
    pub fn reenqueue(&self, message: Message) -> Result<()> {
        self.health.ensure_usable()?;
        message.validate()?;
        let key = self
            .sequencer
            .next_from(self.clock.as_ref())
            .file_name(&message.from.fingerprint(), INBOUND_EXTENSION);
        self.store.reenqueue(&key, message)?;
        if self.is_running() {
            self.signal.notify()?;
        }
        Ok(())
    }

    fn retire(&self, message: &Message) {
        let now = self.clock.now();
        if let Some(log) = &self.read_log {
            if let Err(err) = log.append(&message.to_flat_line(), now) {
                self.health.caution(err);
            }
        }
        if let Err(err) = self.store.remove(message) {
            self.health.caution(err);
        }
        if let Some(keeper) = &self.housekeeper {
            keeper.maybe_trigger(unix_ms(now));
        }
    }

    /// Requests an audit-log retention sweep now. Returns `false` when read
    /// logs are disabled or the queue is stopped.
    pub fn trigger_cleanup(&self) -> bool {
        match &self.housekeeper {
            Some(keeper) => keeper.trigger_now(self.clock.now_ms()),
            None => false,
        }
    }

    /// Retention sweeps finished so far.
    pub fn cleanup_passes(&self) -> u64 {
        self.housekeeper
            .as_ref()
            .map_or(0, Housekeeper::completed_passes)
    }

    /// Wakes every blocked consumer, stops further waits, and joins the
    /// housekeeping worker. Idempotent.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.signal.close()?;
        if let Some(keeper) = &self.housekeeper {
            keeper.stop()?;
        }
        info!("inbound {}: stopped with {} pending", self.name, self.count());
        Ok(())
    }

    fn fatal(&self, err: Error) -> Error {
        let msg = err.to_string();
        self.health.fail(err);
        Error::Failed(msg)
    }
}

impl Drop for InboundQueue {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Address, ManualClock};
    use std::fs;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;
    use time::macros::datetime;

    fn sender(last: u8) -> Address {
        Address::tcp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 8000)
    }

    fn msg(from: u8, body: &str) -> Message {
        Message::text(sender(from), "test.Body", body, datetime!(2024-03-24 14:21:05 UTC))
    }

    fn open(dir: &TempDir) -> InboundQueue {
        InboundQueue::open("test", &QueueConfig::new(dir.path())).unwrap()
    }

    #[test]
    fn receive_retires_file_and_writes_read_log() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        queue.enqueue(msg(1, "hello")).unwrap();
        assert_eq!(fs::read_dir(dir.path().join("in")).unwrap().count(), 1);

        let got = queue.receive(Some(Duration::from_millis(100))).unwrap().unwrap();
        assert_eq!(got.payload.as_text(), Some("hello"));
        assert!(!got.filename().unwrap().exists());

        let logs: Vec<_> = fs::read_dir(dir.path().join("read")).unwrap().collect();
        assert_eq!(logs.len(), 1);
        let text = fs::read_to_string(logs[0].as_ref().unwrap().path()).unwrap();
        assert!(text.contains(&got.id.to_string()));
    }

    #[test]
    fn enqueue_names_file_by_arrival_and_sender() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(datetime!(2024-03-24 14:21:05.412 UTC));
        let queue = InboundQueue::open_with_clock(
            "test",
            &QueueConfig::new(dir.path()),
            Arc::new(clock.clone()),
        )
        .unwrap();
        queue.enqueue(msg(7, "a")).unwrap();
        queue.enqueue(msg(7, "b")).unwrap();
        assert_eq!(
            queue.keys().unwrap(),
            [
                "20240324142105412-0000-010-000-000-007-08000.imq",
                "20240324142105412-0001-010-000-000-007-08000.imq",
            ]
        );
        let first = queue.accept(Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(first.received, datetime!(2024-03-24 14:21:05.412 UTC));
    }

    #[test]
    fn accept_then_acknowledge() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        queue.enqueue(msg(1, "held")).unwrap();

        let held = queue.accept(Some(Duration::from_millis(100))).unwrap().unwrap();
        let path = held.filename().unwrap().to_path_buf();
        assert!(path.exists());
        assert_eq!(queue.count(), 0);

        queue.acknowledge(&held).unwrap();
        assert!(!path.exists());
        assert_eq!(queue.state(), QueueState::Running);
    }

    #[test]
    fn reenqueue_goes_behind_waiting_messages() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        queue.enqueue(msg(1, "first")).unwrap();
        queue.enqueue(msg(2, "second")).unwrap();

        let first = queue.accept(Some(Duration::ZERO)).unwrap().unwrap();
        let old_path = first.filename().unwrap().to_path_buf();
        queue.reenqueue(first).unwrap();
        assert!(!old_path.exists());

        let order: Vec<String> = std::iter::from_fn(|| {
            queue
                .receive(Some(Duration::ZERO))
                .unwrap()
                .and_then(|m| m.payload.as_text().map(str::to_string))
        })
        .collect();
        assert_eq!(order, ["second", "first"]);
    }

    #[test]
    fn read_logs_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let mut config = QueueConfig::new(dir.path());
        config.persist_read_logs = false;
        let queue = InboundQueue::open("quiet", &config).unwrap();
        queue.enqueue(msg(1, "x")).unwrap();
        let got = queue.receive(Some(Duration::ZERO)).unwrap().unwrap();
        assert!(!got.filename().unwrap().exists());
        assert!(!dir.path().join("read").exists());
        assert!(!queue.trigger_cleanup());
    }

    #[cfg(unix)]
    #[test]
    fn audit_failure_cautions_but_still_retires() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        queue.enqueue(msg(1, "x")).unwrap();

        let read_dir = dir.path().join("read");
        fs::remove_dir_all(&read_dir).unwrap();
        fs::write(&read_dir, "not a directory").unwrap();

        let got = queue.receive(Some(Duration::ZERO)).unwrap().unwrap();
        assert!(!got.filename().unwrap().exists());
        assert_eq!(queue.state(), QueueState::Cautioned);
        assert!(queue.state_error().is_some());

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.cleanup_passes() < 1 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        queue.clear_state();
        assert_eq!(queue.state(), QueueState::Running);
    }

    #[test]
    fn stop_releases_blocked_receiver() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(open(&dir));
        let (tx, rx) = std::sync::mpsc::channel();
        let receiver = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            let got = receiver.receive(None).unwrap();
            tx.send(got.is_none()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        queue.stop().unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        handle.join().unwrap();
        assert!(queue.receive(None).unwrap().is_none());
    }

    #[test]
    fn rejects_unencodable_message() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        assert!(matches!(
            queue.enqueue(msg(1, "tab\there")),
            Err(Error::Unsupported(_))
        ));
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn open_fails_when_root_is_a_file() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("occupied");
        fs::write(&root, "not a directory").unwrap();
        let result = InboundQueue::open("test", &QueueConfig::new(&root));
        assert!(matches!(result, Err(Error::Failed(_))));
    }
}
