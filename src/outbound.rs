//! Producer-side queue.
//!
//! Messages waiting for delivery live under `{root}/out`, one `.omq` file each,
//! recording the destination ahead of the usual message record:
//!
//! ```text
//! to  id  from  sent  received  send_attempt  message_type_name  bin|str  payload
//! ```
//!
//! A single delivery thread drains the queue oldest-first through a
//! [`Transport`]. A failed attempt bumps `send_attempt`, rewrites the message
//! under a tail key and parks it until its backoff has passed. Parked messages
//! do not hold up the rest of the queue. Once `max_attempts` is reached the
//! message is moved to `{root}/failed`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::config::{QueueConfig, RetryPolicy};
use crate::core::audit::AuditLog;
use crate::core::clock::unix_ms;
use crate::core::record::Record;
use crate::core::store::{remove_file, write_durable};
use crate::core::{
    Address, Clock, Error, Health, Housekeeper, KeySequencer, Message, QueueState, Result, Signal,
    Store, SystemClock,
};
use crate::transport::Transport;

pub const OUTBOUND_EXTENSION: &str = "omq";
const SENT_LOG_PREFIX: &str = "sent";

/// A message paired with its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: Address,
    pub message: Message,
}

impl Record for OutboundMessage {
    fn encode(&self) -> String {
        format!("{}\t{}", self.to, self.message.encode())
    }

    fn decode(text: &str) -> Result<Self> {
        let (to, rest) = text
            .split_once('\t')
            .ok_or(Error::Corrupt("outbound record missing destination"))?;
        let to = to
            .parse()
            .map_err(|_| Error::Corrupt("invalid destination address"))?;
        Ok(Self {
            to,
            message: Message::decode(rest)?,
        })
    }

    fn set_backing_file(&mut self, path: Option<PathBuf>) {
        self.message.set_backing_file(path);
    }

    fn backing_file(&self) -> Option<&std::path::Path> {
        self.message.filename()
    }
}

/// A failed message sitting out its backoff. Its file is already at `key`.
struct Parked {
    not_before: Instant,
    key: String,
    item: OutboundMessage,
}

pub struct OutboundQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    name: String,
    store: Store<OutboundMessage>,
    parked: Mutex<Vec<Parked>>,
    sequencer: KeySequencer,
    signal: Signal,
    running: AtomicBool,
    sent_log: Option<AuditLog>,
    failed_dir: PathBuf,
    housekeeper: Option<Housekeeper>,
    retry: RetryPolicy,
    health: Health,
    clock: Arc<dyn Clock>,
}

impl OutboundQueue {
    pub fn open(name: &str, config: &QueueConfig) -> Result<Self> {
        Self::open_with_clock(name, config, Arc::new(SystemClock))
    }

    /// Opens the queue and recovers undelivered messages. Delivery does not
    /// start until [`start`](Self::start).
    pub fn open_with_clock(name: &str, config: &QueueConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let health = Health::new(name);
        let inner = Inner::build(name, config, clock, health.clone()).map_err(|err| {
            let msg = err.to_string();
            health.fail(err);
            Error::Failed(msg)
        })?;
        Ok(Self {
            inner: Arc::new(inner),
            worker: Mutex::new(None),
        })
    }

    /// Spawns the delivery thread. Calling it again while running is an error.
    pub fn start(&self, transport: Arc<dyn Transport>) -> Result<()> {
        self.inner.health.ensure_usable()?;
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| Error::Corrupt("outbound worker lock poisoned"))?;
        if worker.is_some() {
            return Err(Error::Unsupported("delivery loop already started"));
        }
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(format!("{}-delivery", self.inner.name))
            .spawn(move || inner.delivery_loop(transport.as_ref()))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Durably stores `message` for delivery to `to` and wakes the loop.
    pub fn enqueue(&self, to: Address, message: Message) -> Result<()> {
        self.inner.health.ensure_usable()?;
        message.validate()?;
        to.validate()?;
        let key = self
            .inner
            .sequencer
            .next_from(self.inner.clock.as_ref())
            .file_name(&to.fingerprint(), OUTBOUND_EXTENSION);
        self.inner
            .store
            .enqueue(&key, OutboundMessage { to, message })?;
        debug!("outbound {}: queued {key}", self.inner.name);
        if self.inner.running.load(Ordering::Acquire) {
            self.inner.signal.notify()?;
        }
        Ok(())
    }

    /// Undelivered messages, including ones waiting out a backoff.
    pub fn count(&self) -> usize {
        self.inner.store.count() + self.inner.parked().map_or(0, |parked| parked.len())
    }

    pub fn corrupt_count(&self) -> u64 {
        self.inner.store.corrupt_count()
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = self.inner.store.keys()?;
        keys.extend(self.inner.parked()?.iter().map(|parked| parked.key.clone()));
        keys.sort();
        Ok(keys)
    }

    pub fn state(&self) -> QueueState {
        self.inner.health.state()
    }

    pub fn state_error(&self) -> Option<Arc<Error>> {
        self.inner.health.error()
    }

    pub fn clear_state(&self) {
        self.inner.health.clear();
    }

    pub fn trigger_cleanup(&self) -> bool {
        match &self.inner.housekeeper {
            Some(keeper) => keeper.trigger_now(self.inner.clock.now_ms()),
            None => false,
        }
    }

    pub fn cleanup_passes(&self) -> u64 {
        self.inner
            .housekeeper
            .as_ref()
            .map_or(0, Housekeeper::completed_passes)
    }

    /// Halts the delivery loop. An in-flight delivery finishes first; anything
    /// still queued stays on disk for the next run. Idempotent.
    pub fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.signal.close()?;
        let handle = self
            .worker
            .lock()
            .map_err(|_| Error::Corrupt("outbound worker lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| Error::Failed("delivery thread panicked".to_string()))?;
        }
        if let Some(keeper) = &self.inner.housekeeper {
            keeper.stop()?;
        }
        info!(
            "outbound {}: stopped with {} undelivered",
            self.inner.name,
            self.count()
        );
        Ok(())
    }
}

impl Drop for OutboundQueue {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl Inner {
    fn build(
        name: &str,
        config: &QueueConfig,
        clock: Arc<dyn Clock>,
        health: Health,
    ) -> Result<Self> {
        config.validate()?;
        let store = Store::open(config.out_dir(), OUTBOUND_EXTENSION)?;
        let (sent_log, housekeeper) = if config.persist_read_logs {
            let log = AuditLog::open(config.sent_dir(), SENT_LOG_PREFIX)?;
            let keeper = Housekeeper::spawn(
                &format!("{name}-out"),
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
        if !store.is_empty() {
            info!(
                "outbound {name}: {} messages undelivered from previous run",
                store.count()
            );
        }
        Ok(Self {
            name: name.to_string(),
            store,
            parked: Mutex::new(Vec::new()),
            sequencer: KeySequencer::new(),
            signal: Signal::new(),
            running: AtomicBool::new(true),
            sent_log,
            failed_dir: config.failed_dir(),
            housekeeper,
            retry: config.retry.clone(),
            health,
            clock,
        })
    }

    fn delivery_loop(&self, transport: &dyn Transport) {
        debug!("outbound {}: delivery loop started", self.name);
        while self.running.load(Ordering::Acquire) {
            let seen = match self.signal.epoch() {
                Ok(seen) => seen,
                Err(err) => {
                    self.health.fail(err);
                    break;
                }
            };
            let next_due = match self.release_due(Instant::now()) {
                Ok(next_due) => next_due,
                Err(err) => {
                    self.health.fail(err);
                    break;
                }
            };
            match self.store.dequeue() {
                Ok(Some(item)) => self.deliver(transport, item),
                Ok(None) => {
                    let timeout = next_due.map(|at| at.saturating_duration_since(Instant::now()));
                    if let Err(err) = self.signal.wait(seen, timeout) {
                        self.health.fail(err);
                        break;
                    }
                }
                Err(err) => {
                    self.health.fail(err);
                    break;
                }
            }
        }
        debug!("outbound {}: delivery loop exited", self.name);
    }

    fn deliver(&self, transport: &dyn Transport, mut item: OutboundMessage) {
        match transport.deliver(&item.to, &item.message) {
            Ok(()) => {
                debug!("outbound {}: delivered {} to {}", self.name, item.message.id, item.to);
                self.retire(&item);
            }
            Err(err) => {
                item.message.send_attempt = item.message.send_attempt.saturating_add(1);
                let attempts = item.message.send_attempt;
                warn!(
                    "outbound {}: attempt {attempts} for {} to {} failed: {err}",
                    self.name, item.message.id, item.to
                );
                if self.retry.exhausted(attempts) {
                    self.dead_letter(item);
                    return;
                }
                self.park(item, attempts);
            }
        }
    }

    /// Requeues parked messages whose backoff has passed. Returns when the
    /// next one still parked becomes due.
    fn release_due(&self, now: Instant) -> Result<Option<Instant>> {
        let mut parked = self.parked()?;
        let (due, waiting): (Vec<_>, Vec<_>) =
            parked.drain(..).partition(|entry| entry.not_before <= now);
        *parked = waiting;
        for entry in due {
            self.store.restore(&entry.key, entry.item)?;
        }
        Ok(parked.iter().map(|entry| entry.not_before).min())
    }

    fn parked(&self) -> Result<std::sync::MutexGuard<'_, Vec<Parked>>> {
        self.parked
            .lock()
            .map_err(|_| Error::Corrupt("outbound parked lock poisoned"))
    }

    fn retire(&self, item: &OutboundMessage) {
        let now = self.clock.now();
        if let Some(log) = &self.sent_log {
            if let Err(err) = log.append(&item.message.to_flat_line(), now) {
                self.health.caution(err);
            }
        }
        if let Err(err) = self.store.remove(item) {
            self.health.caution(err);
        }
        if let Some(keeper) = &self.housekeeper {
            keeper.maybe_trigger(unix_ms(now));
        }
    }

    fn park(&self, item: OutboundMessage, attempts: u32) {
        let key = self
            .sequencer
            .next_from(self.clock.as_ref())
            .file_name(&item.to.fingerprint(), OUTBOUND_EXTENSION);
        let item = match self.store.rewrite(&key, item) {
            Ok(item) => item,
            Err(err) => {
                // A copy is still on disk and comes back on restart.
                self.health.caution(err);
                return;
            }
        };
        let not_before = Instant::now() + self.retry.backoff(attempts);
        match self.parked() {
            Ok(mut parked) => parked.push(Parked {
                not_before,
                key,
                item,
            }),
            Err(err) => self.health.fail(err),
        }
    }

    fn dead_letter(&self, item: OutboundMessage) {
        error!(
            "outbound {}: giving up on {} to {} after {} attempts",
            self.name, item.message.id, item.to, item.message.send_attempt
        );
        let name = item
            .backing_file()
            .and_then(|path| path.file_name())
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| format!("{}.{OUTBOUND_EXTENSION}", item.message.id).into());
        let moved = std::fs::create_dir_all(&self.failed_dir)
            .map_err(Error::from)
            .and_then(|_| write_durable(&self.failed_dir.join(name), item.encode().as_bytes()))
            .and_then(|_| match item.backing_file() {
                Some(path) => remove_file(path),
                None => Ok(()),
            });
        if let Err(err) = moved {
            self.health.caution(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use std::fs;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use time::macros::datetime;

    fn me() -> Address {
        Address::pipe("me")
    }

    fn peer() -> Address {
        Address::tcp(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)), 7000)
    }

    fn msg(body: &str) -> Message {
        Message::text(me(), "test.Body", body, datetime!(2024-03-24 14:21:05 UTC))
    }

    fn fast_config(dir: &TempDir, max_attempts: u32) -> QueueConfig {
        let mut config = QueueConfig::new(dir.path());
        config.retry = RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };
        config
    }

    struct Recorder {
        tx: Mutex<mpsc::Sender<(Address, Message)>>,
    }

    impl Transport for Recorder {
        fn deliver(&self, to: &Address, message: &Message) -> Result<()> {
            self.tx
                .lock()
                .unwrap()
                .send((to.clone(), message.clone()))
                .map_err(|_| Error::Delivery("recorder closed".to_string()))
        }
    }

    /// Fails the first `failures` attempts, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        tx: Mutex<mpsc::Sender<Message>>,
    }

    impl Transport for Flaky {
        fn deliver(&self, _to: &Address, message: &Message) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::AcqRel);
            if call < self.failures {
                return Err(Error::Delivery("peer unreachable".to_string()));
            }
            self.tx.lock().unwrap().send(message.clone()).unwrap();
            Ok(())
        }
    }

    struct Down;

    impl Transport for Down {
        fn deliver(&self, _to: &Address, _message: &Message) -> Result<()> {
            Err(Error::Delivery("down".to_string()))
        }
    }

    #[test]
    fn record_keeps_destination() {
        let item = OutboundMessage {
            to: peer(),
            message: msg("x"),
        };
        let line = item.encode();
        assert_eq!(line.split('\t').count(), 9);
        let decoded = OutboundMessage::decode(&line).unwrap();
        assert_eq!(decoded.to, peer());
        assert_eq!(decoded.message.id, item.message.id);
    }

    #[test]
    fn delivers_in_order_and_retires() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(datetime!(2024-03-24 14:21:05 UTC));
        let queue =
            OutboundQueue::open_with_clock("t", &fast_config(&dir, 3), Arc::new(clock)).unwrap();
        for body in ["a", "b", "c"] {
            queue.enqueue(peer(), msg(body)).unwrap();
        }
        assert_eq!(fs::read_dir(dir.path().join("out")).unwrap().count(), 3);

        let (tx, rx) = mpsc::channel();
        queue
            .start(Arc::new(Recorder { tx: Mutex::new(tx) }))
            .unwrap();
        let bodies: Vec<String> = (0..3)
            .map(|_| {
                let (to, m) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
                assert_eq!(to, peer());
                m.payload.as_text().unwrap().to_string()
            })
            .collect();
        assert_eq!(bodies, ["a", "b", "c"]);

        queue.stop().unwrap();
        assert_eq!(queue.count(), 0);
        assert_eq!(fs::read_dir(dir.path().join("out")).unwrap().count(), 0);
        assert_eq!(fs::read_dir(dir.path().join("sent")).unwrap().count(), 1);
    }

    #[test]
    fn failed_attempts_are_counted_and_retried() {
        let dir = TempDir::new().unwrap();
        let queue = OutboundQueue::open("t", &fast_config(&dir, 5)).unwrap();
        queue.enqueue(peer(), msg("retry")).unwrap();

        let (tx, rx) = mpsc::channel();
        queue
            .start(Arc::new(Flaky {
                failures: 2,
                calls: AtomicU32::new(0),
                tx: Mutex::new(tx),
            }))
            .unwrap();
        let delivered = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(delivered.send_attempt, 2);
        queue.stop().unwrap();
    }

    #[test]
    fn exhausted_messages_move_to_failed() {
        let dir = TempDir::new().unwrap();
        let queue = OutboundQueue::open("t", &fast_config(&dir, 2)).unwrap();
        queue.enqueue(peer(), msg("doomed")).unwrap();
        queue.start(Arc::new(Down)).unwrap();

        let failed_dir = dir.path().join("failed");
        let deadline = Instant::now() + Duration::from_secs(2);
        while !failed_dir.exists() || fs::read_dir(&failed_dir).unwrap().count() == 0 {
            assert!(Instant::now() < deadline, "message never dead-lettered");
            thread::sleep(Duration::from_millis(5));
        }
        queue.stop().unwrap();

        assert_eq!(fs::read_dir(dir.path().join("out")).unwrap().count(), 0);
        let entry = fs::read_dir(&failed_dir).unwrap().next().unwrap().unwrap();
        let record = OutboundMessage::decode(&fs::read_to_string(entry.path()).unwrap()).unwrap();
        assert_eq!(record.message.send_attempt, 2);
    }

    #[test]
    fn undelivered_messages_survive_restart() {
        let dir = TempDir::new().unwrap();
        {
            let queue = OutboundQueue::open("t", &fast_config(&dir, 3)).unwrap();
            queue.enqueue(peer(), msg("later")).unwrap();
            queue.stop().unwrap();
        }
        let queue = OutboundQueue::open("t", &fast_config(&dir, 3)).unwrap();
        assert_eq!(queue.count(), 1);

        let (tx, rx) = mpsc::channel();
        queue
            .start(Arc::new(Recorder { tx: Mutex::new(tx) }))
            .unwrap();
        let (to, m) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(to, peer());
        assert_eq!(m.payload.as_text(), Some("later"));
    }

    #[test]
    fn stop_interrupts_idle_loop() {
        let dir = TempDir::new().unwrap();
        let queue = OutboundQueue::open("t", &fast_config(&dir, 3)).unwrap();
        queue.start(Arc::new(Down)).unwrap();
        let start = Instant::now();
        queue.stop().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(matches!(queue.start(Arc::new(Down)), Err(Error::Stopped)));
    }

    #[test]
    fn open_fails_when_root_is_a_file() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("occupied");
        fs::write(&root, "not a directory").unwrap();
        let result = OutboundQueue::open("test", &QueueConfig::new(&root));
        assert!(matches!(result, Err(Error::Failed(_))));
    }
}
