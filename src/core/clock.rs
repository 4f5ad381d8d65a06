use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use time::{Duration, OffsetDateTime};

/// A source of wall-clock timestamps for the queue.
///
/// Keys, `received` stamps, audit-log buckets and the cleanup interval are all
/// derived from this clock, which lets tests move time forward deterministically.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current UTC time.
    fn now(&self) -> OffsetDateTime;

    /// Returns the current time in milliseconds since the UNIX epoch.
    fn now_ms(&self) -> i64 {
        unix_ms(self.now())
    }
}

/// A clock backed by `std::time::SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same instant, so a test can hand one clone to a queue and
/// advance the other.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now_ms: Arc::new(AtomicI64::new(unix_ms(start))),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        from_unix_ms(self.now_ms.load(Ordering::Acquire))
    }
}

pub fn unix_ms(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_unix_ms(ms: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::milliseconds(ms)
}

/// Drops sub-millisecond precision, matching what the record format can hold.
pub fn truncate_ms(at: OffsetDateTime) -> OffsetDateTime {
    from_unix_ms(unix_ms(at))
}
