//! Store key generation.
//!
//! A key is `{yyyyMMddHHmmssfff}-{seq:0000}-{fingerprint}.{ext}`. The timestamp
//! and the rolling sequence are packed into one atomic counter
//! (`ms * SEQUENCE_MODULUS + seq`) that only ever moves forward, so two keys
//! minted by the same instance are distinct and sort in the order they were
//! minted. When the sequence wraps inside one millisecond the timestamp part
//! simply advances by one.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::clock::{from_unix_ms, Clock};
use crate::core::message::format_timestamp;

pub const SEQUENCE_MODULUS: u64 = 9000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub timestamp_ms: i64,
    pub sequence: u16,
}

#[derive(Debug, Default)]
pub struct KeySequencer {
    last: AtomicU64,
}

impl KeySequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints the next key position for wall-clock time `now_ms`.
    pub fn next(&self, now_ms: i64) -> Key {
        let floor = (now_ms.max(0) as u64).saturating_mul(SEQUENCE_MODULUS);
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let candidate = if current == 0 && floor == 0 {
                1
            } else {
                floor.max(current + 1)
            };
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Key {
                        timestamp_ms: (candidate / SEQUENCE_MODULUS) as i64,
                        sequence: (candidate % SEQUENCE_MODULUS) as u16,
                    }
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn next_from(&self, clock: &dyn Clock) -> Key {
        self.next(clock.now_ms())
    }
}

impl Key {
    pub fn file_name(&self, fingerprint: &str, extension: &str) -> String {
        format!(
            "{}-{:04}-{}.{}",
            format_timestamp(from_unix_ms(self.timestamp_ms)),
            self.sequence,
            fingerprint,
            extension
        )
    }
}
