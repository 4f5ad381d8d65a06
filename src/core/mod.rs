//! Durable queue engine: record codec, directory-backed store, key sequencing,
//! wake signalling and housekeeping shared by the inbound and outbound queues.

pub mod address;
pub mod audit;
pub mod clock;
pub mod error;
pub mod health;
mod housekeeper;
pub mod message;
pub mod record;
pub mod sequencer;
pub mod store;
pub mod wait;

pub use address::{Address, TransportKind};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use health::{Health, QueueState};
pub use housekeeper::Housekeeper;
pub use message::{Message, Payload};
pub use record::Record;
pub use sequencer::{Key, KeySequencer, SEQUENCE_MODULUS};
pub use store::Store;
pub use wait::Signal;
