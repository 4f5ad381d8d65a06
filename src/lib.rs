//! File-backed durable local message queue.
//!
//! Each endpoint owns a storage root holding one file per pending message.
//! File names sort in queue order, so the in-memory index is rebuilt from a
//! directory listing after a restart and no acknowledged work is lost.
//!
//! [`MessageQueue`] is the per-endpoint API. [`inbound::InboundQueue`] and
//! [`outbound::OutboundQueue`] can also be used on their own.

pub mod config;
pub mod core;
pub mod inbound;
pub mod outbound;
pub mod queue;
pub mod transport;

pub use crate::config::{QueueConfig, RetryPolicy};
pub use crate::core::{Address, Error, Message, Payload, QueueState, Result, TransportKind};
pub use crate::inbound::InboundQueue;
pub use crate::outbound::{OutboundMessage, OutboundQueue};
pub use crate::queue::MessageQueue;
pub use crate::transport::{LocalTransport, Transport};
