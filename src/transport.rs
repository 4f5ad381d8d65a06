//! Delivery boundary between the outbound queue and whatever moves bytes.
//!
//! Network and named-pipe hosts live outside this crate; they implement
//! [`Transport`] for sending and call
//! [`MessageQueue::deliver_inbound`](crate::queue::MessageQueue::deliver_inbound)
//! for arrivals. [`LocalTransport`] routes between queues in one process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use log::debug;

use crate::core::{Address, Error, Message, Result};
use crate::inbound::InboundQueue;

pub trait Transport: Send + Sync {
    /// Hands `message` to the endpoint at `to`. Any error counts as a failed
    /// attempt and the message is retried.
    fn deliver(&self, to: &Address, message: &Message) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn deliver(&self, to: &Address, message: &Message) -> Result<()> {
        (**self).deliver(to, message)
    }
}

/// In-process router from endpoint address to inbound queue.
///
/// An endpoint registered with a `Both` address is reachable through its
/// TCP pair and through its pipe name.
#[derive(Default)]
pub struct LocalTransport {
    routes: RwLock<HashMap<String, Weak<InboundQueue>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: &Address, inbound: &Arc<InboundQueue>) -> Result<()> {
        let mut routes = self
            .routes
            .write()
            .map_err(|_| Error::Corrupt("route table lock poisoned"))?;
        for key in route_keys(address) {
            routes.insert(key, Arc::downgrade(inbound));
        }
        Ok(())
    }

    pub fn unregister(&self, address: &Address) -> Result<()> {
        let mut routes = self
            .routes
            .write()
            .map_err(|_| Error::Corrupt("route table lock poisoned"))?;
        for key in route_keys(address) {
            routes.remove(&key);
        }
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn deliver(&self, to: &Address, message: &Message) -> Result<()> {
        let target = {
            let routes = self
                .routes
                .read()
                .map_err(|_| Error::Corrupt("route table lock poisoned"))?;
            route_keys(to)
                .iter()
                .find_map(|key| routes.get(key).and_then(Weak::upgrade))
        };
        let inbound =
            target.ok_or_else(|| Error::Delivery(format!("no local endpoint for {to}")))?;
        debug!("local delivery of {} to {}", message.id, inbound.name());
        inbound.enqueue(message.clone())
    }
}

fn route_keys(address: &Address) -> Vec<String> {
    let mut keys = Vec::with_capacity(2);
    if address.transport.has_tcp() {
        if let Some(ip) = address.ip {
            keys.push(format!("tcp:{ip}:{}", address.port));
        }
    }
    if address.transport.has_pipe() {
        if let Some(pipe) = &address.pipe_name {
            keys.push(format!("np:{pipe}"));
        }
    }
    keys
}
