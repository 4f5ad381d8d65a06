//! Per-endpoint facade over one inbound and one outbound queue.
//!
//! # Example
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use filemq::{Address, LocalTransport, MessageQueue, QueueConfig};
//!
//! let transport = Arc::new(LocalTransport::new());
//! let me = Address::pipe("billing");
//! let queue = MessageQueue::open("billing", me.clone(), &QueueConfig::new("/var/lib/billing"), transport.clone())?;
//! transport.register(&me, queue.inbound())?;
//!
//! let peer = Address::tcp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 8746);
//! queue.send(&peer, "invoice.Created", "{\"id\":42}")?;
//! while let Some(msg) = queue.receive(Some(Duration::from_secs(1)))? {
//!     println!("{} from {}", msg.message_type_name, msg.from);
//! }
//! # Ok::<(), filemq::Error>(())
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::Serialize;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::core::{
    Address, Clock, Error, Message, Payload, QueueState, Result, SystemClock, TransportKind,
};
use crate::inbound::InboundQueue;
use crate::outbound::OutboundQueue;
use crate::transport::Transport;

pub struct MessageQueue {
    name: String,
    address: Address,
    inbound: Arc<InboundQueue>,
    outbound: OutboundQueue,
    clock: Arc<dyn Clock>,
    stopped: AtomicBool,
}

impl MessageQueue {
    pub fn open(
        name: &str,
        address: Address,
        config: &QueueConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Self::open_with_clock(name, address, config, transport, Arc::new(SystemClock))
    }

    /// Opens both queues under `config.root` and starts outbound delivery
    /// through `transport`.
    pub fn open_with_clock(
        name: &str,
        address: Address,
        config: &QueueConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        address.validate()?;
        let inbound = Arc::new(InboundQueue::open_with_clock(
            name,
            config,
            Arc::clone(&clock),
        )?);
        let outbound = OutboundQueue::open_with_clock(name, config, Arc::clone(&clock))?;
        outbound.start(transport)?;
        info!(
            "queue {name}: open at {} as {address} ({} in, {} out)",
            config.root.display(),
            inbound.count(),
            outbound.count()
        );
        Ok(Self {
            name: name.to_string(),
            address,
            inbound,
            outbound,
            clock,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Shared handle to the inbound side, for registering with a transport host.
    pub fn inbound(&self) -> &Arc<InboundQueue> {
        &self.inbound
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Queues a text message for `destination`. Returns the message id.
    pub fn send(&self, destination: &Address, message_type: &str, text: &str) -> Result<Uuid> {
        self.send_payload(destination, message_type, Payload::Text(text.to_string()))
    }

    pub fn send_bytes(
        &self,
        destination: &Address,
        bytes: &[u8],
        message_type: &str,
    ) -> Result<Uuid> {
        self.send_payload(destination, message_type, Payload::Bytes(bytes.to_vec()))
    }

    /// Serializes `value` as JSON text; the message type is the Rust type name.
    pub fn send_json<T: Serialize>(&self, destination: &Address, value: &T) -> Result<Uuid> {
        let text = serde_json::to_string(value)
            .map_err(|err| Error::Failed(format!("json encode: {err}")))?;
        self.send_payload(
            destination,
            std::any::type_name::<T>(),
            Payload::Text(text),
        )
    }

    fn send_payload(
        &self,
        destination: &Address,
        message_type: &str,
        payload: Payload,
    ) -> Result<Uuid> {
        let to = self.optimal_address(destination)?;
        let message = Message::new(
            self.address.clone(),
            message_type,
            payload,
            self.clock.now(),
        );
        let id = message.id;
        self.outbound.enqueue(to, message)?;
        Ok(id)
    }

    /// Narrows `destination` to the single transport used to reach it.
    ///
    /// A dual-transport destination on another server, or a TCP-only one, is
    /// reached over TCP; everything else over its named pipe. The local
    /// endpoint must expose the chosen transport.
    pub fn optimal_address(&self, destination: &Address) -> Result<Address> {
        destination.validate()?;
        let use_tcp = match destination.transport {
            TransportKind::Tcp => true,
            TransportKind::Both => !destination
                .server_name
                .eq_ignore_ascii_case(&self.address.server_name),
            TransportKind::Np => false,
        };
        if use_tcp {
            if !self.address.transport.has_tcp() {
                return Err(Error::InvalidAddress(format!(
                    "{destination} needs tcp but {} has no tcp endpoint",
                    self.address
                )));
            }
            let ip = destination
                .ip
                .ok_or_else(|| Error::InvalidAddress(format!("{destination} has no ip")))?;
            let mut to = Address::tcp(ip, destination.port);
            to.server_name = destination.server_name.clone();
            Ok(to)
        } else {
            if !self.address.transport.has_pipe() {
                return Err(Error::InvalidAddress(format!(
                    "{destination} needs a named pipe but {} has none",
                    self.address
                )));
            }
            let pipe = destination
                .pipe_name
                .clone()
                .ok_or_else(|| Error::InvalidAddress(format!("{destination} has no pipe")))?;
            let mut to = Address::pipe(pipe);
            to.server_name = destination.server_name.clone();
            Ok(to)
        }
    }

    /// Entry point for a transport host handing over an arriving message.
    pub fn deliver_inbound(&self, message: Message) -> Result<()> {
        self.inbound.enqueue(message)
    }

    pub fn receive(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.inbound.receive(timeout)
    }

    pub fn accept(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.inbound.accept(timeout)
    }

    pub fn acknowledge(&self, message: &Message) -> Result<()> {
        self.inbound.acknowledge(message)
    }

    pub fn reenqueue(&self, message: Message) -> Result<()> {
        self.inbound.reenqueue(message)
    }

    /// The worse of the two queues' states.
    pub fn state(&self) -> QueueState {
        self.inbound.state().max(self.outbound.state())
    }

    pub fn state_error(&self) -> Option<Arc<Error>> {
        match (self.inbound.state(), self.outbound.state()) {
            (inbound, outbound) if outbound > inbound => self.outbound.state_error(),
            _ => self
                .inbound
                .state_error()
                .or_else(|| self.outbound.state_error()),
        }
    }

    pub fn clear_state(&self) {
        self.inbound.clear_state();
        self.outbound.clear_state();
    }

    /// Stops delivery and releases blocked receivers. Idempotent.
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let outbound = self.outbound.stop();
        self.inbound.stop()?;
        outbound
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    fn open(dir: &TempDir, address: Address) -> MessageQueue {
        MessageQueue::open(
            "test",
            address,
            &QueueConfig::new(dir.path()),
            Arc::new(LocalTransport::new()),
        )
        .unwrap()
    }

    #[test]
    fn picks_pipe_for_same_server() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, Address::both("alpha", ip(1), 8000, "me"));
        let to = queue
            .optimal_address(&Address::both("ALPHA", ip(1), 8001, "peer"))
            .unwrap();
        assert_eq!(to.transport, TransportKind::Np);
        assert_eq!(to.pipe_name.as_deref(), Some("peer"));
    }

    #[test]
    fn picks_tcp_for_other_server() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, Address::both("alpha", ip(1), 8000, "me"));
        let to = queue
            .optimal_address(&Address::both("beta", ip(2), 8001, "peer"))
            .unwrap();
        assert_eq!(to.transport, TransportKind::Tcp);
        assert_eq!(to.ip, Some(ip(2)));
        assert_eq!(to.port, 8001);
    }

    #[test]
    fn rejects_transport_local_end_lacks() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, Address::pipe("me"));
        assert!(matches!(
            queue.optimal_address(&Address::tcp(ip(2), 9000)),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            queue.send(&Address::tcp(ip(2), 9000), "t", "x"),
            Err(Error::InvalidAddress(_))
        ));
        assert_eq!(queue.outbound().count(), 0);
    }

    #[test]
    fn send_json_uses_type_name() {
        #[derive(Serialize)]
        struct Ping {
            seq: u32,
        }

        let dir = TempDir::new().unwrap();
        let queue = open(&dir, Address::pipe("me"));
        queue.outbound().stop().unwrap();
        queue.send_json(&Address::pipe("nobody"), &Ping { seq: 3 }).unwrap();

        let stored = std::fs::read_dir(dir.path().join("out"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let text = std::fs::read_to_string(stored.path()).unwrap();
        assert!(text.contains("Ping"));
        assert!(text.ends_with("{\"seq\":3}"));
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, Address::pipe("me"));
        queue.stop().unwrap();
        queue.stop().unwrap();
        assert!(queue.receive(None).unwrap().is_none());
    }
}
