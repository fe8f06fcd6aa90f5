//! Stream transports
//!
//! A replication stream is a pair of message halves. The engine never sees
//! bytes: [`tcp`] frames messages on a socket, [`memory`] passes them over
//! channels for tests and in-process clusters.

use async_trait::async_trait;
use peerlink_common::Result;
use peerlink_proto::ReplicationMessage;

pub mod memory;
pub mod tcp;

pub use memory::{MemoryListener, MemoryNetwork};
pub use tcp::{TcpAcceptor, TcpTransport};

/// Sending half of a stream
#[async_trait]
pub trait MessageSink: Send {
    /// Send one message
    async fn send(&mut self, message: ReplicationMessage) -> Result<()>;

    /// Close the sending half; the peer's source then yields `None`
    async fn close(&mut self) -> Result<()>;
}

/// Receiving half of a stream
#[async_trait]
pub trait MessageSource: Send {
    /// Next message, `None` when the peer closed cleanly
    async fn recv(&mut self) -> Result<Option<ReplicationMessage>>;
}

/// An established stream
pub struct Connection {
    /// Outbound half
    pub sink: Box<dyn MessageSink>,
    /// Inbound half
    pub source: Box<dyn MessageSource>,
    /// Address of the other end, for logs
    pub remote: String,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Opens streams to peer servers
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `address`
    async fn connect(&self, address: &str) -> Result<Connection>;
}

/// Yields inbound streams on the exporting side
#[async_trait]
pub trait Acceptor: Send {
    /// Next inbound stream, `None` once the listener is gone
    async fn accept(&mut self) -> Result<Option<Connection>>;
}
