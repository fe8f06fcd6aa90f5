//! In-process transport
//!
//! A [`MemoryNetwork`] is a registry of listeners keyed by address string.
//! Connections are a pair of bounded channels. Every connection is tied to
//! its listener's cancellation token, so shutting a listener down drops all
//! of its live streams the way a server crash would.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use peerlink_common::{Error, Result};
use peerlink_proto::ReplicationMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Acceptor, Connection, MessageSink, MessageSource, Transport};

const CHANNEL_CAPACITY: usize = 256;

struct ListenerEntry {
    connections: mpsc::Sender<Connection>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    listeners: DashMap<String, ListenerEntry>,
    next_client: AtomicU64,
}

/// Shared in-memory network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Inner>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening on `address`, replacing any previous listener there
    pub fn listen(&self, address: &str) -> MemoryListener {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let entry = ListenerEntry {
            connections: tx,
            cancel: CancellationToken::new(),
        };
        if let Some(previous) = self.inner.listeners.insert(address.to_string(), entry) {
            previous.cancel.cancel();
        }
        debug!(address, "memory listener started");
        MemoryListener {
            address: address.to_string(),
            connections: rx,
        }
    }

    /// Stop the listener on `address` and drop every stream it accepted
    pub fn shutdown(&self, address: &str) {
        if let Some((_, entry)) = self.inner.listeners.remove(address) {
            entry.cancel.cancel();
            debug!(address, "memory listener shut down");
        }
    }

    /// Drop every live stream on `address` but keep listening
    pub fn disconnect_all(&self, address: &str) {
        if let Some(mut entry) = self.inner.listeners.get_mut(address) {
            let old = std::mem::replace(&mut entry.cancel, CancellationToken::new());
            old.cancel();
        }
    }

    /// Whether something listens on `address`
    pub fn is_listening(&self, address: &str) -> bool {
        self.inner.listeners.contains_key(address)
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn connect(&self, address: &str) -> Result<Connection> {
        let (connections, cancel) = match self.inner.listeners.get(address) {
            Some(entry) => (entry.connections.clone(), entry.cancel.child_token()),
            None => return Err(Error::connection(address, "connection refused")),
        };

        let (to_server, from_client) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_client, from_server) = mpsc::channel(CHANNEL_CAPACITY);
        let client_id = self.inner.next_client.fetch_add(1, Ordering::Relaxed);

        let server_side = Connection {
            sink: Box::new(MemorySink::new(to_client, cancel.clone())),
            source: Box::new(MemorySource::new(from_client, cancel.clone())),
            remote: format!("memory-client-{client_id}"),
        };
        connections
            .send(server_side)
            .await
            .map_err(|_| Error::connection(address, "listener closed"))?;

        Ok(Connection {
            sink: Box::new(MemorySink::new(to_server, cancel.clone())),
            source: Box::new(MemorySource::new(from_server, cancel)),
            remote: address.to_string(),
        })
    }
}

/// Accepting end of a memory listener
pub struct MemoryListener {
    address: String,
    connections: mpsc::Receiver<Connection>,
}

impl MemoryListener {
    /// Address the listener was registered under
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Acceptor for MemoryListener {
    async fn accept(&mut self) -> Result<Option<Connection>> {
        Ok(self.connections.recv().await)
    }
}

struct MemorySink {
    tx: Option<mpsc::Sender<ReplicationMessage>>,
    cancel: CancellationToken,
}

impl MemorySink {
    fn new(tx: mpsc::Sender<ReplicationMessage>, cancel: CancellationToken) -> Self {
        Self {
            tx: Some(tx),
            cancel,
        }
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&mut self, message: ReplicationMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::connection("memory", "connection reset"));
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::connection("memory", "send after close"))?;
        tx.send(message)
            .await
            .map_err(|_| Error::connection("memory", "peer went away"))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::Receiver<ReplicationMessage>,
    cancel: CancellationToken,
}

impl MemorySource {
    fn new(rx: mpsc::Receiver<ReplicationMessage>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<ReplicationMessage>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::connection("memory", "connection reset")),
            msg = self.rx.recv() => Ok(msg),
        }
    }
}
