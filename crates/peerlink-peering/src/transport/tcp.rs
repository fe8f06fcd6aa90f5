//! TCP transport with length-prefixed JSON frames

use async_trait::async_trait;
use peerlink_common::{Error, Result};
use peerlink_proto::{FrameError, FrameReader, FrameWriter, ReplicationMessage};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::{Acceptor, Connection, MessageSink, MessageSource, Transport};

fn frame_error(remote: &str, err: FrameError) -> Error {
    match err {
        FrameError::Io(e) => Error::connection(remote, e.to_string()),
        other => Error::protocol(format!("{remote}: {other}")),
    }
}

fn split(stream: TcpStream, remote: String, max_frame_bytes: usize) -> Connection {
    let (read, write) = stream.into_split();
    Connection {
        sink: Box::new(TcpSink {
            writer: FrameWriter::new(write, max_frame_bytes),
            remote: remote.clone(),
        }),
        source: Box::new(TcpSource {
            reader: FrameReader::new(read, max_frame_bytes),
            remote: remote.clone(),
        }),
        remote,
    }
}

/// Dials peer servers over TCP
#[derive(Clone, Debug)]
pub struct TcpTransport {
    max_frame_bytes: usize,
}

impl TcpTransport {
    /// Create a transport enforcing `max_frame_bytes` in both directions
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, address: &str) -> Result<Connection> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| Error::connection(address, e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::connection(address, e.to_string()))?;
        debug!(address, "tcp stream connected");
        Ok(split(stream, address.to_string(), self.max_frame_bytes))
    }
}

/// Accepts peer streams on a TCP listener
pub struct TcpAcceptor {
    listener: TcpListener,
    max_frame_bytes: usize,
}

impl TcpAcceptor {
    /// Bind to `address`
    pub async fn bind(address: &str, max_frame_bytes: usize) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| Error::connection(address, format!("bind failed: {e}")))?;
        Ok(Self {
            listener,
            max_frame_bytes,
        })
    }

    /// Bound address, useful after binding port 0
    pub fn local_addr(&self) -> Result<String> {
        self.listener
            .local_addr()
            .map(|a| a.to_string())
            .map_err(|e| Error::internal_with_context("tcp", e.to_string()))
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<Option<Connection>> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| Error::connection("listener", e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::connection(peer.to_string(), e.to_string()))?;
        Ok(Some(split(stream, peer.to_string(), self.max_frame_bytes)))
    }
}

struct TcpSink {
    writer: FrameWriter<OwnedWriteHalf>,
    remote: String,
}

#[async_trait]
impl MessageSink for TcpSink {
    async fn send(&mut self, message: ReplicationMessage) -> Result<()> {
        self.writer
            .write_message(&message)
            .await
            .map(|_| ())
            .map_err(|e| frame_error(&self.remote, e))
    }

    async fn close(&mut self) -> Result<()> {
        self.writer
            .shutdown()
            .await
            .map_err(|e| frame_error(&self.remote, e))
    }
}

struct TcpSource {
    reader: FrameReader<OwnedReadHalf>,
    remote: String,
}

#[async_trait]
impl MessageSource for TcpSource {
    async fn recv(&mut self) -> Result<Option<ReplicationMessage>> {
        self.reader
            .read_message()
            .await
            .map_err(|e| frame_error(&self.remote, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_common::config::DEFAULT_MAX_FRAME_BYTES;

    #[tokio::test]
    async fn test_tcp_round_trip_over_loopback() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0", DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap();
        let addr = acceptor.local_addr().unwrap();
        let transport = TcpTransport::new(DEFAULT_MAX_FRAME_BYTES);

        let (client, server) = tokio::join!(transport.connect(&addr), acceptor.accept());
        let mut client = client.unwrap();
        let mut server = server.unwrap().unwrap();

        client
            .sink
            .send(ReplicationMessage::Resync {
                reason: "gap".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            server.source.recv().await.unwrap(),
            Some(ReplicationMessage::Resync {
                reason: "gap".to_string()
            })
        );

        server.sink.close().await.unwrap();
        assert_eq!(client.source.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refused_connection_is_connection_failure() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0", DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap();
        let addr = acceptor.local_addr().unwrap();
        drop(acceptor);

        let err = TcpTransport::new(DEFAULT_MAX_FRAME_BYTES)
            .connect(&addr)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionFailure { .. }));
    }
}
