//! QUIC transport abstraction consumed by the connection dispatcher.
//!
//! Implement these traits over the QUIC stack of your choice to drive
//! [`Connection`](crate::Connection) over it. Every connection owns its
//! transport for the connection's whole lifetime.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::proto::stream::StreamId;

/// Error surfaced by the QUIC transport.
#[derive(Debug)]
pub enum TransportError {
    /// The peer reset the connection.
    Reset,
    /// An I/O failure on the underlying transport.
    Io(std::io::Error),
    /// The peer closed the connection with an application error code.
    ApplicationClosed {
        /// The code carried in the peer's CONNECTION_CLOSE
        code: u64,
    },
    /// The connection was aborted locally.
    LocallyClosed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Reset => write!(f, "connection reset by peer"),
            TransportError::Io(e) => write!(f, "i/o error: {}", e),
            TransportError::ApplicationClosed { code } => {
                write!(f, "peer closed the connection: {:#x}", code)
            }
            TransportError::LocallyClosed => write!(f, "connection closed locally"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// A stream opened by the peer.
///
/// `send` is `None` when the stream is unidirectional, that is when the peer
/// cannot receive from it and it is read-only for us.
pub struct IncomingStream<R, S> {
    /// Stream identifier assigned by the transport
    pub id: StreamId,
    /// The receive half
    pub recv: R,
    /// The send half, absent for unidirectional streams
    pub send: Option<S>,
}

impl<R, S> IncomingStream<R, S> {
    /// Whether data can flow in both directions
    pub fn is_bidirectional(&self) -> bool {
        self.send.is_some()
    }
}

/// An established, multiplexed QUIC connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// The receive half of this transport's streams
    type RecvStream: RecvStream;
    /// The send half of this transport's streams
    type SendStream: SendStream;

    /// Await the next stream opened by the peer.
    ///
    /// Returns `None` once the peer will open no further streams. Must be
    /// cancel safe: dropping the returned future must not lose a stream.
    async fn accept(
        &self,
    ) -> Result<Option<IncomingStream<Self::RecvStream, Self::SendStream>>, TransportError>;

    /// Open an outbound unidirectional stream.
    async fn open_uni(&self) -> Result<Self::SendStream, TransportError>;

    /// Forcibly close the connection, carrying `code` in the CONNECTION_CLOSE.
    fn abort(&self, code: u64, reason: &str);

    /// The local endpoint address
    fn local_addr(&self) -> SocketAddr;

    /// The peer endpoint address
    fn remote_addr(&self) -> SocketAddr;
}

/// The receive half of a QUIC stream.
#[async_trait]
pub trait RecvStream: Send + 'static {
    /// Await the next chunk of data.
    ///
    /// Returns `None` once the peer finishes the stream. Must be cancel safe.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, TransportError>;

    /// Tell the peer to stop sending on this stream.
    fn stop_sending(&mut self, code: u64);
}

/// The send half of a QUIC stream.
#[async_trait]
pub trait SendStream: Send + 'static {
    /// Write the whole buffer to the stream.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Abruptly terminate the sending part of the stream.
    fn reset(&mut self, code: u64);

    /// Gracefully finish the stream after all pending data is written.
    async fn finish(&mut self) -> Result<(), TransportError>;
}
