//! Transport abstraction.
//!
//! The protocol needs two things from the network: unreliable addressed
//! datagrams for probes and gossip, and short-lived framed streams for
//! push/pull. Encoding happens above this layer; a transport only moves
//! opaque bytes.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation did not complete in time
    #[error("Operation timed out")]
    Timeout,

    /// Peer cannot be reached
    #[error("Peer unreachable: {0}")]
    Unreachable(SocketAddr),

    /// Transport or stream closed
    #[error("Transport closed")]
    Closed,

    /// Frame exceeds the transport's limit
    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Frame size
        size: usize,
        /// Transport limit
        limit: usize,
    },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional framed byte stream
#[async_trait]
pub trait StreamConn: Send + 'static {
    /// Send one frame
    ///
    /// # Errors
    ///
    /// Returns error if the stream is closed or broken
    async fn send_frame(&mut self, frame: Bytes) -> TransportResult<()>;

    /// Receive one frame
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] at end of stream
    async fn recv_frame(&mut self) -> TransportResult<Bytes>;
}

/// Network access for one node
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Stream type produced by this transport
    type Stream: StreamConn;

    /// Address the transport is bound to
    fn local_addr(&self) -> SocketAddr;

    /// Send a datagram, best effort
    ///
    /// # Errors
    ///
    /// Returns error if the datagram could not be handed to the network
    async fn send_datagram(&self, to: SocketAddr, payload: Bytes) -> TransportResult<()>;

    /// Wait for the next datagram
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the transport shut down
    async fn recv_datagram(&self) -> TransportResult<(SocketAddr, Bytes)>;

    /// Open a stream to a peer
    ///
    /// # Errors
    ///
    /// Returns error if the peer cannot be reached
    async fn open_stream(&self, to: SocketAddr) -> TransportResult<Self::Stream>;

    /// Wait for the next inbound stream
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the transport shut down
    async fn accept_stream(&self) -> TransportResult<(SocketAddr, Self::Stream)>;

    /// Stop accepting traffic. Idempotent.
    async fn shutdown(&self);
}
