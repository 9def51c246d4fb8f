//! UDP/TCP transport.
//!
//! Datagrams go over UDP; push/pull streams over TCP with length-delimited
//! framing. Both sockets share one port, so a single address identifies a
//! node.

use crate::error::ClusterResult;
use crate::membership::Membership;
use crate::transport::{StreamConn, Transport, TransportError, TransportResult};
use crate::Config;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Largest UDP payload accepted
pub const MAX_DATAGRAM: usize = 65_536;

/// Largest push/pull frame accepted
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Framed TCP connection
#[derive(Debug)]
pub struct NetStream {
    inner: Framed<TcpStream, LengthDelimitedCodec>,
}

impl NetStream {
    fn new(stream: TcpStream) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME)
            .new_codec();
        Self {
            inner: Framed::new(stream, codec),
        }
    }
}

#[async_trait]
impl StreamConn for NetStream {
    async fn send_frame(&mut self, frame: Bytes) -> TransportResult<()> {
        if frame.len() > MAX_FRAME {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                limit: MAX_FRAME,
            });
        }
        self.inner.send(frame).await?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> TransportResult<Bytes> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(frame.freeze()),
            Some(Err(e)) => Err(e.into()),
            None => Err(TransportError::Closed),
        }
    }
}

/// Transport over real sockets
#[derive(Debug)]
pub struct NetTransport {
    udp: UdpSocket,
    listener: TcpListener,
    addr: SocketAddr,
    closed: CancellationToken,
}

impl NetTransport {
    /// Bind TCP and UDP on `addr`. Port 0 picks a free port for both.
    ///
    /// # Errors
    ///
    /// Returns error if either socket cannot be bound
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let udp = UdpSocket::bind(addr).await?;
        debug!(%addr, "transport bound");
        Ok(Self {
            udp,
            listener,
            addr,
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Transport for NetTransport {
    type Stream = NetStream;

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send_datagram(&self, to: SocketAddr, payload: Bytes) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if payload.len() > MAX_DATAGRAM {
            return Err(TransportError::FrameTooLarge {
                size: payload.len(),
                limit: MAX_DATAGRAM,
            });
        }
        self.udp.send_to(&payload, to).await?;
        Ok(())
    }

    async fn recv_datagram(&self) -> TransportResult<(SocketAddr, Bytes)> {
        let mut buf = BytesMut::zeroed(MAX_DATAGRAM);
        let received = tokio::select! {
            () = self.closed.cancelled() => return Err(TransportError::Closed),
            received = self.udp.recv_from(&mut buf) => received,
        };
        let (len, from) = received?;
        buf.truncate(len);
        Ok((from, buf.freeze()))
    }

    async fn open_stream(&self, to: SocketAddr) -> TransportResult<NetStream> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let stream = TcpStream::connect(to).await?;
        stream.set_nodelay(true)?;
        Ok(NetStream::new(stream))
    }

    async fn accept_stream(&self) -> TransportResult<(SocketAddr, NetStream)> {
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::Closed),
            accepted = self.listener.accept() => {
                let (stream, from) = accepted?;
                stream.set_nodelay(true)?;
                Ok((from, NetStream::new(stream)))
            }
        }
    }

    async fn shutdown(&self) {
        self.closed.cancel();
    }
}

/// Start a new cluster over UDP/TCP on `config.bind_addr`
///
/// # Errors
///
/// Returns error if the configuration is invalid or the sockets cannot be
/// bound
pub async fn create(config: Config) -> ClusterResult<Membership<NetTransport>> {
    config.validate()?;
    let transport = NetTransport::bind(config.bind_addr).await?;
    Membership::create(config, transport).await
}

/// Join an existing cluster over UDP/TCP
///
/// # Errors
///
/// Returns error if the configuration is invalid, the sockets cannot be
/// bound, or no seed responds
pub async fn join(config: Config, seeds: &[SocketAddr]) -> ClusterResult<Membership<NetTransport>> {
    config.validate()?;
    let transport = NetTransport::bind(config.bind_addr).await?;
    Membership::join(config, transport, seeds).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClusterError;
    use std::time::Duration;

    fn loopback(name: &str) -> Config {
        Config::local(name)
            .with_bind_addr("127.0.0.1:0".parse().unwrap())
            .with_probe_interval(Duration::from_millis(200))
            .with_rtt(Duration::from_millis(100))
            .with_gossip_interval(Duration::from_millis(50))
            .with_push_pull_interval(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_datagram_and_stream_roundtrip() {
        let a = NetTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = NetTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        a.send_datagram(b.local_addr(), Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let (from, payload) = b.recv_datagram().await.unwrap();
        assert_eq!(from, a.local_addr());
        assert_eq!(&payload[..], b"hello");

        let (mut client, accepted) =
            tokio::join!(async { a.open_stream(b.local_addr()).await.unwrap() }, b.accept_stream());
        let (_, mut server) = accepted.unwrap();
        client.send_frame(Bytes::from_static(b"frame")).await.unwrap();
        assert_eq!(&server.recv_frame().await.unwrap()[..], b"frame");
    }

    #[tokio::test]
    async fn test_shutdown_closes_receivers() {
        let t = NetTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        t.shutdown().await;
        assert!(matches!(t.recv_datagram().await, Err(TransportError::Closed)));
        assert!(matches!(t.accept_stream().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_unspecified_bind_needs_advertise() {
        let config = Config::local("a").with_bind_addr("0.0.0.0:0".parse().unwrap());
        let err = create(config).await.unwrap_err();
        assert!(matches!(err, ClusterError::Config(_)));
    }

    #[tokio::test]
    async fn test_join_fails_without_seeds_answering() {
        let dead = NetTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let unreachable = dead.local_addr();
        drop(dead);

        let err = join(loopback("lonely"), &[unreachable]).await.unwrap_err();
        assert!(matches!(err, ClusterError::JoinFailed { attempted: 1 }));
    }

    #[tokio::test]
    async fn test_three_nodes_converge_over_loopback() {
        let first = create(loopback("n0")).await.unwrap();
        let seed = first.local_node().addr();
        let second = join(loopback("n1"), &[seed]).await.unwrap();
        let third = join(loopback("n2"), &[second.local_node().addr()]).await.unwrap();
        let nodes = [first, second, third];

        let converged = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if nodes.iter().all(|n| n.num_members().ok() == Some(3)) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(converged.is_ok(), "loopback cluster did not converge");

        for node in &nodes {
            node.shutdown().await;
        }
        assert!(matches!(nodes[0].members(), Err(ClusterError::Shutdown)));
        assert!(matches!(nodes[0].num_members(), Err(ClusterError::Shutdown)));
        assert!(matches!(nodes[0].local_member(), Err(ClusterError::Shutdown)));
        assert!(matches!(nodes[0].dropped_events(), Err(ClusterError::Shutdown)));
    }
}
