//! Push/pull anti-entropy.
//!
//! Two nodes swap their complete member tables over a stream and merge what
//! they receive through the same path as gossip. The initiator sends first;
//! the responder answers with its own snapshot before merging, so both
//! sides send the state they held before the exchange.

use crate::error::{ClusterError, ClusterResult};
use crate::membership::Shared;
use crate::transport::{StreamConn, Transport, TransportError};
use bytes::Bytes;
use chorus_core::{CoreError, Decode, Encode, Member, Message, Node};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

struct Remote {
    from: Node,
    join: bool,
    members: Vec<Member>,
}

fn decode_push_pull(frame: &[u8]) -> ClusterResult<Remote> {
    match Message::decode(frame)? {
        Message::PushPull {
            from,
            join,
            members,
        } => Ok(Remote {
            from,
            join,
            members,
        }),
        other => Err(CoreError::UnexpectedMessage {
            expected: "push-pull",
            actual: other.kind(),
        }
        .into()),
    }
}

impl<T: Transport> Shared<T> {
    fn push_pull_message(&self, join: bool) -> ClusterResult<Bytes> {
        let members = self.engine.lock().table().snapshot();
        let message = Message::PushPull {
            from: self.local.clone(),
            join,
            members,
        };
        Ok(Bytes::from(message.encode()?))
    }

    /// Exchange full state with `addr`.
    ///
    /// When `join` is set, a live record carrying this node's name at
    /// another address fails the exchange before anything is merged.
    pub(crate) async fn push_pull_with(&self, addr: SocketAddr, join: bool) -> ClusterResult<()> {
        let limit = self.config.stream_timeout;
        let exchange = async {
            let mut stream = self.transport.open_stream(addr).await?;
            stream.send_frame(self.push_pull_message(join)?).await?;
            let frame = stream.recv_frame().await?;
            decode_push_pull(&frame)
        };
        let remote = tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| ClusterError::Timeout(limit))??;

        if join {
            self.check_duplicate_name(&remote.members)?;
        }
        debug!(peer = %remote.from, members = remote.members.len(), "push/pull complete");
        self.merge_remote(&remote);
        Ok(())
    }

    /// Answer a push/pull opened by a peer
    pub(crate) async fn serve_push_pull(&self, mut stream: T::Stream) -> ClusterResult<()> {
        let limit = self.config.stream_timeout;
        let exchange = async {
            let frame = stream.recv_frame().await?;
            let remote = decode_push_pull(&frame)?;
            stream.send_frame(self.push_pull_message(false)?).await?;
            Ok::<_, ClusterError>(remote)
        };
        let remote = tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| ClusterError::Timeout(limit))??;

        if remote.join {
            info!(peer = %remote.from, "node joining");
        }
        self.merge_remote(&remote);
        Ok(())
    }

    fn check_duplicate_name(&self, members: &[Member]) -> ClusterResult<()> {
        let conflict = members.iter().find(|m| {
            m.name == self.local.name() && m.is_live() && m.addr != self.local.addr()
        });
        match conflict {
            Some(m) => Err(ClusterError::DuplicateName {
                name: m.name.clone(),
                addr: m.addr,
            }),
            None => Ok(()),
        }
    }

    fn merge_remote(&self, remote: &Remote) {
        let changed = self.engine.lock().merge_remote_state(
            &remote.members,
            remote.from.name(),
            Instant::now(),
        );
        if changed {
            self.suspicions_changed();
        }
    }

    /// Push/pull with one random live peer
    pub(crate) async fn periodic_push_pull(&self) {
        let Some(peer) = self.engine.lock().push_pull_target() else {
            return;
        };
        if let Err(e) = self.push_pull_with(peer.addr(), false).await {
            debug!(peer = %peer, error = %e, "periodic push/pull failed");
        }
    }

    /// Serve inbound streams until the transport closes
    pub(crate) async fn run_acceptor(self: Arc<Self>) {
        loop {
            match self.transport.accept_stream().await {
                Ok((from, stream)) => {
                    let shared = Arc::clone(&self);
                    self.scheduler.spawn("push-pull-serve", async move {
                        if let Err(e) = shared.serve_push_pull(stream).await {
                            debug!(%from, error = %e, "inbound push/pull failed");
                        }
                    });
                }
                Err(TransportError::Closed) => break,
                Err(e) => debug!(error = %e, "accept failed"),
            }
        }
    }
}
