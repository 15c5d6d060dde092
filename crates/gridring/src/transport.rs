//! TCP connection layer
//!
//! - **Listener**: accepts connections and serves each on its own task. Ring
//!   messages and join requests are enqueued into the worker inbox; probes and
//!   pings are answered directly from the latest published snapshot.
//! - **Successor link** ([`Link`]): the single outbound ring connection of a
//!   node, opened with an identity handshake. A reader task turns probe acks
//!   and connection loss into worker events.
//! - **Ad-hoc requests**: short-lived connections for join handshakes, pings
//!   and direct delivery of rejections to join candidates.

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::node::{NodeId, RingNode};
use crate::observability::NetworkMetrics;
use crate::protocol::{read_frame, write_frame, Frame, JoinResponse};
use crate::ring::TopologySnapshot;
use crate::worker::WorkerEvent;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Shared state of the listener and its connection tasks
#[derive(Clone)]
pub(crate) struct ServerContext {
    pub inbox: mpsc::Sender<WorkerEvent>,
    pub snapshot: watch::Receiver<Arc<TopologySnapshot>>,
    /// Token of the local node's own join requests
    pub join_token: Arc<Mutex<Uuid>>,
    pub network_timeout: Duration,
}

/// Accept loop.
///
/// Runs until the worker inbox closes. Connection tasks live in a `JoinSet`
/// and are aborted together with the listener.
pub(crate) async fn serve(listener: TcpListener, ctx: ServerContext) {
    let local_addr = listener.local_addr().ok();
    info!(addr = ?local_addr, "Discovery listener started");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    trace!(peer = %peer, "Accepted connection");
                    let _ = stream.set_nodelay(true);
                    let ctx = ctx.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, ctx).await {
                            debug!(peer = %peer, error = %e, "Connection error");
                        }
                    });
                    NetworkMetrics::set_active_connections(connections.len());
                }
                Err(e) => warn!(error = %e, "Accept error"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {
                NetworkMetrics::set_active_connections(connections.len());
            }
            _ = ctx.inbox.closed() => {
                debug!(addr = ?local_addr, "Worker stopped, closing listener");
                break;
            }
        }
    }
}

/// Serve one inbound connection
async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: ServerContext) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let write_timeout = ctx.network_timeout;
    // Identity announced to the peer by the handshake, if any
    let mut announced: Option<NodeId> = None;

    while let Some(frame) = read_frame(&mut reader, None).await? {
        match frame {
            Frame::Ring(msg) => {
                trace!(peer = %peer, msg = %msg, "Received ring message");
                ctx.inbox
                    .send(WorkerEvent::Message(msg))
                    .await
                    .map_err(|_| DiscoveryError::ShuttingDown)?;
            }
            Frame::Probe { seq } => {
                let local = ctx.snapshot.borrow().local;
                if announced.is_some_and(|id| id != local) {
                    // The local node rejoined under a new id; the old link is stale
                    debug!(peer = %peer, "Closing link opened for a previous identity");
                    return Ok(());
                }
                write_frame(&mut writer, &Frame::ProbeAck { seq }, write_timeout).await?;
            }
            Frame::Ping { from } => {
                let (node, member) = {
                    let snapshot = ctx.snapshot.borrow();
                    (snapshot.local, snapshot.contains(from))
                };
                announced = Some(node);
                write_frame(&mut writer, &Frame::Pong { node, member }, write_timeout).await?;
            }
            Frame::Join(request) => {
                if request.token == *ctx.join_token.lock() {
                    debug!(peer = %peer, "Refusing join request from the local node");
                    return Ok(());
                }
                let (reply_tx, reply_rx) = oneshot::channel();
                ctx.inbox
                    .send(WorkerEvent::JoinRequest {
                        request,
                        reply: reply_tx,
                    })
                    .await
                    .map_err(|_| DiscoveryError::ShuttingDown)?;
                let response = match timeout(ctx.network_timeout, reply_rx).await {
                    Ok(Ok(response)) => response,
                    _ => JoinResponse::NotReady,
                };
                write_frame(&mut writer, &Frame::JoinResponse(response), write_timeout).await?;
            }
            other => {
                return Err(DiscoveryError::Protocol(format!(
                    "unexpected {} frame from {}",
                    other.kind(),
                    peer
                )));
            }
        }
    }
    Ok(())
}

async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| DiscoveryError::NodeUnreachable { addr })?
        .map_err(|e| DiscoveryError::ConnectionFailed(format!("{addr}: {e}")))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Outbound ring connection to the successor
pub(crate) struct Link {
    peer: NodeId,
    addr: SocketAddr,
    epoch: u64,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
    write_timeout: Duration,
}

impl Link {
    /// Open a link to `peer`, trying its addresses in order.
    ///
    /// The peer must confirm its identity; a process that answers under a
    /// different id is rejected with [`DiscoveryError::UnexpectedPeer`].
    pub async fn connect(
        local: NodeId,
        peer: &RingNode,
        epoch: u64,
        inbox: mpsc::Sender<WorkerEvent>,
        config: &DiscoveryConfig,
    ) -> Result<Link> {
        let mut last_error = DiscoveryError::ConnectionFailed(format!("{} has no addresses", peer.id()));
        for &addr in peer.addrs() {
            match Self::connect_addr(local, peer.id(), addr, epoch, inbox.clone(), config).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    NetworkMetrics::increment_connect_errors("successor");
                    debug!(peer = %peer.id(), addr = %addr, error = %e, "Successor connect attempt failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn connect_addr(
        local: NodeId,
        expected: NodeId,
        addr: SocketAddr,
        epoch: u64,
        inbox: mpsc::Sender<WorkerEvent>,
        config: &DiscoveryConfig,
    ) -> Result<Link> {
        let stream = connect(addr, config.connect_timeout).await?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(&mut writer, &Frame::Ping { from: local }, config.network_timeout).await?;
        match read_frame(&mut reader, Some(config.network_timeout)).await? {
            Some(Frame::Pong { node, .. }) if node == expected => {}
            Some(Frame::Pong { node, .. }) => {
                return Err(DiscoveryError::UnexpectedPeer {
                    addr,
                    expected,
                    found: node,
                })
            }
            Some(other) => {
                return Err(DiscoveryError::Protocol(format!(
                    "expected pong from {addr}, got {}",
                    other.kind()
                )))
            }
            None => return Err(DiscoveryError::ConnectionClosed),
        }

        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader, None).await {
                    Ok(Some(Frame::ProbeAck { seq })) => {
                        if inbox.send(WorkerEvent::ProbeAck { epoch, seq }).await.is_err() {
                            return;
                        }
                    }
                    Ok(Some(other)) => {
                        trace!(addr = %addr, kind = other.kind(), "Ignoring frame on successor link")
                    }
                    Ok(None) | Err(_) => {
                        let _ = inbox.send(WorkerEvent::LinkClosed { epoch }).await;
                        return;
                    }
                }
            }
        });

        debug!(peer = %expected, addr = %addr, epoch, "Successor link established");
        Ok(Link {
            peer: expected,
            addr,
            epoch,
            writer,
            reader,
            write_timeout: config.network_timeout,
        })
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        write_frame(&mut self.writer, frame, self.write_timeout).await
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// One request/response exchange on a short-lived connection
pub(crate) async fn request(addr: SocketAddr, frame: &Frame, config: &DiscoveryConfig) -> Result<Frame> {
    let mut stream = connect(addr, config.connect_timeout).await?;
    write_frame(&mut stream, frame, config.network_timeout).await?;
    let response = read_frame(&mut stream, Some(config.network_timeout))
        .await?
        .ok_or(DiscoveryError::ConnectionClosed);
    let _ = stream.shutdown().await;
    response
}

/// Deliver a frame to the first reachable address without waiting for an answer
pub(crate) async fn deliver(addrs: &[SocketAddr], frame: &Frame, config: &DiscoveryConfig) -> Result<SocketAddr> {
    let mut last_error = DiscoveryError::ConnectionFailed("no addresses".into());
    for &addr in addrs {
        let attempt = async {
            let mut stream = connect(addr, config.connect_timeout).await?;
            write_frame(&mut stream, frame, config.network_timeout).await?;
            let _ = stream.shutdown().await;
            Ok::<_, DiscoveryError>(())
        };
        match attempt.await {
            Ok(()) => return Ok(addr),
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

/// Ping the first reachable address; returns the responder's id and whether
/// it counts `from` as a ring member
pub(crate) async fn ping(
    addrs: &[SocketAddr],
    from: NodeId,
    config: &DiscoveryConfig,
) -> Result<(NodeId, bool)> {
    let mut last_error = DiscoveryError::ConnectionFailed("no addresses".into());
    for &addr in addrs {
        match request(addr, &Frame::Ping { from }, config).await {
            Ok(Frame::Pong { node, member }) => return Ok((node, member)),
            Ok(other) => {
                last_error = DiscoveryError::Protocol(format!(
                    "expected pong from {addr}, got {}",
                    other.kind()
                ))
            }
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Payload, RingMessage};
    use crate::node::NodeInfo;

    fn config() -> DiscoveryConfig {
        DiscoveryConfig::builder()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .network_timeout(Duration::from_secs(1))
            .connect_timeout(Duration::from_secs(1))
            .build()
            .unwrap()
    }

    struct TestServer {
        addr: SocketAddr,
        local: NodeId,
        inbox: mpsc::Receiver<WorkerEvent>,
        snapshot: watch::Sender<Arc<TopologySnapshot>>,
        _task: JoinHandle<()>,
    }

    async fn server() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let local = NodeId::new();
        let (inbox_tx, inbox) = mpsc::channel(16);
        let (snapshot, snapshot_rx) = watch::channel(Arc::new(TopologySnapshot::empty(local)));
        let ctx = ServerContext {
            inbox: inbox_tx,
            snapshot: snapshot_rx,
            join_token: Arc::new(Mutex::new(Uuid::new_v4())),
            network_timeout: Duration::from_secs(1),
        };
        let task = tokio::spawn(serve(listener, ctx));
        TestServer {
            addr,
            local,
            inbox,
            snapshot,
            _task: task,
        }
    }

    fn ring_node(id: NodeId, addr: SocketAddr) -> RingNode {
        RingNode::new(NodeInfo::new(id, vec![addr]), 1)
    }

    #[tokio::test]
    async fn test_ping_reports_identity_and_membership() {
        let server = server().await;
        let from = NodeId::new();

        let (node, member) = ping(&[server.addr], from, &config()).await.unwrap();
        assert_eq!(node, server.local);
        assert!(!member);

        let mut member_node = ring_node(from, server.addr);
        member_node.mark_ready();
        let mut next = TopologySnapshot::empty(server.local);
        next.nodes.push(member_node);
        server.snapshot.send_replace(Arc::new(next));
        let (_, member) = ping(&[server.addr], from, &config()).await.unwrap();
        assert!(member);
    }

    #[tokio::test]
    async fn test_link_delivers_messages_and_acks_probes() {
        let mut server = server().await;
        let (inbox_tx, mut inbox_rx) = mpsc::channel(16);
        let peer = ring_node(server.local, server.addr);

        let mut link = Link::connect(NodeId::new(), &peer, 7, inbox_tx, &config())
            .await
            .unwrap();
        assert_eq!(link.peer(), server.local);
        assert_eq!(link.epoch(), 7);

        let msg = RingMessage::new(NodeId::new(), Payload::Custom { data: vec![1] });
        link.send(&Frame::Ring(msg.clone())).await.unwrap();
        match server.inbox.recv().await.unwrap() {
            WorkerEvent::Message(received) => assert_eq!(received.id, msg.id),
            _ => panic!("expected ring message"),
        }

        link.send(&Frame::Probe { seq: 3 }).await.unwrap();
        match inbox_rx.recv().await.unwrap() {
            WorkerEvent::ProbeAck { epoch, seq } => assert_eq!((epoch, seq), (7, 3)),
            _ => panic!("expected probe ack"),
        }
    }

    #[tokio::test]
    async fn test_link_rejects_wrong_identity() {
        let server = server().await;
        let (inbox_tx, _inbox_rx) = mpsc::channel(16);
        let impostor = ring_node(NodeId::new(), server.addr);

        let err = Link::connect(NodeId::new(), &impostor, 1, inbox_tx, &config())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DiscoveryError::UnexpectedPeer { found, .. } if found == server.local));
    }

    #[tokio::test]
    async fn test_link_reports_closed_connection() {
        let server = server().await;
        let (inbox_tx, mut inbox_rx) = mpsc::channel(16);
        let peer = ring_node(server.local, server.addr);
        let _link = Link::connect(NodeId::new(), &peer, 2, inbox_tx, &config())
            .await
            .unwrap();

        // Dropping the inbox stops the listener and its connection tasks
        drop(server);
        match timeout(Duration::from_secs(2), inbox_rx.recv()).await.unwrap() {
            Some(WorkerEvent::LinkClosed { epoch }) => assert_eq!(epoch, 2),
            _ => panic!("expected link closed"),
        }
    }

    #[tokio::test]
    async fn test_join_request_is_routed_to_worker() {
        let mut server = server().await;
        let addr = server.addr;
        let candidate = NodeId::new();
        let responder = tokio::spawn(async move {
            match server.inbox.recv().await {
                Some(WorkerEvent::JoinRequest { request, reply }) => {
                    let _ = reply.send(JoinResponse::Forwarded);
                    request.candidate.id
                }
                _ => panic!("expected join request"),
            }
        });

        let request = crate::message::JoinRequest {
            candidate: NodeInfo::new(candidate, vec![]),
            token: Uuid::new_v4(),
        };
        let response = super::request(addr, &Frame::Join(request), &config())
            .await
            .unwrap();
        assert_eq!(response, Frame::JoinResponse(JoinResponse::Forwarded));
        assert_eq!(responder.await.unwrap(), candidate);
    }

    #[tokio::test]
    async fn test_unreachable_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = ping(&[addr], NodeId::new(), &config()).await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
