//! Multi-node ring tests
//!
//! Every node runs a real listener on 127.0.0.1 with an ephemeral port. Nodes
//! find each other through one shared in-memory address registry: each node
//! registers its address once joined, so nodes started later contact the
//! earlier ones.
//!
//! Covered:
//! - Sequential joins, admission order and topology versions
//! - Failure of a member and ring repair
//! - Duplicate node ids, at the coordinator and via a forwarding member
//! - Graceful leave and coordinator handover
//! - Ordered custom broadcasts
//! - Metrics exchange through a shared metrics store
//! - A member failed out of the ring rejoining under a new id
//! - A new coordinator finishing an admission its predecessor started
//! - Reuse of a node id once its grace window expired
//!
//! Some tests play a ring member by hand over the wire protocol to reach
//! states that depend on timing between real nodes.

use gridring::message::JoinRequest;
use gridring::protocol::{read_frame, write_frame};
use gridring::{
    Discovery, DiscoveryConfig, DiscoveryError, DiscoveryEvent, Frame, InMemoryMetricsStore,
    JoinResponse, MetricsProvider, NodeId, NodeInfo, Payload, RingMessage,
    StaticAddressRegistry, TopologySnapshot,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(15);

fn config() -> DiscoveryConfig {
    DiscoveryConfig::builder()
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .join_timeout(Duration::from_secs(10))
        .join_retry_interval(Duration::from_millis(100))
        .network_timeout(Duration::from_secs(1))
        .connect_timeout(Duration::from_millis(500))
        .failure_detection(Duration::from_millis(100), Duration::from_millis(600))
        .heartbeat_frequency(Duration::from_millis(200))
        .reconnect_count(1)
        .leave_timeout(Duration::from_secs(3))
        .build()
        .unwrap()
}

async fn start(registry: &Arc<StaticAddressRegistry>) -> Discovery {
    start_with(config(), registry).await.unwrap()
}

async fn start_with(
    config: DiscoveryConfig,
    registry: &Arc<StaticAddressRegistry>,
) -> Result<Discovery, DiscoveryError> {
    Discovery::builder(config)
        .registry(registry.clone())
        .start()
        .await
}

/// Start `count` nodes one after another
async fn ring_of(count: usize, registry: &Arc<StaticAddressRegistry>) -> Vec<Discovery> {
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        nodes.push(start(registry).await);
    }
    nodes
}

async fn wait_for_version(node: &Discovery, version: u64, len: usize) -> Arc<TopologySnapshot> {
    node.await_topology(|s| s.version >= version && s.len() == len, WAIT)
        .await
        .unwrap_or_else(|_| {
            panic!(
                "node {} stuck at {:?}",
                node.local_node_id(),
                node.current_snapshot()
            )
        })
}

/// Next join, leave or failure event, skipping metrics updates
async fn next_membership_event(
    events: &mut mpsc::UnboundedReceiver<DiscoveryEvent>,
) -> DiscoveryEvent {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("no membership event")
            .expect("event stream closed");
        if event.is_membership_change() {
            return event;
        }
    }
}

fn ids(nodes: &[Discovery]) -> Vec<NodeId> {
    nodes.iter().map(Discovery::local_node_id).collect()
}

/// Write one frame to a node over a fresh connection
async fn send_frame(addr: SocketAddr, frame: &Frame) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut stream, frame, WAIT).await.unwrap();
}

/// Write one frame and read the answer
async fn request_frame(addr: SocketAddr, frame: &Frame) -> Frame {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut stream, frame, WAIT).await.unwrap();
    read_frame(&mut stream, Some(WAIT)).await.unwrap().unwrap()
}

/// Hand-driven ring member: answers pings and probes as `id` and passes
/// every ring message it receives to the test
async fn scripted_member(id: NodeId) -> (SocketAddr, mpsc::UnboundedReceiver<RingMessage>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                while let Ok(Some(frame)) = read_frame(&mut reader, None).await {
                    let answer = match frame {
                        Frame::Ping { .. } => Frame::Pong {
                            node: id,
                            member: true,
                        },
                        Frame::Probe { seq } => Frame::ProbeAck { seq },
                        Frame::Ring(msg) => {
                            let _ = tx.send(msg);
                            continue;
                        }
                        _ => break,
                    };
                    if write_frame(&mut writer, &answer, WAIT).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, rx)
}

#[tokio::test]
async fn test_first_node_starts_new_ring() {
    let registry = Arc::new(StaticAddressRegistry::new());
    let node = start(&registry).await;

    let snapshot = node.current_snapshot();
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.node_ids(), vec![node.local_node_id()]);
    assert!(node.is_coordinator());
    assert!(snapshot.grid_start_time > 0);
    assert_eq!(registry.addresses(), node.local_addrs().to_vec());

    let err = node
        .await_topology(|s| s.version > 1, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Timeout));
}

#[tokio::test]
async fn test_four_nodes_join_in_order() {
    let registry = Arc::new(StaticAddressRegistry::new());
    let nodes = ring_of(4, &registry).await;
    let expected = ids(&nodes);

    for node in &nodes {
        let snapshot = wait_for_version(node, 4, 4).await;
        assert_eq!(snapshot.version, 4);
        assert_eq!(snapshot.node_ids(), expected);
        let orders: Vec<u64> = snapshot.nodes.iter().map(|n| n.order).collect();
        assert_eq!(orders, vec![0, 1, 2, 3]);
        assert_eq!(snapshot.coordinator, Some(expected[0]));
    }

    assert!(nodes[0].is_coordinator());
    assert!(nodes[1..].iter().all(|n| !n.is_coordinator()));
    assert_eq!(nodes[1].grid_start_time(), nodes[0].grid_start_time());
}

#[tokio::test]
async fn test_failed_node_is_removed_and_duplicate_rejected() {
    let registry = Arc::new(StaticAddressRegistry::new());
    let mut nodes = ring_of(4, &registry).await;
    let expected = ids(&nodes);
    for node in &nodes {
        wait_for_version(node, 4, 4).await;
    }

    let mut events = nodes[0].subscribe();
    let c = nodes.remove(2);
    c.terminate();

    for node in &nodes {
        let snapshot = wait_for_version(node, 5, 3).await;
        assert_eq!(snapshot.version, 5);
        assert_eq!(snapshot.node_ids(), vec![expected[0], expected[1], expected[3]]);
    }
    let snapshot = nodes[1].current_snapshot();
    assert_eq!(snapshot.successor_of(expected[1]).unwrap().id(), expected[3]);

    match next_membership_event(&mut events).await {
        DiscoveryEvent::NodeFailed { node, topology } => {
            assert_eq!(node.id(), expected[2]);
            assert_eq!(topology.version, 5);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // A newcomer reusing B's id is refused and the ring stays as it is
    let duplicate = DiscoveryConfig {
        node_id: Some(expected[1]),
        ..config()
    };
    let err = start_with(duplicate, &registry).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::DuplicateIdentity { node_id } if node_id == expected[1]));

    for node in &nodes {
        let snapshot = node.current_snapshot();
        assert_eq!(snapshot.version, 5);
        assert_eq!(snapshot.len(), 3);
    }
}

#[tokio::test]
async fn test_duplicate_rejected_through_forwarding_member() {
    let registry = Arc::new(StaticAddressRegistry::new());
    let nodes = ring_of(2, &registry).await;
    wait_for_version(&nodes[0], 2, 2).await;

    // Only the non-coordinator is known, so the request travels the ring
    let contact = Arc::new(StaticAddressRegistry::with_addresses(
        nodes[1].local_addrs().iter().copied(),
    ));
    let duplicate = DiscoveryConfig {
        node_id: Some(nodes[0].local_node_id()),
        ..config()
    };
    let err = start_with(duplicate, &contact).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::DuplicateIdentity { .. }));
    assert_eq!(nodes[0].current_snapshot().version, 2);
}

#[tokio::test]
async fn test_join_events_carry_new_topology() {
    let registry = Arc::new(StaticAddressRegistry::new());
    let first = start(&registry).await;
    let mut events = first.subscribe();

    let second = start(&registry).await;
    match next_membership_event(&mut events).await {
        DiscoveryEvent::NodeJoined { node, topology } => {
            assert_eq!(node.id(), second.local_node_id());
            assert_eq!(node.order, 1);
            assert_eq!(topology.version, 2);
            assert!(topology.contains(second.local_node_id()));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(first.ping_node(second.local_node_id()).await);
    assert!(!first.ping_node(NodeId::new()).await);
}

#[tokio::test]
async fn test_leave_and_coordinator_handover() {
    let registry = Arc::new(StaticAddressRegistry::new());
    let mut nodes = ring_of(3, &registry).await;
    let expected = ids(&nodes);
    for node in &nodes {
        wait_for_version(node, 3, 3).await;
    }

    // Leave of a regular member
    let c = nodes.remove(2);
    let c_addrs = c.local_addrs().to_vec();
    c.leave().await.unwrap();
    for node in &nodes {
        let snapshot = wait_for_version(node, 4, 2).await;
        assert_eq!(snapshot.node_ids(), vec![expected[0], expected[1]]);
    }
    assert!(registry.addresses().iter().all(|a| !c_addrs.contains(a)));

    // Leave of the coordinator hands its role to the next oldest node
    let a = nodes.remove(0);
    a.leave().await.unwrap();
    let snapshot = wait_for_version(&nodes[0], 5, 1).await;
    assert_eq!(snapshot.node_ids(), vec![expected[1]]);
    assert!(nodes[0].is_coordinator());
}

#[tokio::test]
async fn test_custom_messages_arrive_in_same_order_everywhere() {
    let registry = Arc::new(StaticAddressRegistry::new());
    let nodes = ring_of(3, &registry).await;
    for node in &nodes {
        wait_for_version(node, 3, 3).await;
    }

    let mut receivers: Vec<_> = nodes.iter().map(Discovery::subscribe).collect();

    for n in 0..3u8 {
        for (i, node) in nodes.iter().enumerate() {
            node.send_custom(vec![i as u8, n]).await.unwrap();
        }
    }

    let mut sequences = Vec::new();
    for rx in &mut receivers {
        let mut sequence = Vec::new();
        while sequence.len() < 9 {
            match tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
                DiscoveryEvent::Custom { data, .. } => sequence.push(data),
                _ => continue,
            }
        }
        sequences.push(sequence);
    }

    assert!(sequences.windows(2).all(|w| w[0] == w[1]), "{sequences:?}");
    // Each sender's messages keep their relative order
    for sender in 0..3u8 {
        let own: Vec<u8> = sequences[0]
            .iter()
            .filter(|d| d[0] == sender)
            .map(|d| d[1])
            .collect();
        assert_eq!(own, vec![0, 1, 2]);
    }
}

#[tokio::test]
async fn test_metrics_travel_with_heartbeats() {
    let registry = Arc::new(StaticAddressRegistry::new());
    let store = Arc::new(InMemoryMetricsStore::new());
    let provider: Arc<dyn MetricsProvider> =
        Arc::new(|| BTreeMap::from([("load".to_string(), 0.25)]));

    let mut nodes = Vec::new();
    for _ in 0..2 {
        let node = Discovery::builder(config())
            .registry(registry.clone())
            .metrics_store(store.clone())
            .metrics_provider(provider.clone())
            .start()
            .await
            .unwrap();
        nodes.push(node);
    }
    let remote = nodes[1].local_node_id();

    let snapshot = nodes[0]
        .await_topology(
            |s| {
                s.node(remote)
                    .is_some_and(|n| n.metrics.custom.get("load") == Some(&0.25))
            },
            WAIT,
        )
        .await
        .unwrap();
    assert!(snapshot.node(remote).unwrap().metrics.update_time > 0);
    assert!(store.len() >= 2);
}

#[tokio::test]
async fn test_join_times_out_when_contacts_never_admit() {
    // A contact that answers every join request with "not ready"
    let contact = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let registry = Arc::new(StaticAddressRegistry::with_addresses([
        contact.local_addr().unwrap()
    ]));
    let server = tokio::spawn(async move {
        while let Ok((mut stream, _)) = contact.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                while let Ok(Some(_)) = read_frame(&mut reader, None).await {
                    let answer = Frame::JoinResponse(JoinResponse::NotReady);
                    if write_frame(&mut writer, &answer, WAIT).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let config = DiscoveryConfig {
        join_timeout: Duration::from_secs(2),
        ..config()
    };
    let err = start_with(config, &registry).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::JoinTimeout(_)));
    server.abort();
}

#[tokio::test]
async fn test_member_failed_out_of_ring_rejoins() {
    let registry = Arc::new(StaticAddressRegistry::new());
    let nodes = ring_of(3, &registry).await;
    let expected = ids(&nodes);
    for node in &nodes {
        wait_for_version(node, 3, 3).await;
    }
    let mut events = nodes[2].subscribe();

    // B reports C as failed; the ring drops C while C keeps running
    let report = RingMessage::new(expected[1], Payload::NodeFailed { node_id: expected[2] });
    send_frame(nodes[0].local_addrs()[0], &Frame::Ring(report)).await;
    let snapshot = wait_for_version(&nodes[0], 4, 2).await;
    assert_eq!(snapshot.node_ids(), vec![expected[0], expected[1]]);

    // C stops receiving ring traffic, asks the coordinator and starts over
    let segmented = loop {
        match tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            DiscoveryEvent::NodeSegmented { node_id, .. } => break node_id,
            _ => continue,
        }
    };
    assert_eq!(segmented, expected[2]);

    let (previous, rejoined) = loop {
        match tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            DiscoveryEvent::NodeReconnected {
                previous_id,
                node_id,
                topology,
            } => {
                assert!(topology.contains(node_id));
                break (previous_id, node_id);
            }
            _ => continue,
        }
    };
    assert_eq!(previous, expected[2]);
    assert_ne!(rejoined, expected[2]);
    assert_eq!(nodes[2].local_node_id(), rejoined);

    for node in &nodes {
        let snapshot = wait_for_version(node, 5, 3).await;
        assert_eq!(snapshot.node_ids(), vec![expected[0], expected[1], rejoined]);
    }
}

#[tokio::test]
async fn test_new_coordinator_finishes_interrupted_admission() {
    let registry = Arc::new(StaticAddressRegistry::new());
    let mut nodes = ring_of(2, &registry).await;
    let expected = ids(&nodes);
    for node in &nodes {
        wait_for_version(node, 2, 2).await;
    }
    let b_addr = nodes[1].local_addrs()[0];

    let joiner = NodeId::new();
    let (joiner_addr, mut received) = scripted_member(joiner).await;
    let join = Frame::Join(JoinRequest {
        candidate: NodeInfo::new(joiner, vec![joiner_addr]),
        token: Uuid::new_v4(),
    });
    assert_eq!(
        request_frame(nodes[0].local_addrs()[0], &join).await,
        Frame::JoinResponse(JoinResponse::Forwarded)
    );

    // The admission reaches the joiner together with the ring state
    loop {
        let msg = tokio::time::timeout(WAIT, received.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(
            &msg.payload,
            Payload::NodeAdded { node, topology: Some(_), .. } if node.id == joiner
        ) {
            break;
        }
    }

    // The coordinator dies before the admission completed its circuit
    let a = nodes.remove(0);
    a.terminate();

    // The joiner reports the failure to B and from now on forwards to B
    let report = RingMessage::new(joiner, Payload::NodeFailed { node_id: expected[0] });
    send_frame(b_addr, &Frame::Ring(report)).await;
    let relay = tokio::spawn(async move {
        while let Some(mut msg) = received.recv().await {
            msg.hops += 1;
            send_frame(b_addr, &Frame::Ring(msg)).await;
        }
    });

    let snapshot = wait_for_version(&nodes[0], 4, 2).await;
    assert_eq!(snapshot.node_ids(), vec![expected[1], joiner]);
    assert_eq!(snapshot.node(joiner).unwrap().order, 2);
    assert!(nodes[0].is_coordinator());
    relay.abort();
}

#[tokio::test]
async fn test_node_id_reusable_after_grace_window() {
    let registry = Arc::new(StaticAddressRegistry::new());
    let config = DiscoveryConfig {
        duplicate_id_grace: Duration::from_millis(300),
        ..config()
    };
    let mut nodes = Vec::new();
    for _ in 0..3 {
        nodes.push(start_with(config.clone(), &registry).await.unwrap());
    }
    let expected = ids(&nodes);
    for node in &nodes {
        wait_for_version(node, 3, 3).await;
    }

    let c = nodes.remove(2);
    c.terminate();
    for node in &nodes {
        wait_for_version(node, 4, 2).await;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    let restarted = DiscoveryConfig {
        node_id: Some(expected[2]),
        ..config
    };
    nodes.push(start_with(restarted, &registry).await.unwrap());

    // Coordinator and members agree on the readmission
    for node in &nodes {
        let snapshot = wait_for_version(node, 5, 3).await;
        assert_eq!(snapshot.version, 5);
        assert_eq!(snapshot.node_ids(), expected);
    }
}
