//! Message worker
//!
//! One task per node owns all ring state. Network tasks never touch that
//! state; they enqueue [`WorkerEvent`]s into the worker's bounded inbox, which
//! is drained strictly in order. Messages the worker originates itself go to a
//! local backlog that is drained before the next inbox event, so a locally
//! created message is processed exactly like a received one.
//!
//! Processing a ring message:
//!
//! 1. Drop it when it exceeded the hop limit.
//! 2. If this node verified it and has seen it before, it completed the
//!    circuit: retire it.
//! 3. Drop duplicates (keyed by id and verification state).
//! 4. Unverified messages are forwarded untouched until they reach the
//!    coordinator, which verifies them.
//! 5. Verified messages are applied, then forwarded to the successor. A failed
//!    forward triggers reconnect and, when that fails, ring repair.

use crate::config::DiscoveryConfig;
use crate::coordinator::{Admission, Admissions};
use crate::detector::{FailureDetector, ProbeAction};
use crate::error::{DiscoveryError, Result};
use crate::event::{DiscoveryEvent, EventBus};
use crate::heartbeat::{MessageCounters, MetricsExchanger};
use crate::message::{HeartbeatData, JoinRequest, MessageId, Payload, RingMessage};
use crate::metrics_store::MetricsStore;
use crate::node::{NodeId, NodeInfo, NodeMetrics, RingNode};
use crate::observability::{NetworkMetrics, RingMetrics};
use crate::protocol::{Frame, JoinResponse};
use crate::registry::AddressRegistry;
use crate::ring::{Applied, MembershipChange, Ring, TopologySnapshot};
use crate::transport::{self, Link};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Input of the message worker
pub(crate) enum WorkerEvent {
    /// Ring message received from the network
    Message(RingMessage),
    /// Join handshake received by the listener
    JoinRequest {
        request: JoinRequest,
        reply: oneshot::Sender<JoinResponse>,
    },
    /// Probe answered on the successor link
    ProbeAck { epoch: u64, seq: u64 },
    /// Successor link closed
    LinkClosed { epoch: u64 },
    /// Request from the local API
    Command(Command),
}

/// Requests of the local [`Discovery`](crate::Discovery) handle
pub(crate) enum Command {
    SendCustom {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop,
}

/// Collaborators and channels handed to the worker at start
pub(crate) struct WorkerContext {
    pub config: Arc<DiscoveryConfig>,
    pub info: NodeInfo,
    pub registry: Arc<dyn AddressRegistry>,
    pub exchanger: MetricsExchanger,
    pub inbox: mpsc::Receiver<WorkerEvent>,
    pub inbox_tx: mpsc::Sender<WorkerEvent>,
    pub snapshot_tx: watch::Sender<Arc<TopologySnapshot>>,
    pub events: Arc<EventBus>,
    pub join_token: Arc<Mutex<Uuid>>,
}

enum JoinWaiter {
    /// First join, awaited by `Discovery::start`
    Start {
        reply: oneshot::Sender<Result<()>>,
        since: Instant,
    },
    /// Rejoin after the node was failed out of the ring
    Rejoin { previous: NodeId },
}

struct LeaveRequest {
    reply: Option<oneshot::Sender<Result<()>>>,
    deadline: Instant,
}

enum Exit {
    Stop,
    Segmented,
}

/// Bounded set of processed message ids
#[derive(Debug)]
struct SeenMessages {
    set: HashSet<(MessageId, bool)>,
    order: VecDeque<(MessageId, bool)>,
    capacity: usize,
}

impl SeenMessages {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, id: MessageId, verified: bool) -> bool {
        self.set.contains(&(id, verified))
    }

    /// Returns false when the key was already present
    fn insert(&mut self, id: MessageId, verified: bool) -> bool {
        if !self.set.insert((id, verified)) {
            return false;
        }
        self.order.push_back((id, verified));
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.set.clear();
        self.order.clear();
    }
}

/// Single writer of the local ring state
pub(crate) struct MessageWorker {
    config: Arc<DiscoveryConfig>,
    info: NodeInfo,
    ring: Ring,
    admissions: Admissions,
    detector: FailureDetector,
    exchanger: MetricsExchanger,
    registry: Arc<dyn AddressRegistry>,
    inbox: mpsc::Receiver<WorkerEvent>,
    inbox_tx: mpsc::Sender<WorkerEvent>,
    snapshot_tx: watch::Sender<Arc<TopologySnapshot>>,
    events: Arc<EventBus>,

    link: Option<Link>,
    link_epoch: u64,
    resend_on_link: bool,

    backlog: VecDeque<RingMessage>,
    seen: SeenMessages,
    pending: VecDeque<RingMessage>,
    counters: MessageCounters,
    last_received: Instant,

    join_token: Arc<Mutex<Uuid>>,
    join_waiter: Option<JoinWaiter>,
    join_deadline: Option<Instant>,
    leaving: Option<LeaveRequest>,
    exit: Option<Exit>,
    was_coordinator: bool,
    heartbeat_sent: Option<(MessageId, Instant)>,
    /// Addresses of nodes removed since the last clean tick
    departed_addrs: HashSet<SocketAddr>,
}

impl MessageWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        let config = ctx.config;
        Self {
            ring: Ring::new(ctx.info.id, config.duplicate_id_grace),
            admissions: Admissions::new(config.join_timeout.max(config.network_timeout), config.duplicate_id_grace),
            detector: FailureDetector::new(config.failure_detection_timeout),
            seen: SeenMessages::new(config.seen_messages_capacity),
            info: ctx.info,
            exchanger: ctx.exchanger,
            registry: ctx.registry,
            inbox: ctx.inbox,
            inbox_tx: ctx.inbox_tx,
            snapshot_tx: ctx.snapshot_tx,
            events: ctx.events,
            link: None,
            link_epoch: 0,
            resend_on_link: false,
            backlog: VecDeque::new(),
            pending: VecDeque::new(),
            counters: MessageCounters::default(),
            last_received: Instant::now(),
            join_token: ctx.join_token,
            join_waiter: None,
            join_deadline: None,
            leaving: None,
            exit: None,
            was_coordinator: false,
            heartbeat_sent: None,
            departed_addrs: HashSet::new(),
            config,
        }
    }

    fn id(&self) -> NodeId {
        self.info.id
    }

    /// Join the ring, then process events until stopped.
    ///
    /// `started` resolves once the local node is visible, or with the fatal
    /// error that prevented joining.
    pub async fn run(mut self, started: oneshot::Sender<Result<()>>) {
        self.join_waiter = Some(JoinWaiter::Start {
            reply: started,
            since: Instant::now(),
        });

        match self.join().await {
            Ok(()) => self.serve().await,
            Err(e) => self.fail_join(e),
        }

        self.link = None;
        self.snapshot_tx
            .send_replace(Arc::new(TopologySnapshot::empty(self.id())));
        debug!(node = %self.id(), "Message worker stopped");
    }

    // ==================== Join ====================

    /// Contact registry addresses until admitted, rejected or out of time.
    ///
    /// Returns once the admission message arrived (the node is then an
    /// invisible ring member) or the node bootstrapped a new ring.
    async fn join(&mut self) -> Result<()> {
        self.join_deadline = self.config.join_deadline().map(|d| Instant::now() + d);
        let request = Frame::Join(JoinRequest {
            candidate: self.info.clone(),
            token: *self.join_token.lock(),
        });
        info!(node = %self.id(), "Joining ring");

        loop {
            self.check_join_deadline()?;

            let Some(addrs) = self.contact_addresses().await else {
                self.wait_for_admission(Instant::now() + self.retry_delay())
                    .await?;
                continue;
            };

            let mut answered = false;
            for addr in addrs {
                self.check_join_deadline()?;
                match transport::request(addr, &request, &self.config).await {
                    Ok(Frame::JoinResponse(JoinResponse::Forwarded)) => {
                        answered = true;
                        debug!(contact = %addr, "Join request accepted, awaiting admission");
                        let until = Instant::now() + self.config.network_timeout;
                        if self.wait_for_admission(until).await? {
                            return Ok(());
                        }
                    }
                    Ok(Frame::JoinResponse(JoinResponse::Duplicate)) => {
                        return Err(DiscoveryError::DuplicateIdentity { node_id: self.id() });
                    }
                    Ok(Frame::JoinResponse(JoinResponse::NotReady)) => {
                        answered = true;
                        debug!(contact = %addr, "Contact is not ready to accept joins");
                    }
                    Ok(other) => {
                        warn!(contact = %addr, kind = other.kind(), "Unexpected answer to join request")
                    }
                    Err(e) => debug!(contact = %addr, error = %e, "Contact unreachable"),
                }
            }

            if !answered {
                self.bootstrap().await;
                return Ok(());
            }

            if self
                .wait_for_admission(Instant::now() + self.retry_delay())
                .await?
            {
                return Ok(());
            }
        }
    }

    /// Registry addresses minus our own; `None` when the registry failed
    async fn contact_addresses(&self) -> Option<Vec<SocketAddr>> {
        match timeout(self.config.network_timeout, self.registry.list()).await {
            Ok(Ok(addrs)) => Some(
                addrs
                    .into_iter()
                    .filter(|a| !self.info.addrs.contains(a))
                    .collect(),
            ),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to list registry addresses");
                None
            }
            Err(_) => {
                warn!("Timed out listing registry addresses");
                None
            }
        }
    }

    /// Join retry interval plus up to 50% jitter, so restarted nodes spread out
    fn retry_delay(&self) -> Duration {
        let base = self.config.join_retry_interval;
        let max_jitter = (base.as_millis() as u64) / 2;
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
    }

    fn check_join_deadline(&self) -> Result<()> {
        match self.join_deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(DiscoveryError::JoinTimeout(self.config.join_timeout))
            }
            _ => Ok(()),
        }
    }

    /// Handle inbox events of a not-yet-admitted node until `until`.
    /// Returns true once the admission message arrived.
    async fn wait_for_admission(&mut self, until: Instant) -> Result<bool> {
        let until = match self.join_deadline {
            Some(deadline) => until.min(deadline),
            None => until,
        };
        loop {
            tokio::select! {
                event = self.inbox.recv() => match event {
                    Some(event) => {
                        if self.on_joining_event(event).await? {
                            return Ok(true);
                        }
                    }
                    None => return Err(DiscoveryError::ShuttingDown),
                },
                _ = tokio::time::sleep_until(until.into()) => return Ok(false),
            }
        }
    }

    async fn on_joining_event(&mut self, event: WorkerEvent) -> Result<bool> {
        let local = self.id();
        match event {
            WorkerEvent::Message(msg) => {
                let admitted = msg.is_verified()
                    && matches!(
                        &msg.payload,
                        Payload::NodeAdded { node, topology: Some(_), .. } if node.id == local
                    );
                if admitted {
                    self.admit(msg).await;
                    return Ok(true);
                }
                if let Payload::DuplicateId { node_id } = msg.payload {
                    if node_id == local {
                        return Err(DiscoveryError::DuplicateIdentity { node_id: local });
                    }
                }
                trace!(msg = %msg, "Dropping ring message received before admission");
                Ok(false)
            }
            WorkerEvent::JoinRequest { reply, .. } => {
                let _ = reply.send(JoinResponse::NotReady);
                Ok(false)
            }
            WorkerEvent::Command(Command::Stop) => Err(DiscoveryError::ShuttingDown),
            WorkerEvent::Command(Command::SendCustom { reply, .. })
            | WorkerEvent::Command(Command::Leave { reply }) => {
                let _ = reply.send(Err(DiscoveryError::NotJoined));
                Ok(false)
            }
            WorkerEvent::ProbeAck { .. } | WorkerEvent::LinkClosed { .. } => Ok(false),
        }
    }

    /// Restore the ring from the admission message and pass it on
    async fn admit(&mut self, mut msg: RingMessage) {
        let Payload::NodeAdded {
            order, topology, ..
        } = &mut msg.payload
        else {
            return;
        };
        let order = *order;
        let Some(data) = topology.take() else {
            return;
        };

        self.ring.restore(data);
        self.seen.insert(msg.id, true);
        info!(
            node = %self.id(),
            order,
            version = self.ring.version(),
            nodes = self.ring.len(),
            "Admitted to ring, waiting for admission to complete"
        );
        self.publish_snapshot();
        self.forward(msg).await;
        self.after_change();
    }

    /// Start a new ring with the local node as its only member
    async fn bootstrap(&mut self) {
        info!(node = %self.id(), "No reachable ring members, starting a new ring");
        self.ring.bootstrap(self.info.clone());
        self.after_change();
        self.complete_join().await;
    }

    async fn complete_join(&mut self) {
        self.join_deadline = None;
        self.last_received = Instant::now();
        self.register_addresses().await;

        let snapshot = self.current_snapshot();
        info!(
            node = %self.id(),
            order = self.ring.local_node().map(|n| n.order),
            version = snapshot.version,
            nodes = snapshot.len(),
            "Joined ring"
        );

        match self.join_waiter.take() {
            Some(JoinWaiter::Start { reply, since }) => {
                RingMetrics::record_join_latency(since.elapsed());
                let _ = reply.send(Ok(()));
            }
            Some(JoinWaiter::Rejoin { previous }) => {
                self.events.publish(DiscoveryEvent::NodeReconnected {
                    previous_id: previous,
                    node_id: self.id(),
                    topology: snapshot,
                });
            }
            None => {}
        }
    }

    fn fail_join(&mut self, e: DiscoveryError) {
        error!(node = %self.id(), error = %e, "Failed to join ring");
        if let Some(JoinWaiter::Start { reply, .. }) = self.join_waiter.take() {
            let _ = reply.send(Err(e));
        }
    }

    async fn register_addresses(&self) {
        match timeout(
            self.config.network_timeout,
            self.registry.register(&self.info.addrs),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to register addresses"),
            Err(_) => warn!("Timed out registering addresses"),
        }
    }

    // ==================== Event loop ====================

    async fn serve(&mut self) {
        let mut probe = interval(self.config.probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = interval(self.config.heartbeat_frequency);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut clean = interval(self.config.stores_clean_frequency);
        clean.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            while let Some(msg) = self.backlog.pop_front() {
                self.process(msg).await;
                if self.exit.is_some() {
                    break;
                }
            }

            match self.exit.take() {
                Some(Exit::Stop) => return,
                Some(Exit::Segmented) => {
                    if self.rejoin().await.is_err() {
                        return;
                    }
                    continue;
                }
                None => {}
            }

            let leave_deadline = self.leaving.as_ref().map(|l| l.deadline);
            let join_deadline = self.join_waiter.as_ref().and(self.join_deadline);

            tokio::select! {
                event = self.inbox.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => return,
                },
                _ = probe.tick() => self.on_probe_tick().await,
                _ = heartbeat.tick() => self.on_heartbeat_tick(),
                _ = clean.tick() => self.on_clean_tick(),
                _ = sleep_until(leave_deadline) => self.finish_leave(true).await,
                _ = sleep_until(join_deadline) => {
                    self.fail_join(DiscoveryError::JoinTimeout(self.config.join_timeout));
                    self.exit = Some(Exit::Stop);
                }
            }
        }
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Message(msg) => {
                self.counters.received += 1;
                self.last_received = Instant::now();
                self.process(msg).await;
            }
            WorkerEvent::JoinRequest { request, reply } => self.on_join_request(request, reply),
            WorkerEvent::ProbeAck { epoch, seq } => {
                if self.link.as_ref().is_some_and(|l| l.epoch() == epoch) {
                    if let Some(rtt) = self.detector.on_ack(seq, Instant::now()) {
                        NetworkMetrics::record_probe_rtt(rtt);
                    }
                }
            }
            WorkerEvent::LinkClosed { epoch } => {
                let Some(peer) = self
                    .link
                    .as_ref()
                    .filter(|l| l.epoch() == epoch)
                    .map(Link::peer)
                else {
                    return;
                };
                debug!(peer = %peer, "Successor link closed");
                self.link = None;
                if let Some(node) = self.ring.get(peer).cloned() {
                    self.repair(&node).await;
                }
            }
            WorkerEvent::Command(command) => self.on_command(command).await,
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SendCustom { data, reply } => {
                let result = if self.is_ready() {
                    self.originate(Payload::Custom { data });
                    Ok(())
                } else {
                    Err(DiscoveryError::NotJoined)
                };
                let _ = reply.send(result);
            }
            Command::Leave { reply } => self.start_leave(reply),
            Command::Stop => {
                info!(node = %self.id(), "Stopping without leaving");
                self.exit = Some(Exit::Stop);
            }
        }
    }

    /// Joined, visible and not leaving
    fn is_ready(&self) -> bool {
        self.join_waiter.is_none()
            && self.leaving.is_none()
            && self.ring.local_node().is_some_and(|n| n.visible)
    }

    fn on_join_request(&mut self, request: JoinRequest, reply: oneshot::Sender<JoinResponse>) {
        if !self.is_ready() {
            let _ = reply.send(JoinResponse::NotReady);
            return;
        }

        if self.ring.is_coordinator() {
            let response = match self.admit_candidate(&request) {
                Admission::Duplicate => JoinResponse::Duplicate,
                Admission::Admit { .. } | Admission::InFlight => JoinResponse::Forwarded,
            };
            let _ = reply.send(response);
        } else {
            debug!(candidate = %request.candidate.id, "Forwarding join request to coordinator");
            let _ = reply.send(JoinResponse::Forwarded);
            self.originate(Payload::JoinRequest(request));
        }
    }

    /// Coordinator-side admission decision
    fn admit_candidate(&mut self, request: &JoinRequest) -> Admission {
        let candidate = &request.candidate;
        let decision = self.admissions.decide(&mut self.ring, request);
        match decision {
            Admission::Admit { order } => {
                info!(candidate = %candidate.id, order, "Admitting node");
                self.originate(Payload::NodeAdded {
                    node: candidate.clone(),
                    order,
                    topology: None,
                });
            }
            Admission::Duplicate => {
                warn!(candidate = %candidate.id, "Rejecting join request with duplicate node id");
                RingMetrics::increment_duplicate_ids();
            }
            Admission::InFlight => {
                debug!(candidate = %candidate.id, "Ignoring retry of an admission in progress")
            }
        }
        decision
    }

    /// Send a rejection straight to the candidate; it is not a ring member
    fn reject_duplicate(&self, candidate: NodeInfo) {
        let msg = RingMessage::verified_by(
            self.id(),
            self.ring.version(),
            Payload::DuplicateId {
                node_id: candidate.id,
            },
        );
        let config = self.config.clone();
        tokio::spawn(async move {
            if let Err(e) = transport::deliver(&candidate.addrs, &Frame::Ring(msg), &config).await {
                debug!(candidate = %candidate.id, error = %e, "Failed to deliver duplicate id rejection");
            }
        });
    }

    /// Queue a locally created message; the coordinator verifies its own
    fn originate(&mut self, payload: Payload) {
        let msg = if self.ring.is_coordinator() {
            let stamped = self.ring.version() + u64::from(self.bumps_version(&payload));
            RingMessage::verified_by(self.id(), stamped, payload)
        } else {
            RingMessage::new(self.id(), payload)
        };
        trace!(msg = %msg, "Originating message");
        self.backlog.push_back(msg);
    }

    /// Check if applying `payload` will change the visible ring
    fn bumps_version(&self, payload: &Payload) -> bool {
        match payload {
            Payload::NodeAddFinished { node_id } => {
                self.ring.get(*node_id).is_some_and(|n| !n.visible)
            }
            Payload::NodeLeft { node_id } | Payload::NodeFailed { node_id } => {
                self.ring.get(*node_id).is_some_and(|n| n.visible)
            }
            _ => false,
        }
    }

    // ==================== Message processing ====================

    async fn process(&mut self, msg: RingMessage) {
        RingMetrics::increment_messages_processed(msg.payload.kind());
        self.process_message(msg).await;
        self.after_change();
    }

    async fn process_message(&mut self, mut msg: RingMessage) {
        let local = self.id();

        if msg.hops > self.ring.hop_limit() {
            warn!(msg = %msg, "Dropping message that exceeded the hop limit");
            RingMetrics::increment_hop_limit_dropped();
            return;
        }

        if msg.verified_by_node(local) && self.seen.contains(msg.id, true) {
            self.retire(msg).await;
            return;
        }

        if !self.seen.insert(msg.id, msg.is_verified()) {
            trace!(msg = %msg, "Dropping duplicate message");
            RingMetrics::increment_duplicates_dropped();
            return;
        }

        if !msg.is_verified() {
            if let Payload::NodeFailed { node_id } = msg.payload {
                if node_id == local {
                    self.forward(msg).await;
                    self.on_self_failed();
                    return;
                }
                if self.ring.mark_failed(node_id) {
                    debug!(node = %node_id, "Suspecting node reported as failed");
                }
            }

            if !self.ring.is_coordinator() {
                self.forward(msg).await;
                return;
            }

            if let Payload::JoinRequest(request) = &msg.payload {
                let request = request.clone();
                if self.admit_candidate(&request) == Admission::Duplicate {
                    self.reject_duplicate(request.candidate);
                }
                return;
            }

            let stamped = self.ring.version() + u64::from(self.bumps_version(&msg.payload));
            msg.verify(local, stamped);
            self.seen.insert(msg.id, true);
            trace!(msg = %msg, "Verified message");
        }

        self.apply_verified(msg).await;
    }

    async fn apply_verified(&mut self, msg: RingMessage) {
        match msg.payload {
            Payload::NodeAdded { .. } => self.on_node_added(msg).await,
            Payload::NodeAddFinished { node_id } => self.on_node_add_finished(node_id, msg).await,
            Payload::NodeLeft { node_id } => self.on_node_left(node_id, msg).await,
            Payload::NodeFailed { node_id } => self.on_node_failed(node_id, msg).await,
            Payload::DuplicateId { node_id } => {
                debug!(node = %node_id, "Ignoring duplicate id rejection outside of a join")
            }
            Payload::Heartbeat(_) => self.on_heartbeat(msg).await,
            Payload::Custom { .. } => self.on_custom(msg).await,
            Payload::JoinRequest(_) => warn!(msg = %msg, "Dropping verified join request"),
        }
    }

    async fn on_node_added(&mut self, mut msg: RingMessage) {
        let local = self.id();
        let stamped = msg.topology_version;
        let Payload::NodeAdded {
            node,
            order,
            topology,
        } = &mut msg.payload
        else {
            return;
        };

        if node.id == local {
            // Repeated admission of ourselves, already restored
            *topology = None;
        } else {
            let change = MembershipChange::Added {
                info: node.clone(),
                order: *order,
            };
            if self.ring.apply(change, stamped) == Applied::Added {
                debug!(node = %node.id, order = *order, "Node added, admission in progress");
            }
            // The new node's predecessor hands it the full ring state
            let next = self.ring.successor().map(RingNode::id);
            *topology = (next == Some(node.id)).then(|| self.ring.topology_data());
        }

        self.forward(msg).await;
    }

    async fn on_node_add_finished(&mut self, node_id: NodeId, msg: RingMessage) {
        if let Applied::Joined(node) = self
            .ring
            .apply(MembershipChange::AddFinished(node_id), msg.topology_version)
        {
            self.publish_snapshot();
            if node_id == self.id() {
                self.complete_join().await;
            } else {
                info!(node = %node_id, order = node.order, version = self.ring.version(), "Node joined");
                let topology = self.current_snapshot();
                self.events
                    .publish(DiscoveryEvent::NodeJoined { node, topology });
            }
        }
        self.admissions.finish(node_id);
        self.forward(msg).await;
    }

    async fn on_node_left(&mut self, node_id: NodeId, msg: RingMessage) {
        let local = self.id();
        if node_id == local {
            if msg.verified_by_node(local) {
                // We lead the ring: wait for the message to complete the circuit
                self.forward(msg).await;
            } else {
                self.finish_leave(false).await;
            }
            return;
        }

        // The leaving node waits for its own message; hand it over before relinking
        if let Some(node) = self.ring.successor().filter(|n| n.id() == node_id).cloned() {
            self.deliver_to(&node, &msg).await;
        }

        match self
            .ring
            .apply(MembershipChange::Left(node_id), msg.topology_version)
        {
            Applied::Left(node) => {
                self.departed_addrs.extend(node.addrs());
                self.publish_snapshot();
                info!(node = %node_id, version = self.ring.version(), "Node left");
                let topology = self.current_snapshot();
                self.events
                    .publish(DiscoveryEvent::NodeLeft { node, topology });
            }
            Applied::Discarded(node) => {
                self.departed_addrs.extend(node.addrs());
                self.admissions.abort(node_id);
            }
            _ => {}
        }
        self.forward(msg).await;
    }

    async fn on_node_failed(&mut self, node_id: NodeId, msg: RingMessage) {
        if node_id == self.id() {
            self.forward(msg).await;
            self.on_self_failed();
            return;
        }

        match self
            .ring
            .apply(MembershipChange::Failed(node_id), msg.topology_version)
        {
            Applied::Failed(node) => {
                self.departed_addrs.extend(node.addrs());
                self.publish_snapshot();
                warn!(node = %node_id, version = self.ring.version(), "Node failed");
                let topology = self.current_snapshot();
                self.events
                    .publish(DiscoveryEvent::NodeFailed { node, topology });
            }
            Applied::Discarded(node) => {
                self.departed_addrs.extend(node.addrs());
                self.admissions.abort(node_id);
            }
            _ => {}
        }
        self.forward(msg).await;
    }

    async fn on_heartbeat(&mut self, mut msg: RingMessage) {
        let local = self.id();
        let version = self.ring.version();
        let Payload::Heartbeat(data) = &mut msg.payload else {
            return;
        };

        self.absorb_metrics(data).await;

        let mut counters = self.counters;
        counters.queued = self.backlog.len() as u64;
        let metrics = self.exchanger.local_metrics(counters, version);
        self.ring.update_metrics(local, metrics.clone());
        self.exchanger.contribute(local, data, metrics).await;
        self.publish_snapshot();

        self.forward(msg).await;
    }

    async fn on_custom(&mut self, msg: RingMessage) {
        if let Payload::Custom { data } = &msg.payload {
            let topology = self.current_snapshot();
            self.events.publish(DiscoveryEvent::Custom {
                from: msg.creator,
                data: data.clone(),
                topology,
            });
        }
        self.forward(msg).await;
    }

    /// Store metrics carried by a heartbeat and notify subscribers
    async fn absorb_metrics(&mut self, data: &HeartbeatData) {
        let local = self.id();
        let collected = self.exchanger.collect(data).await;

        let mut updated: Vec<(NodeId, NodeMetrics)> = Vec::new();
        for (id, metrics) in collected {
            if id != local && self.ring.update_metrics(id, metrics.clone()) {
                updated.push((id, metrics));
            }
        }
        if updated.is_empty() {
            return;
        }

        self.publish_snapshot();
        let topology = self.current_snapshot();
        for (node_id, metrics) in updated {
            self.events.publish(DiscoveryEvent::NodeMetricsUpdated {
                node_id,
                metrics,
                topology: topology.clone(),
            });
        }
    }

    /// A message verified here came back: every live member processed it
    async fn retire(&mut self, msg: RingMessage) {
        trace!(msg = %msg, "Message completed the ring");
        RingMetrics::increment_messages_retired();

        match msg.payload {
            Payload::NodeAdded { node, .. } => {
                if self.ring.get(node.id).is_some_and(|n| !n.visible) {
                    self.originate(Payload::NodeAddFinished { node_id: node.id });
                }
            }
            Payload::NodeLeft { node_id } if node_id == self.id() => {
                self.finish_leave(false).await;
            }
            Payload::Heartbeat(data) => {
                if let Some((_, sent)) = self.heartbeat_sent.filter(|(id, _)| *id == msg.id) {
                    RingMetrics::record_circuit_latency(sent.elapsed());
                    self.heartbeat_sent = None;
                }
                self.absorb_metrics(&data).await;
            }
            _ => {}
        }
    }

    fn on_self_failed(&mut self) {
        match self.leaving.take() {
            Some(mut leave) => {
                if let Some(reply) = leave.reply.take() {
                    let _ = reply.send(Ok(()));
                }
                self.exit = Some(Exit::Stop);
            }
            None => self.exit = Some(Exit::Segmented),
        }
    }

    // ==================== Forwarding and repair ====================

    /// Forward to the successor, repairing the ring until a live successor
    /// accepts the message or the local node is alone
    async fn forward(&mut self, mut msg: RingMessage) {
        msg.hops += 1;
        let frame = Frame::Ring(msg);
        let mut attempts = 0;

        loop {
            let Some(next) = self.ring.successor().cloned() else {
                self.link = None;
                if let Frame::Ring(msg) = frame {
                    if msg.verified_by_node(self.id()) {
                        self.retire(msg).await;
                    }
                }
                return;
            };

            attempts += 1;
            if attempts > self.ring.len() + self.config.reconnect_count as usize + 1 {
                error!(peer = %next.id(), "Giving up forwarding after repeated link failures");
                return;
            }

            match self.send_to(&next, &frame).await {
                Ok(()) => {
                    self.counters.sent += 1;
                    if let Frame::Ring(msg) = frame {
                        trace!(msg = %msg, peer = %next.id(), "Forwarded message");
                        RingMetrics::increment_messages_forwarded(msg.payload.kind());
                        self.remember(msg);
                    }
                    return;
                }
                Err(e) => {
                    debug!(peer = %next.id(), error = %e, "Forward to successor failed");
                    self.repair(&next).await;
                }
            }
        }
    }

    async fn send_to(&mut self, next: &RingNode, frame: &Frame) -> Result<()> {
        self.ensure_link(next).await?;
        let Some(link) = self.link.as_mut() else {
            return Err(DiscoveryError::ConnectionClosed);
        };
        let result = link.send(frame).await;
        if result.is_err() {
            self.link = None;
        }
        result
    }

    /// Hand a message to a node that is about to be unlinked
    async fn deliver_to(&mut self, node: &RingNode, msg: &RingMessage) {
        let mut msg = msg.clone();
        msg.hops += 1;
        let frame = Frame::Ring(msg);
        if let Some(link) = self.link.as_mut().filter(|l| l.peer() == node.id()) {
            if link.send(&frame).await.is_ok() {
                return;
            }
        }
        if let Err(e) = transport::deliver(node.addrs(), &frame, &self.config).await {
            debug!(node = %node.id(), error = %e, "Failed to hand message to departing node");
        }
    }

    /// Make sure the link points at `next`
    async fn ensure_link(&mut self, next: &RingNode) -> Result<()> {
        if self.link.as_ref().is_some_and(|l| l.peer() == next.id()) {
            return Ok(());
        }

        self.link = None;
        self.link_epoch += 1;
        let link = Link::connect(
            self.id(),
            next,
            self.link_epoch,
            self.inbox_tx.clone(),
            &self.config,
        )
        .await?;
        debug!(peer = %next.id(), addr = %link.addr(), "Linked to new successor");
        self.link = Some(link);
        self.detector.reset(Instant::now());

        if self.resend_on_link {
            self.resend_pending().await?;
        }
        Ok(())
    }

    /// Resend recently forwarded messages; the receiver drops those it has seen
    async fn resend_pending(&mut self) -> Result<()> {
        let mut result = Ok(());
        if let Some(link) = self.link.as_mut() {
            for msg in &self.pending {
                if let Err(e) = link.send(&Frame::Ring(msg.clone())).await {
                    result = Err(e);
                    break;
                }
            }
        }
        match result {
            Ok(()) => {
                debug!(count = self.pending.len(), "Resent pending messages after repair");
                self.resend_on_link = false;
            }
            Err(_) => {
                self.link = None;
                self.resend_on_link = true;
            }
        }
        result
    }

    fn remember(&mut self, msg: RingMessage) {
        if matches!(msg.payload, Payload::Heartbeat(_)) {
            return;
        }
        self.pending.push_back(msg);
        while self.pending.len() > self.config.max_pending_messages {
            self.pending.pop_front();
        }
        RingMetrics::set_pending_messages(self.pending.len());
    }

    /// Reconnect to `peer`; when that keeps failing, skip it and announce the failure
    async fn repair(&mut self, peer: &RingNode) {
        self.link = None;

        for attempt in 1..=self.config.reconnect_count {
            self.link_epoch += 1;
            match Link::connect(
                self.id(),
                peer,
                self.link_epoch,
                self.inbox_tx.clone(),
                &self.config,
            )
            .await
            {
                Ok(link) => {
                    debug!(peer = %peer.id(), attempt, "Reconnected to successor");
                    self.link = Some(link);
                    self.detector.reset(Instant::now());
                    if self.resend_pending().await.is_ok() {
                        return;
                    }
                }
                Err(e) => debug!(peer = %peer.id(), attempt, error = %e, "Reconnect failed"),
            }
        }

        warn!(peer = %peer.id(), "Successor unreachable, excluding it from the ring");
        RingMetrics::increment_failures_detected();
        RingMetrics::increment_ring_repairs();
        self.ring.mark_failed(peer.id());
        self.resend_on_link = true;
        self.originate(Payload::NodeFailed {
            node_id: peer.id(),
        });
        self.after_change();
    }

    // ==================== Periodic tasks ====================

    async fn on_probe_tick(&mut self) {
        if !self.ring.is_member() {
            return;
        }
        self.check_membership().await;

        let Some(next) = self.ring.successor().cloned() else {
            self.link = None;
            return;
        };

        if self.link.as_ref().map(Link::peer) != Some(next.id()) {
            if let Err(e) = self.ensure_link(&next).await {
                debug!(peer = %next.id(), error = %e, "Failed to link to successor");
                self.repair(&next).await;
            }
            return;
        }

        match self.detector.on_tick(Instant::now()) {
            ProbeAction::Probe(seq) => {
                let sent = match self.link.as_mut() {
                    Some(link) => link.send(&Frame::Probe { seq }).await,
                    None => Err(DiscoveryError::ConnectionClosed),
                };
                if let Err(e) = sent {
                    debug!(peer = %next.id(), error = %e, "Probe failed");
                    self.repair(&next).await;
                }
            }
            ProbeAction::Suspect => {
                debug!(
                    peer = %next.id(),
                    silence = ?self.detector.silence(Instant::now()),
                    "Successor stopped answering probes"
                );
                self.repair(&next).await;
            }
        }
    }

    /// After a long silence, ask the coordinator whether we are still a member
    async fn check_membership(&mut self) {
        if self.ring.is_coordinator()
            || self.ring.len() < 2
            || !self.is_ready()
            || self.last_received.elapsed() < self.config.segment_check_timeout()
        {
            return;
        }
        self.last_received = Instant::now();

        let Some(coordinator) = self.ring.coordinator().cloned() else {
            return;
        };
        match transport::ping(coordinator.addrs(), self.id(), &self.config).await {
            Ok((node, false)) if node == coordinator.id() => {
                warn!(coordinator = %node, "Coordinator no longer lists the local node");
                self.on_self_failed();
            }
            Ok(_) => trace!(coordinator = %coordinator.id(), "Membership confirmed"),
            Err(e) => debug!(coordinator = %coordinator.id(), error = %e, "Coordinator unreachable"),
        }
    }

    fn on_heartbeat_tick(&mut self) {
        if !self.is_ready() || !self.ring.is_coordinator() {
            return;
        }
        let msg = RingMessage::verified_by(
            self.id(),
            self.ring.version(),
            Payload::Heartbeat(HeartbeatData::default()),
        );
        self.heartbeat_sent = Some((msg.id, Instant::now()));
        self.backlog.push_back(msg);
    }

    /// Drop registry addresses and stored metrics of nodes that are gone.
    ///
    /// Only addresses advertised by removed nodes are unregistered; seeded
    /// registry entries nobody advertised stay.
    fn on_clean_tick(&mut self) {
        if !self.is_ready() || !self.ring.is_coordinator() {
            self.departed_addrs.clear();
            return;
        }

        let live_addrs: HashSet<SocketAddr> = self
            .ring
            .nodes()
            .iter()
            .flat_map(|n| n.addrs().iter().copied())
            .collect();
        let stale_addrs: Vec<SocketAddr> = self
            .departed_addrs
            .drain()
            .filter(|a| !live_addrs.contains(a))
            .collect();
        let live_ids: HashSet<NodeId> = self.ring.nodes().iter().map(RingNode::id).collect();
        let registry = self.registry.clone();
        let store = self.exchanger.store().cloned();
        let limit = self.config.network_timeout;

        tokio::spawn(async move {
            let cleaning = clean_stores(registry, store, stale_addrs, live_ids);
            if timeout(limit, cleaning).await.is_err() {
                debug!("Store cleaning timed out");
            }
        });
    }

    // ==================== Leave and rejoin ====================

    fn start_leave(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.leaving.is_some() {
            let _ = reply.send(Err(DiscoveryError::ShuttingDown));
            return;
        }
        if !self.is_ready() {
            let _ = reply.send(Err(DiscoveryError::NotJoined));
            return;
        }

        info!(node = %self.id(), "Leaving ring");
        self.leaving = Some(LeaveRequest {
            reply: Some(reply),
            deadline: Instant::now() + self.config.leave_timeout,
        });
        self.originate(Payload::NodeLeft { node_id: self.id() });
    }

    async fn finish_leave(&mut self, timed_out: bool) {
        let Some(mut leave) = self.leaving.take() else {
            return;
        };
        if timed_out {
            warn!(node = %self.id(), "Leave message did not complete the ring in time");
        } else {
            info!(node = %self.id(), "Left ring");
        }

        let unregister = async {
            if let Err(e) = self.registry.unregister(&self.info.addrs).await {
                warn!(error = %e, "Failed to unregister addresses");
            }
            if let Some(store) = self.exchanger.store() {
                if let Err(e) = store.remove(&[self.info.id]).await {
                    debug!(error = %e, "Failed to remove stored metrics");
                }
            }
        };
        if timeout(self.config.network_timeout, unregister).await.is_err() {
            warn!("Timed out cleaning up after leave");
        }

        self.link = None;
        if let Some(reply) = leave.reply.take() {
            let _ = reply.send(Ok(()));
        }
        self.exit = Some(Exit::Stop);
    }

    /// Start over under a fresh identity after being failed out of the ring
    async fn rejoin(&mut self) -> Result<()> {
        let previous = self.id();
        warn!(node = %previous, "Local node was failed out of the ring, rejoining");
        self.events.publish(DiscoveryEvent::NodeSegmented {
            node_id: previous,
            topology: self.current_snapshot(),
        });

        let id = NodeId::new();
        self.info.id = id;
        self.ring = Ring::new(id, self.config.duplicate_id_grace);
        self.admissions = Admissions::new(
            self.config.join_timeout.max(self.config.network_timeout),
            self.config.duplicate_id_grace,
        );
        self.link = None;
        self.resend_on_link = false;
        self.backlog.clear();
        self.pending.clear();
        self.seen.clear();
        self.departed_addrs.clear();
        *self.join_token.lock() = Uuid::new_v4();
        self.was_coordinator = false;
        self.join_waiter = Some(JoinWaiter::Rejoin { previous });
        self.publish_snapshot();

        if let Err(e) = self.join().await {
            self.fail_join(e);
            return Err(DiscoveryError::NotJoined);
        }
        Ok(())
    }

    // ==================== Publication ====================

    fn current_snapshot(&self) -> Arc<TopologySnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    fn publish_snapshot(&self) {
        let snapshot = self.ring.shared_snapshot();
        RingMetrics::set_topology_version(snapshot.version);
        RingMetrics::set_ring_size(snapshot.len());
        self.snapshot_tx.send_replace(snapshot);
    }

    /// Publish the current state and react to coordinator handover
    fn after_change(&mut self) {
        let is_coordinator = self.ring.is_coordinator();
        if is_coordinator != self.was_coordinator {
            self.was_coordinator = is_coordinator;
            RingMetrics::set_is_coordinator(is_coordinator);
            if is_coordinator && self.ring.local_node().is_some_and(|n| n.visible) {
                info!(node = %self.id(), version = self.ring.version(), "Local node is now the coordinator");
                self.resume_admissions();
            }
        }
        self.publish_snapshot();
    }

    /// Re-issue admissions a failed coordinator left unfinished
    fn resume_admissions(&mut self) {
        let unfinished: Vec<(NodeInfo, u64)> = self
            .ring
            .nodes()
            .iter()
            .filter(|n| !n.visible)
            .map(|n| (n.info.clone(), n.order))
            .collect();
        for (node, order) in unfinished {
            debug!(node = %node.id, order, "Resuming admission");
            self.originate(Payload::NodeAdded {
                node,
                order,
                topology: None,
            });
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

async fn clean_stores(
    registry: Arc<dyn AddressRegistry>,
    store: Option<Arc<dyn MetricsStore>>,
    stale_addrs: Vec<SocketAddr>,
    live_ids: HashSet<NodeId>,
) {
    if registry.is_shared() && !stale_addrs.is_empty() {
        debug!(count = stale_addrs.len(), "Unregistering addresses of departed nodes");
        if let Err(e) = registry.unregister(&stale_addrs).await {
            warn!(error = %e, "Failed to clean address registry");
        }
    }

    if let Some(store) = store {
        match store.node_ids().await {
            Ok(ids) => {
                let stale: Vec<NodeId> = ids.into_iter().filter(|id| !live_ids.contains(id)).collect();
                if !stale.is_empty() {
                    debug!(count = stale.len(), "Removing metrics of departed nodes");
                    if let Err(e) = store.remove(&stale).await {
                        warn!(error = %e, "Failed to clean metrics store");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list metrics store for cleaning"),
        }
    }
}
