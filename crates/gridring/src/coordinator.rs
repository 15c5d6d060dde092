//! Join admission, run by the ring head
//!
//! The coordinator is not a separate role object: the worker consults
//! [`Admissions`] only while [`Ring::is_coordinator`] holds. A pending join
//! lives from the admission decision until the node becomes visible; the
//! handshake token then stays remembered for the duplicate-id grace window so
//! late retries of the same join attempt are ignored instead of rejected.

use crate::message::JoinRequest;
use crate::node::NodeId;
use crate::ring::Ring;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Join under way at the coordinator
#[derive(Debug, Clone)]
pub struct PendingJoin {
    pub node_id: NodeId,
    pub addrs: Vec<SocketAddr>,
    pub token: Uuid,
    pub since: Instant,
}

/// Outcome of a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admit the candidate at `order`
    Admit { order: u64 },
    /// The candidate id is taken
    Duplicate,
    /// A retry of a join that is already being handled
    InFlight,
}

/// Coordinator bookkeeping of joins
#[derive(Debug)]
pub struct Admissions {
    pending: HashMap<NodeId, PendingJoin>,
    completed: HashMap<NodeId, (Uuid, Instant)>,
    pending_timeout: Duration,
    token_retention: Duration,
}

impl Admissions {
    /// `pending_timeout` bounds how long an unfinished join blocks its id
    pub fn new(pending_timeout: Duration, token_retention: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            completed: HashMap::new(),
            pending_timeout,
            token_retention,
        }
    }

    /// Decide on a join request. An admitted candidate becomes pending.
    pub fn decide(&mut self, ring: &mut Ring, request: &JoinRequest) -> Admission {
        self.expire();
        let id = request.candidate.id;

        if let Some(pending) = self.pending.get(&id) {
            return if pending.token == request.token {
                Admission::InFlight
            } else {
                Admission::Duplicate
            };
        }
        if matches!(self.completed.get(&id), Some((token, _)) if *token == request.token) {
            return Admission::InFlight;
        }
        if ring.is_duplicate(id) {
            return Admission::Duplicate;
        }

        self.pending.insert(
            id,
            PendingJoin {
                node_id: id,
                addrs: request.candidate.addrs.clone(),
                token: request.token,
                since: Instant::now(),
            },
        );
        Admission::Admit {
            order: ring.next_order(),
        }
    }

    /// The node became visible; destroy its pending record
    pub fn finish(&mut self, id: NodeId) -> Option<PendingJoin> {
        let pending = self.pending.remove(&id)?;
        self.completed.insert(id, (pending.token, Instant::now()));
        Some(pending)
    }

    /// The admission was abandoned (candidate failed or was rejected)
    pub fn abort(&mut self, id: NodeId) -> Option<PendingJoin> {
        self.pending.remove(&id)
    }

    pub fn is_pending(&self, id: NodeId) -> bool {
        self.pending.contains_key(&id)
    }

    fn expire(&mut self) {
        let (pending_timeout, retention) = (self.pending_timeout, self.token_retention);
        self.pending.retain(|_, p| p.since.elapsed() < pending_timeout);
        self.completed.retain(|_, (_, at)| at.elapsed() < retention);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeInfo;

    fn head() -> Ring {
        let info = NodeInfo::new(NodeId::new(), vec!["127.0.0.1:5000".parse().unwrap()]);
        let mut ring = Ring::new(info.id, Duration::from_secs(60));
        ring.bootstrap(info);
        ring
    }

    fn request(id: NodeId) -> JoinRequest {
        JoinRequest {
            candidate: NodeInfo::new(id, vec!["127.0.0.1:5001".parse().unwrap()]),
            token: Uuid::new_v4(),
        }
    }

    fn admissions() -> Admissions {
        Admissions::new(Duration::from_secs(30), Duration::from_secs(60))
    }

    #[test]
    fn test_admit_assigns_next_order() {
        let mut ring = head();
        let mut admissions = admissions();
        let req = request(NodeId::new());

        assert_eq!(
            admissions.decide(&mut ring, &req),
            Admission::Admit { order: 1 }
        );
        assert!(admissions.is_pending(req.candidate.id));
    }

    #[test]
    fn test_retry_with_same_token_is_in_flight() {
        let mut ring = head();
        let mut admissions = admissions();
        let req = request(NodeId::new());

        admissions.decide(&mut ring, &req);
        assert_eq!(admissions.decide(&mut ring, &req), Admission::InFlight);

        // Same id, different attempt
        let mut other = req.clone();
        other.token = Uuid::new_v4();
        assert_eq!(admissions.decide(&mut ring, &other), Admission::Duplicate);
    }

    #[test]
    fn test_member_id_is_duplicate() {
        let mut ring = head();
        let mut admissions = admissions();
        let req = request(ring.local_id());
        assert_eq!(admissions.decide(&mut ring, &req), Admission::Duplicate);
        assert!(!admissions.is_pending(ring.local_id()));
    }

    #[test]
    fn test_finished_token_stays_known() {
        let mut ring = head();
        let mut admissions = admissions();
        let req = request(NodeId::new());
        admissions.decide(&mut ring, &req);

        assert!(admissions.finish(req.candidate.id).is_some());
        assert!(!admissions.is_pending(req.candidate.id));
        assert_eq!(admissions.decide(&mut ring, &req), Admission::InFlight);
    }

    #[test]
    fn test_abort_and_expiry() {
        let mut ring = head();
        let mut admissions = Admissions::new(Duration::ZERO, Duration::ZERO);
        let req = request(NodeId::new());
        admissions.decide(&mut ring, &req);
        assert!(admissions.abort(req.candidate.id).is_some());

        // Zero timeout: the pending record is gone by the next decision
        admissions.decide(&mut ring, &req);
        let mut other = req.clone();
        other.token = Uuid::new_v4();
        assert!(matches!(
            admissions.decide(&mut ring, &other),
            Admission::Admit { .. }
        ));
    }
}
