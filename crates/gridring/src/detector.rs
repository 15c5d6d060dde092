//! Successor failure detection
//!
//! Each probe tick sends a lightweight probe over the successor link. The
//! successor's connection handler answers with a probe ack on the same
//! connection. When nothing was acknowledged within the detection timeout the
//! successor is suspected; the worker then reconnects directly, and when that
//! fails too it skips the node and announces the failure to the ring.

use std::time::{Duration, Instant};

/// What the worker should do on a probe tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAction {
    /// Send a probe with this sequence number
    Probe(u64),
    /// The link was silent for too long
    Suspect,
}

/// Failure detector state for the current successor link
#[derive(Debug)]
pub struct FailureDetector {
    timeout: Duration,
    last_heard: Instant,
    next_seq: u64,
    in_flight: Option<(u64, Instant)>,
}

impl FailureDetector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_heard: Instant::now(),
            next_seq: 0,
            in_flight: None,
        }
    }

    /// Start over for a freshly established link
    pub fn reset(&mut self, now: Instant) {
        self.last_heard = now;
        self.in_flight = None;
    }

    /// Decide whether to probe or suspect at `now`
    pub fn on_tick(&mut self, now: Instant) -> ProbeAction {
        if now.saturating_duration_since(self.last_heard) > self.timeout {
            return ProbeAction::Suspect;
        }
        self.next_seq += 1;
        if self.in_flight.is_none() {
            self.in_flight = Some((self.next_seq, now));
        }
        ProbeAction::Probe(self.next_seq)
    }

    /// Record an ack; returns the round trip of the oldest outstanding probe
    pub fn on_ack(&mut self, seq: u64, now: Instant) -> Option<Duration> {
        self.last_heard = now;
        match self.in_flight {
            Some((sent_seq, sent_at)) if seq >= sent_seq => {
                self.in_flight = None;
                Some(now.saturating_duration_since(sent_at))
            }
            _ => None,
        }
    }

    /// Time since the link last proved alive
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probes_while_acked() {
        let start = Instant::now();
        let mut detector = FailureDetector::new(Duration::from_millis(300));
        detector.reset(start);

        let t1 = start + Duration::from_millis(100);
        assert_eq!(detector.on_tick(t1), ProbeAction::Probe(1));
        let rtt = detector.on_ack(1, t1 + Duration::from_millis(5));
        assert_eq!(rtt, Some(Duration::from_millis(5)));

        let t2 = t1 + Duration::from_millis(250);
        assert_eq!(detector.on_tick(t2), ProbeAction::Probe(2));
    }

    #[test]
    fn test_suspects_after_silence() {
        let start = Instant::now();
        let mut detector = FailureDetector::new(Duration::from_millis(300));
        detector.reset(start);

        assert!(matches!(
            detector.on_tick(start + Duration::from_millis(100)),
            ProbeAction::Probe(_)
        ));
        assert!(matches!(
            detector.on_tick(start + Duration::from_millis(200)),
            ProbeAction::Probe(_)
        ));
        assert_eq!(
            detector.on_tick(start + Duration::from_millis(400)),
            ProbeAction::Suspect
        );
        assert_eq!(
            detector.silence(start + Duration::from_millis(400)),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn test_reset_clears_suspicion() {
        let start = Instant::now();
        let mut detector = FailureDetector::new(Duration::from_millis(100));
        detector.reset(start);
        let late = start + Duration::from_millis(500);
        assert_eq!(detector.on_tick(late), ProbeAction::Suspect);

        detector.reset(late);
        assert!(matches!(
            detector.on_tick(late + Duration::from_millis(50)),
            ProbeAction::Probe(_)
        ));
    }

    #[test]
    fn test_late_ack_still_counts_as_traffic() {
        let start = Instant::now();
        let mut detector = FailureDetector::new(Duration::from_millis(100));
        detector.reset(start);
        detector.on_tick(start + Duration::from_millis(10));
        detector.on_tick(start + Duration::from_millis(20));

        // Ack for the second probe answers the first outstanding one too
        assert!(detector
            .on_ack(2, start + Duration::from_millis(90))
            .is_some());
        assert!(detector.on_ack(1, start + Duration::from_millis(95)).is_none());
        assert!(matches!(
            detector.on_tick(start + Duration::from_millis(150)),
            ProbeAction::Probe(_)
        ));
    }
}
