//! Priority ("bully") election: highest live `peer_id` wins, terms strictly
//! increase, and a node never promotes itself after learning of a higher
//! COORDINATOR.
//!
//! This module holds the pure state and transition rules; the orchestrator
//! drives the actual timers and network sends (see `orchestrator::run_election`).

use std::time::Duration;

use rand::Rng;

use crate::common::{PeerId, Term};

#[derive(Debug)]
pub struct ElectionState {
    in_progress: bool,
    candidate_term: Term,
    ok_received: bool,
}

impl Default for ElectionState {
    fn default() -> Self {
        ElectionState { in_progress: false, candidate_term: 0, ok_received: false }
    }
}

impl ElectionState {
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn candidate_term(&self) -> Term {
        self.candidate_term
    }

    pub fn ok_received(&self) -> bool {
        self.ok_received
    }

    /// Begins a new election at `current_term + 1`. No-op (returns `None`)
    /// if one is already running.
    pub fn start(&mut self, current_term: Term) -> Option<Term> {
        if self.in_progress {
            return None;
        }
        self.in_progress = true;
        self.ok_received = false;
        self.candidate_term = current_term + 1;
        Some(self.candidate_term)
    }

    pub fn record_ok(&mut self) {
        self.ok_received = true;
    }

    /// Should we win uncontested? True only while still running our own
    /// election and nobody objected.
    pub fn should_become_leader(&self) -> bool {
        self.in_progress && !self.ok_received
    }

    /// Clears election state — on winning, on stepping down to a higher
    /// COORDINATOR, or on an uncontested-wait timeout forcing a restart.
    pub fn clear(&mut self) {
        self.in_progress = false;
        self.ok_received = false;
    }
}

/// Whether an incoming `COORDINATOR(term, leader_id)` should be accepted:
/// strictly newer, or equal to the current term but we aren't already the
/// leader of that term ourselves.
pub fn accepts_coordinator(term: Term, current_term: Term, current_leader: Option<PeerId>, self_id: PeerId) -> bool {
    if term > current_term {
        return true;
    }
    if term == current_term && current_leader != Some(self_id) {
        return true;
    }
    false
}

/// Bully rule: do we owe peer `X` an ELECTION_OK and should we start our own
/// election in response to its ELECTION?
pub fn should_ack_and_contend(requester_id: PeerId, self_id: PeerId) -> bool {
    requester_id < self_id
}

/// Jitters a base wait by up to 50%, so that nodes which all noticed the
/// same leader failure at the same instant don't retry in lockstep.
pub fn jittered_timeout(base: Duration) -> Duration {
    let extra_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(extra_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    // S4 — election with no higher peers: modeled at the state-machine level
    // (the timing/broadcast happens in the orchestrator's run_election).
    #[test]
    fn uncontested_election_wins() {
        let mut e = ElectionState::default();
        let term = e.start(2).unwrap();
        assert_eq!(term, 3);
        assert!(e.should_become_leader());
    }

    // S5 — election cancellation.
    #[test]
    fn contested_election_does_not_self_promote() {
        let mut e = ElectionState::default();
        e.start(2);
        e.record_ok();
        assert!(!e.should_become_leader());
    }

    #[test]
    fn cannot_start_two_elections_concurrently() {
        let mut e = ElectionState::default();
        assert!(e.start(2).is_some());
        assert!(e.start(2).is_none());
    }

    #[test]
    fn coordinator_accept_rules() {
        assert!(accepts_coordinator(5, 4, None, 1));
        assert!(!accepts_coordinator(3, 4, Some(9), 1));
        // Equal term, but we are not already that term's leader: accept (e.g. a peer's retransmit).
        assert!(accepts_coordinator(4, 4, Some(9), 1));
        // Equal term, we already are its leader: nothing to do.
        assert!(!accepts_coordinator(4, 4, Some(1), 1));
    }

    #[test]
    fn bully_rule_only_acks_lower_ids() {
        assert!(should_ack_and_contend(2, 5));
        assert!(!should_ack_and_contend(9, 5));
    }
}
