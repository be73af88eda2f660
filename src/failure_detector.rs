//! Liveness: the leader's heartbeat loop and the follower's watchdog.
//!
//! Pure timing logic lives here; the orchestrator's main loop supplies the
//! clock (via `Instant::now()`) and decides what to do with a raised
//! suspicion (start an election).

use std::time::{Duration, Instant};

use crate::common::{PeerId, Term};

/// Follower-side: tracks when we last heard from the leader and raises a
/// suspicion exactly once per episode of silence.
pub struct Watchdog {
    last_seen: Instant,
    leader_timeout: Duration,
    already_suspected: bool,
}

impl Watchdog {
    pub fn new(leader_timeout: Duration) -> Self {
        Watchdog { last_seen: Instant::now(), leader_timeout, already_suspected: false }
    }

    /// Arms the watchdog with a fresh baseline — called on every
    /// role-transition into FOLLOWER and on every HEARTBEAT/SEQ_CHAT/etc.
    /// received from the current leader.
    pub fn record_contact(&mut self) {
        self.last_seen = Instant::now();
        self.already_suspected = false;
    }

    /// Time remaining before `check` would raise a suspicion, from `now`.
    /// Zero if already overdue.
    pub fn time_remaining(&self, now: Instant) -> Duration {
        let elapsed = now.duration_since(self.last_seen);
        self.leader_timeout.saturating_sub(elapsed)
    }

    /// Returns true exactly once per overdue episode: the first poll past
    /// `leader_timeout` returns true, subsequent polls (until `record_contact`
    /// resets it) return false.
    pub fn check(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last_seen) >= self.leader_timeout && !self.already_suspected {
            self.already_suspected = true;
            return true;
        }
        false
    }
}

/// Leader-side: decides when the next heartbeat broadcast is due.
pub struct HeartbeatScheduler {
    last_sent: Instant,
    interval: Duration,
}

impl HeartbeatScheduler {
    pub fn new(interval: Duration) -> Self {
        HeartbeatScheduler { last_sent: Instant::now(), interval }
    }

    /// Resets the baseline — called on every role-transition into LEADER
    /// (heartbeating ourselves first is not required) and after every send.
    pub fn reset(&mut self) {
        self.last_sent = Instant::now();
    }

    pub fn time_remaining(&self, now: Instant) -> Duration {
        let elapsed = now.duration_since(self.last_sent);
        self.interval.saturating_sub(elapsed)
    }

    pub fn due(&self, now: Instant) -> bool {
        self.time_remaining(now).is_zero()
    }
}

/// Follower-side handling of an inbound HEARTBEAT: advances `current_term`
/// if needed and confirms `sender_id` as leader. Returns the term to adopt.
pub fn observe_heartbeat(current_term: Term, msg_term: Term) -> Option<Term> {
    if msg_term >= current_term {
        Some(msg_term.max(current_term))
    } else {
        None
    }
}

pub fn heartbeat_leader(sender_id: PeerId) -> PeerId {
    sender_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn watchdog_suspects_once_per_episode() {
        let mut wd = Watchdog::new(Duration::from_millis(20));
        sleep(Duration::from_millis(30));
        let now = Instant::now();
        assert!(wd.check(now));
        // Still overdue, but already suspected: no repeat firing.
        assert!(!wd.check(Instant::now()));
        wd.record_contact();
        assert!(!wd.check(Instant::now()));
    }

    #[test]
    fn heartbeat_scheduler_is_due_after_interval() {
        let hb = HeartbeatScheduler::new(Duration::from_millis(10));
        assert!(!hb.due(Instant::now()));
        sleep(Duration::from_millis(15));
        assert!(hb.due(Instant::now()));
    }

    #[test]
    fn heartbeat_term_discipline() {
        assert_eq!(observe_heartbeat(5, 5), Some(5));
        assert_eq!(observe_heartbeat(5, 7), Some(7));
        assert_eq!(observe_heartbeat(7, 5), None);
    }
}
