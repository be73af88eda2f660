//! Shared identifiers and constants used across every component.
//!
//! Small `Copy` types and the tunable defaults, kept in one place so every
//! component agrees on them instead of re-declaring magic numbers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Globally unique id of a cluster member. Higher ids have higher election priority.
pub type PeerId = u64;

/// Monotonically increasing leadership epoch.
pub type Term = u64;

/// Monotonically increasing sequence number assigned by the leader.
pub type SeqNo = u64;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 800;
pub const DEFAULT_LEADER_TIMEOUT_MS: u64 = 2500;
pub const DEFAULT_ELECTION_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_WATCHDOG_POLL_MS: u64 = 250;
pub const DEFAULT_ROOM_ID: &str = "general";
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// How many (seq_no, term) pairs we remember explicitly for duplicate detection,
/// on top of the `last_seq` monotonic check.
pub const DEDUP_WINDOW: usize = 4096;

/// Network address and identity of a cluster member. Immutable once learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub host: std::net::IpAddr,
    pub port: u16,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, host: std::net::IpAddr, port: u16) -> Self {
        PeerInfo { peer_id, host, port }
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.host, self.port)
    }
}

/// Role of a node in the cluster. Only the orchestrator changes this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Timing configuration shared by the failure detector and election.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub heartbeat_interval: Duration,
    pub leader_timeout: Duration,
    pub election_timeout: Duration,
    pub watchdog_poll: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            leader_timeout: Duration::from_millis(DEFAULT_LEADER_TIMEOUT_MS),
            election_timeout: Duration::from_millis(DEFAULT_ELECTION_TIMEOUT_MS),
            watchdog_poll: Duration::from_millis(DEFAULT_WATCHDOG_POLL_MS),
        }
    }
}
