//! Crate-wide error taxonomy.
//!
//! The orchestrator matches on these to decide "log and continue" (almost
//! everything) vs. "terminate the node" (`StorageFatal` only).

use std::net::SocketAddr;
use thiserror::Error;

use crate::common::PeerId;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("peer {peer_id} at {addr} unreachable: {source}")]
    TransientTransport {
        peer_id: PeerId,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol violation on {addr}: {reason}")]
    ProtocolViolation { addr: SocketAddr, reason: String },

    #[error("stale term: message term {msg_term} < current term {current_term}")]
    StaleTerm { msg_term: u64, current_term: u64 },

    #[error("duplicate message: seq_no {seq_no} term {term} already delivered")]
    Duplicate { seq_no: u64, term: u64 },

    #[error("gap stale: seq_no {seq_no} <= last_seq {last_seq}")]
    GapStale { seq_no: u64, last_seq: u64 },

    #[error("leader unknown, dropping forwarded CHAT")]
    LeaderUnknown,

    #[error("{0}")]
    Usage(String),

    #[error("storage append failed for {path}: {source}")]
    StorageFatal {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
