//! Wire protocol: JSON objects, one per line, over TCP.
//!
//! Every message carries a common header (`sender_id`, `term`, `msg_id`,
//! `room_id`) plus type-specific fields. Encoded as an internally tagged
//! `serde` enum so the `type` field on the wire selects the Rust variant
//! directly.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{PeerId, PeerInfo, SeqNo, Term, DEFAULT_ROOM_ID};

/// A single delivered chat message, as carried inside `SEQ_CHAT` and
/// `CATCHUP_RESP`, and as persisted to storage (see `storage::StorageRecord`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredChat {
    pub seq_no: SeqNo,
    pub term: Term,
    pub origin_sender_id: PeerId,
    pub msg_id: String,
    pub room_id: String,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "JOIN")]
    Join {
        sender_id: PeerId,
        term: Term,
        msg_id: String,
        room_id: String,
        peer_info: PeerInfo,
    },
    #[serde(rename = "JOIN_ACK")]
    JoinAck {
        sender_id: PeerId,
        term: Term,
        msg_id: String,
        room_id: String,
        peers: Vec<PeerInfo>,
        leader_id: Option<PeerId>,
    },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat {
        sender_id: PeerId,
        term: Term,
        msg_id: String,
        room_id: String,
    },
    #[serde(rename = "ELECTION")]
    Election {
        sender_id: PeerId,
        term: Term,
        msg_id: String,
        room_id: String,
    },
    #[serde(rename = "ELECTION_OK")]
    ElectionOk {
        sender_id: PeerId,
        term: Term,
        msg_id: String,
        room_id: String,
    },
    #[serde(rename = "COORDINATOR")]
    Coordinator {
        sender_id: PeerId,
        term: Term,
        msg_id: String,
        room_id: String,
        leader_peer_info: PeerInfo,
    },
    #[serde(rename = "CHAT")]
    Chat {
        sender_id: PeerId,
        term: Term,
        msg_id: String,
        room_id: String,
        payload: String,
    },
    #[serde(rename = "SEQ_CHAT")]
    SeqChat {
        sender_id: PeerId,
        term: Term,
        msg_id: String,
        room_id: String,
        seq_no: SeqNo,
        payload: String,
        origin_sender_id: PeerId,
    },
    #[serde(rename = "CATCHUP_REQ")]
    CatchupReq {
        sender_id: PeerId,
        term: Term,
        msg_id: String,
        room_id: String,
        since_seq: SeqNo,
    },
    #[serde(rename = "CATCHUP_RESP")]
    CatchupResp {
        sender_id: PeerId,
        term: Term,
        msg_id: String,
        room_id: String,
        messages: Vec<DeliveredChat>,
    },
}

impl Message {
    pub fn sender_id(&self) -> PeerId {
        match self {
            Message::Join { sender_id, .. }
            | Message::JoinAck { sender_id, .. }
            | Message::Heartbeat { sender_id, .. }
            | Message::Election { sender_id, .. }
            | Message::ElectionOk { sender_id, .. }
            | Message::Coordinator { sender_id, .. }
            | Message::Chat { sender_id, .. }
            | Message::SeqChat { sender_id, .. }
            | Message::CatchupReq { sender_id, .. }
            | Message::CatchupResp { sender_id, .. } => *sender_id,
        }
    }

    pub fn term(&self) -> Term {
        match self {
            Message::Join { term, .. }
            | Message::JoinAck { term, .. }
            | Message::Heartbeat { term, .. }
            | Message::Election { term, .. }
            | Message::ElectionOk { term, .. }
            | Message::Coordinator { term, .. }
            | Message::Chat { term, .. }
            | Message::SeqChat { term, .. }
            | Message::CatchupReq { term, .. }
            | Message::CatchupResp { term, .. } => *term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join { .. } => "JOIN",
            Message::JoinAck { .. } => "JOIN_ACK",
            Message::Heartbeat { .. } => "HEARTBEAT",
            Message::Election { .. } => "ELECTION",
            Message::ElectionOk { .. } => "ELECTION_OK",
            Message::Coordinator { .. } => "COORDINATOR",
            Message::Chat { .. } => "CHAT",
            Message::SeqChat { .. } => "SEQ_CHAT",
            Message::CatchupReq { .. } => "CATCHUP_REQ",
            Message::CatchupResp { .. } => "CATCHUP_RESP",
        }
    }

    /// Builds a header-only message (`HEARTBEAT`, `ELECTION`, `ELECTION_OK`) for the given sender/term.
    pub fn header_only(kind: HeaderOnlyKind, sender_id: PeerId, term: Term) -> Message {
        let msg_id = new_msg_id();
        let room_id = DEFAULT_ROOM_ID.to_string();
        match kind {
            HeaderOnlyKind::Heartbeat => Message::Heartbeat { sender_id, term, msg_id, room_id },
            HeaderOnlyKind::Election => Message::Election { sender_id, term, msg_id, room_id },
            HeaderOnlyKind::ElectionOk => Message::ElectionOk { sender_id, term, msg_id, room_id },
        }
    }

    pub fn join(sender_id: PeerId, peer_info: PeerInfo) -> Message {
        Message::Join {
            sender_id,
            term: 0,
            msg_id: new_msg_id(),
            room_id: DEFAULT_ROOM_ID.to_string(),
            peer_info,
        }
    }

    pub fn join_ack(
        sender_id: PeerId,
        term: Term,
        peers: Vec<PeerInfo>,
        leader_id: Option<PeerId>,
    ) -> Message {
        Message::JoinAck {
            sender_id,
            term,
            msg_id: new_msg_id(),
            room_id: DEFAULT_ROOM_ID.to_string(),
            peers,
            leader_id,
        }
    }

    pub fn coordinator(sender_id: PeerId, term: Term, leader_peer_info: PeerInfo) -> Message {
        Message::Coordinator {
            sender_id,
            term,
            msg_id: new_msg_id(),
            room_id: DEFAULT_ROOM_ID.to_string(),
            leader_peer_info,
        }
    }

    pub fn chat(sender_id: PeerId, payload: String) -> Message {
        // CHAT's term is don't-care on the wire; the leader assigns the
        // authoritative term when it mints the corresponding SEQ_CHAT.
        Message::Chat {
            sender_id,
            term: 0,
            msg_id: new_msg_id(),
            room_id: DEFAULT_ROOM_ID.to_string(),
            payload,
        }
    }

    pub fn seq_chat(sender_id: PeerId, chat: DeliveredChat) -> Message {
        Message::SeqChat {
            sender_id,
            term: chat.term,
            msg_id: chat.msg_id.clone(),
            room_id: chat.room_id.clone(),
            seq_no: chat.seq_no,
            payload: chat.payload,
            origin_sender_id: chat.origin_sender_id,
        }
    }

    pub fn catchup_req(sender_id: PeerId, since_seq: SeqNo) -> Message {
        Message::CatchupReq {
            sender_id,
            term: 0,
            msg_id: new_msg_id(),
            room_id: DEFAULT_ROOM_ID.to_string(),
            since_seq,
        }
    }

    pub fn catchup_resp(sender_id: PeerId, term: Term, messages: Vec<DeliveredChat>) -> Message {
        Message::CatchupResp {
            sender_id,
            term,
            msg_id: new_msg_id(),
            room_id: DEFAULT_ROOM_ID.to_string(),
            messages,
        }
    }

    /// Extracts the embedded `DeliveredChat` from a `SEQ_CHAT` message.
    pub fn as_delivered_chat(&self) -> Option<DeliveredChat> {
        match self {
            Message::SeqChat {
                term,
                msg_id,
                room_id,
                seq_no,
                payload,
                origin_sender_id,
                ..
            } => Some(DeliveredChat {
                seq_no: *seq_no,
                term: *term,
                origin_sender_id: *origin_sender_id,
                msg_id: msg_id.clone(),
                room_id: room_id.clone(),
                payload: payload.clone(),
            }),
            _ => None,
        }
    }
}

pub enum HeaderOnlyKind {
    Heartbeat,
    Election,
    ElectionOk,
}

pub fn new_msg_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer(id: PeerId) -> PeerInfo {
        PeerInfo::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), 9000 + id as u16)
    }

    #[test]
    fn round_trips_through_json_lines() {
        let msg = Message::coordinator(3, 7, peer(3));
        let line = serde_json::to_string(&msg).unwrap();
        assert!(line.contains("\"type\":\"COORDINATOR\""));
        let back: Message = serde_json::from_str(&line).unwrap();
        assert_eq!(back.sender_id(), 3);
        assert_eq!(back.term(), 7);
        assert_eq!(back.kind(), "COORDINATOR");
    }

    #[test]
    fn seq_chat_round_trips_its_delivered_chat() {
        let chat = DeliveredChat {
            seq_no: 5,
            term: 2,
            origin_sender_id: 1,
            msg_id: new_msg_id(),
            room_id: "general".into(),
            payload: "hi".into(),
        };
        let msg = Message::seq_chat(9, chat.clone());
        assert_eq!(msg.as_delivered_chat(), Some(chat));
    }
}
