//! Cluster membership: the peer map, the seed list, and who we currently
//! believe the leader is.

use std::collections::HashMap;

use crate::common::{PeerId, PeerInfo, Term};

#[derive(Debug)]
pub struct Membership {
    self_id: PeerId,
    peers: HashMap<PeerId, PeerInfo>,
    leader_id: Option<PeerId>,
    leader_term: Term,
    seeds: Vec<PeerInfo>,
}

impl Membership {
    pub fn new(self_id: PeerId, seeds: Vec<PeerInfo>) -> Self {
        Membership {
            self_id,
            peers: HashMap::new(),
            leader_id: None,
            leader_term: 0,
            seeds,
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn seeds(&self) -> &[PeerInfo] {
        &self.seeds
    }

    pub fn leader_id(&self) -> Option<PeerId> {
        self.leader_id
    }

    /// Upserts a peer into the map. A no-op if it would be `self_id`.
    pub fn add_or_update(&mut self, peer: PeerInfo) {
        if peer.peer_id == self.self_id {
            return;
        }
        self.peers.insert(peer.peer_id, peer);
    }

    /// Used only on explicit exit, never on transient unreachability.
    pub fn remove(&mut self, peer_id: PeerId) {
        self.peers.remove(&peer_id);
        if self.leader_id == Some(peer_id) {
            self.leader_id = None;
        }
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&PeerInfo> {
        self.peers.get(&peer_id)
    }

    /// Sets the leader, rejecting the update if `term` is stale.
    /// Returns whether the leader actually changed.
    pub fn set_leader(&mut self, peer_id: PeerId, term: Term) -> bool {
        if term < self.leader_term {
            return false;
        }
        self.leader_term = term;
        let changed = self.leader_id != Some(peer_id);
        self.leader_id = Some(peer_id);
        changed
    }

    pub fn clear_leader(&mut self) {
        self.leader_id = None;
    }

    /// All known peers with a higher id than us (candidates that would beat
    /// us in an election and so get ELECTION requests).
    pub fn higher_priority_peers(&self) -> Vec<PeerInfo> {
        self.peers
            .values()
            .filter(|p| p.peer_id > self.self_id)
            .copied()
            .collect()
    }

    pub fn all_peers_except_self(&self) -> Vec<PeerInfo> {
        self.peers.values().copied().collect()
    }

    /// Highest id we know about, counting peers, seeds, and ourselves — used
    /// during bootstrap, before any JOIN_ACK has populated the peer map.
    pub fn highest_known_peer_id(&self) -> PeerId {
        self.peers
            .keys()
            .copied()
            .chain(self.seeds.iter().map(|p| p.peer_id))
            .fold(self.self_id, std::cmp::max)
    }

    /// Is `self_id` the highest id we know about (including ourselves)?
    pub fn self_is_highest_known(&self) -> bool {
        self.highest_known_peer_id() == self.self_id
    }

    /// Snapshot of our current view, as carried in a JOIN_ACK: every known
    /// peer plus ourselves (the responder is, after all, a member too).
    pub fn view_for_join_ack(&self, self_info: PeerInfo) -> Vec<PeerInfo> {
        let mut v: Vec<PeerInfo> = self.peers.values().copied().collect();
        v.push(self_info);
        v
    }

    /// Merges the peer set carried in a JOIN_ACK and adopts its leader/term
    /// if it has one and it isn't stale relative to what we already know.
    pub fn merge_join_ack(&mut self, peers: Vec<PeerInfo>, leader_id: Option<PeerId>, term: Term) {
        for p in peers {
            self.add_or_update(p);
        }
        if let Some(leader) = leader_id {
            self.set_leader(leader, term);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer(id: PeerId) -> PeerInfo {
        PeerInfo::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), 9000 + id as u16)
    }

    #[test]
    fn self_never_enters_peer_map() {
        let mut m = Membership::new(2, vec![]);
        m.add_or_update(peer(2));
        assert!(m.get(2).is_none());
    }

    #[test]
    fn leader_updates_are_monotonic_in_term() {
        let mut m = Membership::new(1, vec![]);
        assert!(m.set_leader(3, 5));
        assert_eq!(m.leader_id(), Some(3));
        // Stale term: rejected.
        assert!(!m.set_leader(4, 4));
        assert_eq!(m.leader_id(), Some(3));
        // Same-or-higher term: accepted.
        assert!(m.set_leader(4, 5));
        assert_eq!(m.leader_id(), Some(4));
    }

    #[test]
    fn higher_priority_peers_excludes_lower_and_self() {
        let mut m = Membership::new(3, vec![]);
        m.add_or_update(peer(1));
        m.add_or_update(peer(5));
        m.add_or_update(peer(7));
        let mut ids: Vec<_> = m.higher_priority_peers().iter().map(|p| p.peer_id).collect();
        ids.sort();
        assert_eq!(ids, vec![5, 7]);
    }

    #[test]
    fn self_is_highest_known_reflects_peer_set() {
        let mut m = Membership::new(3, vec![]);
        assert!(m.self_is_highest_known());
        m.add_or_update(peer(9));
        assert!(!m.self_is_highest_known());
    }

    #[test]
    fn remove_drops_the_peer_and_clears_leadership_if_it_was_leader() {
        let mut m = Membership::new(1, vec![]);
        m.add_or_update(peer(2));
        m.set_leader(2, 3);
        assert_eq!(m.leader_id(), Some(2));

        m.remove(2);
        assert!(m.get(2).is_none());
        assert_eq!(m.leader_id(), None);
    }

    #[test]
    fn remove_of_a_non_leader_peer_leaves_leadership_untouched() {
        let mut m = Membership::new(1, vec![]);
        m.add_or_update(peer(2));
        m.add_or_update(peer(4));
        m.set_leader(4, 1);

        m.remove(2);
        assert!(m.get(2).is_none());
        assert_eq!(m.leader_id(), Some(4));
    }
}
