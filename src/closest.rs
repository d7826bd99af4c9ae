//! Distance-sorted accumulation of peers around a target id.

use crate::common::{Id, Peer};

#[derive(Debug, Clone)]
/// Collects peers sorted by ascending XOR distance to a target.
///
/// Backs [crate::RoutingTable::closest] and the iterative lookup shortlist.
/// Insertion keeps the vector sorted; a peer id is never stored twice, so two
/// identical states always enumerate in the same order.
pub struct ClosestPeers {
    target: Id,
    peers: Vec<Peer>,
}

impl ClosestPeers {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            peers: Vec::new(),
        }
    }

    // === Getters ===

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    // === Public Methods ===

    /// Insert a peer at its distance rank. A peer already known by id is left
    /// untouched (equal XOR distance to one target implies equal id).
    pub fn add(&mut self, peer: Peer) {
        let seek = peer.id().xor(&self.target);

        if let Err(position) = self
            .peers
            .binary_search_by(|probe| probe.id().xor(&self.target).cmp(&seek))
        {
            self.peers.insert(position, peer);
        }
    }

    /// Up to `count` closest peers, ascending distance.
    pub fn take(&self, count: usize) -> Vec<Peer> {
        self.peers[..count.min(self.peers.len())].to_vec()
    }
}
