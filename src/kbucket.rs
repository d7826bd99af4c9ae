//! Kbuckets
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddrV4,
    slice::Iter,
    time::Instant,
};

use crate::common::{Id, Peer};

/// K = the default maximum size of a k-bucket.
pub const DEFAULT_K: usize = 20;

/// A bounded list of peers ordered by freshness: the head (index 0) is the
/// least recently seen peer, the tail the most recently seen.
///
/// Kbuckets never drop a responsive peer for an unknown one; when full, the
/// routing table defers the decision until the head has been probed.
pub struct KBucket {
    /// Maximum number of peers in the bucket. Controls the redundancy factor
    /// of the DHT: the higher, the more peers we keep per prefix.
    k: usize,
    /// Peers in the k-bucket, sorted by the least recently seen.
    peers: Vec<Peer>,
    /// Last time this bucket or any of its peers were updated.
    last_refreshed: Instant,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket {
            k: DEFAULT_K,
            peers: Vec::with_capacity(DEFAULT_K),
            last_refreshed: Instant::now(),
        }
    }

    // === Options ===

    pub fn with_size(mut self, k: usize) -> Self {
        self.k = k;
        self.peers = Vec::with_capacity(k);
        self
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.k
    }

    /// The least recently seen peer, the one probed before any eviction.
    pub fn head(&self) -> Option<&Peer> {
        self.peers.first()
    }

    pub fn iter(&self) -> Iter<'_, Peer> {
        self.peers.iter()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.peers.iter().any(|peer| peer.id() == id)
    }

    pub fn last_refreshed(&self) -> Instant {
        self.last_refreshed
    }

    // === Public Methods ===

    /// Move the peer with `id` to the tail, updating its address and
    /// `last_seen`. Returns false if the peer is not in the bucket.
    pub fn touch(&mut self, id: &Id, address: SocketAddrV4) -> bool {
        match self.peers.iter().position(|peer| peer.id() == id) {
            Some(index) => {
                let mut peer = self.peers.remove(index);
                peer.touch(address);
                self.peers.push(peer);
                self.last_refreshed = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Move the peer with `id` to the tail keeping its address.
    pub fn promote(&mut self, id: &Id) -> bool {
        match self.peers.iter().position(|peer| peer.id() == id) {
            Some(index) => {
                let mut peer = self.peers.remove(index);
                peer.promote();
                self.peers.push(peer);
                self.last_refreshed = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Append a peer at the tail. Callers check [KBucket::is_full] and
    /// [KBucket::contains] first; a full bucket rejects the peer.
    pub fn push(&mut self, peer: Peer) -> bool {
        if self.is_full() || self.contains(peer.id()) {
            return false;
        }

        self.peers.push(peer);
        self.last_refreshed = Instant::now();
        true
    }

    pub fn remove(&mut self, id: &Id) -> Option<Peer> {
        let index = self.peers.iter().position(|peer| peer.id() == id)?;
        Some(self.peers.remove(index))
    }

    /// Record that this bucket was the target of a refresh lookup.
    pub fn mark_refreshed(&mut self) {
        self.last_refreshed = Instant::now();
    }
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for KBucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "KBucket{{ peers: {} }}", &self.peers.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn peer() -> Peer {
        Peer::random()
    }

    #[test]
    fn max_size() {
        let mut bucket = KBucket::new();
        for _ in 0..DEFAULT_K {
            assert!(bucket.push(peer()));
        }

        assert!(bucket.is_full());
        assert!(!bucket.push(peer()));
        assert_eq!(bucket.len(), DEFAULT_K);
    }

    #[test]
    fn no_duplicate_ids() {
        let mut bucket = KBucket::new();
        let peer = peer();

        assert!(bucket.push(peer.clone()));
        assert!(!bucket.push(peer));
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn touch_moves_to_tail() {
        let mut bucket = KBucket::new().with_size(3);

        let (p1, p2, p3) = (peer(), peer(), peer());
        bucket.push(p1.clone());
        bucket.push(p2.clone());
        bucket.push(p3.clone());

        assert!(bucket.touch(p1.id(), *p1.address()));

        let order: Vec<Id> = bucket.iter().map(|p| *p.id()).collect();
        assert_eq!(order, vec![*p2.id(), *p3.id(), *p1.id()]);
    }

    #[test]
    fn touch_updates_address() {
        let mut bucket = KBucket::new();
        let peer = peer();
        bucket.push(peer.clone());

        let new_address = SocketAddrV4::new([10, 0, 0, 1].into(), 4242);
        bucket.touch(peer.id(), new_address);

        assert_eq!(bucket.iter().next().unwrap().address(), &new_address);
    }

    #[test]
    fn last_seen_is_monotonic_head_to_tail() {
        let mut bucket = KBucket::new();
        for _ in 0..5 {
            bucket.push(peer());
        }
        let head_id = *bucket.head().unwrap().id();
        bucket.promote(&head_id);

        let seen: Vec<_> = bucket.iter().map(|p| p.last_seen()).collect();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn head_is_least_recently_seen() {
        let mut bucket = KBucket::new();
        let first = peer();
        bucket.push(first.clone());
        bucket.push(peer());

        assert_eq!(bucket.head().unwrap().id(), first.id());

        bucket.touch(first.id(), *first.address());
        assert_ne!(bucket.head().unwrap().id(), first.id());
    }
}
