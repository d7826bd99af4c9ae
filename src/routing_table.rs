//! Kademlia routing table with deferred insertion.
//!
//! 160 flat k-buckets keyed by the common prefix length with the local id,
//! stored sparsely. Observing a peer whose bucket is full never evicts
//! anything synchronously: the candidate waits in the insertion queue until
//! the bucket head has been probed for liveness, and the probe outcome is
//! reconciled through [RoutingTable::on_probe_result].

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Debug, Formatter};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, trace};

use crate::closest::ClosestPeers;
use crate::common::{Id, Peer};
use crate::kbucket::{KBucket, DEFAULT_K};

/// Effect of a single [RoutingTable::observe] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The peer was already known; freshness and address updated.
    Refreshed,
    /// The peer was appended to a bucket with free space.
    Inserted,
    /// The target bucket is full; the peer was queued and a probe of the
    /// bucket head is wanted.
    Enqueued,
    /// The peer carries the local id and was ignored.
    OwnId,
}

/// What the insertion worker should do for a bucket with queued candidates.
#[derive(Debug, Clone)]
pub enum ProbeDecision {
    /// Ping this bucket head; reconcile through [RoutingTable::on_probe_result].
    Probe(Peer),
    /// The bucket had room; this many candidates were admitted directly.
    Admitted(usize),
    /// Nothing to do: no candidates, or a probe is already in flight.
    Idle,
}

pub struct RoutingTable {
    id: Id,
    k: usize,
    buckets: BTreeMap<u8, KBucket>,
    queue: InsertionQueue,
}

impl RoutingTable {
    /// Create a new [RoutingTable] centered on the given local id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            k: DEFAULT_K,
            buckets: BTreeMap::new(),
            queue: InsertionQueue::default(),
        }
    }

    // === Options ===

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    // === Getters ===

    /// The local [Id] all distances are measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Number of peers in the table.
    pub fn size(&self) -> usize {
        self.buckets.values().map(|bucket| bucket.len()).sum()
    }

    // === Public Methods ===

    /// Record inbound evidence of liveness for `peer`. Total: never fails.
    ///
    /// Known peers move to their bucket tail; peers targeting a bucket with
    /// room are appended; peers targeting a full bucket are queued until the
    /// head has been probed. The caller is responsible for scheduling that
    /// probe when [Observation::Enqueued] is returned.
    pub fn observe(&mut self, peer: Peer) -> Observation {
        if peer.id() == &self.id {
            return Observation::OwnId;
        }

        let index = self.id.bucket_index(peer.id());
        let k = self.k;
        let bucket = self
            .buckets
            .entry(index)
            .or_insert_with(|| KBucket::new().with_size(k));

        if bucket.touch(peer.id(), *peer.address()) {
            trace!(id = %peer.id(), bucket = index, "observe: refreshed");
            // A refreshed peer cannot also be a pending candidate.
            self.queue.discard(index, peer.id());
            return Observation::Refreshed;
        }

        if bucket.push(peer.clone()) {
            debug!(id = %peer.id(), address = %peer.address(), bucket = index, "observe: inserted");
            return Observation::Inserted;
        }

        debug!(id = %peer.id(), bucket = index, "observe: bucket full, candidate enqueued");
        self.queue.push(index, peer);
        Observation::Enqueued
    }

    /// Insertion-worker entry point: resolve the queue state of one bucket.
    ///
    /// Candidates are admitted directly while the bucket has free space. If
    /// candidates remain against a full bucket and no probe is in flight for
    /// it, the current head is selected for probing.
    pub fn prepare_probe(&mut self, index: u8) -> ProbeDecision {
        if self.queue.is_probing(index) {
            return ProbeDecision::Idle;
        }

        let bucket = match self.buckets.get_mut(&index) {
            Some(bucket) => bucket,
            None => return ProbeDecision::Idle,
        };

        let mut admitted = 0;
        while !bucket.is_full() {
            match self.queue.pop(index) {
                Some(candidate) => {
                    // The candidate may have slipped in through another path
                    // while it was queued.
                    if bucket.touch(candidate.id(), *candidate.address()) {
                        continue;
                    }
                    debug!(id = %candidate.id(), bucket = index, "insertion queue: admitted directly");
                    bucket.push(candidate);
                    admitted += 1;
                }
                None => break,
            }
        }

        if self.queue.has_pending(index) {
            if let Some(head) = bucket.head() {
                self.queue.set_probing(index, *head.id());
                return ProbeDecision::Probe(head.clone());
            }
        }

        if admitted > 0 {
            ProbeDecision::Admitted(admitted)
        } else {
            ProbeDecision::Idle
        }
    }

    /// Reconcile the outcome of a liveness probe against a bucket head.
    ///
    /// A live head moves to the tail and costs the oldest queued candidate
    /// its seat; a dead head is evicted and the oldest candidate admitted.
    /// Returns true when more candidates are waiting on this bucket.
    pub fn on_probe_result(&mut self, index: u8, head_id: &Id, alive: bool) -> bool {
        self.queue.clear_probing(index);

        let bucket = match self.buckets.get_mut(&index) {
            Some(bucket) => bucket,
            None => return self.queue.has_pending(index),
        };

        if alive {
            let promoted = bucket.promote(head_id);
            let discarded = self.queue.pop(index);
            debug!(
                head = %head_id,
                bucket = index,
                promoted,
                discarded = discarded.is_some(),
                "probe_result: head alive"
            );
        } else {
            if bucket.remove(head_id).is_some() {
                debug!(head = %head_id, bucket = index, "probe_result: head dead, evicted");
            }
            if let Some(candidate) = self.queue.pop(index) {
                if !bucket.is_full() && bucket.push(candidate.clone()) {
                    debug!(id = %candidate.id(), bucket = index, "probe_result: candidate admitted");
                }
            }
        }

        self.queue.has_pending(index)
    }

    /// Up to `count` peers sorted by ascending XOR distance to `target`.
    ///
    /// Deterministic for identical table states; returns fewer peers when the
    /// table holds fewer. Never fails.
    pub fn closest(&self, target: &Id, count: usize) -> Vec<Peer> {
        let mut closest = ClosestPeers::new(*target);

        for bucket in self.buckets.values() {
            for peer in bucket.iter() {
                closest.add(peer.clone());
            }
        }

        closest.take(count)
    }

    /// Unconditional removal, used on definitive failures.
    pub fn remove(&mut self, peer_id: &Id) {
        let index = self.id.bucket_index(peer_id);

        if let Some(bucket) = self.buckets.get_mut(&index) {
            if bucket.remove(peer_id).is_some() {
                debug!(id = %peer_id, bucket = index, "evicted");
            }
        }

        // A queued candidate with this id is equally gone.
        self.queue.discard(index, peer_id);
    }

    /// Snapshot of every peer, bucket order. Used by the maintenance loop.
    pub fn peers(&self) -> Vec<Peer> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.iter().cloned())
            .collect()
    }

    /// Indices of non-empty buckets that saw no activity within `horizon`.
    pub fn stale_buckets(&self, horizon: Duration) -> Vec<u8> {
        self.buckets
            .iter()
            .filter(|(_, bucket)| !bucket.is_empty() && bucket.last_refreshed().elapsed() > horizon)
            .map(|(index, _)| *index)
            .collect()
    }

    /// Record that a refresh lookup targeted this bucket.
    pub fn mark_refreshed(&mut self, index: u8) {
        if let Some(bucket) = self.buckets.get_mut(&index) {
            bucket.mark_refreshed();
        }
    }

    /// Forget an in-flight probe that was never sent. Returns true when
    /// candidates are still waiting on this bucket.
    pub(crate) fn abort_probe(&mut self, index: u8) -> bool {
        self.queue.clear_probing(index);
        self.queue.has_pending(index)
    }

    /// Admit whatever fits and drop the rest. Shutdown path: no new probes.
    pub fn drain_insertion_queue(&mut self) {
        let indices: Vec<u8> = self.queue.pending_buckets();

        for index in indices {
            if let Some(bucket) = self.buckets.get_mut(&index) {
                while !bucket.is_full() {
                    match self.queue.pop(index) {
                        Some(candidate) => {
                            if !bucket.contains(candidate.id()) {
                                bucket.push(candidate);
                            }
                        }
                        None => break,
                    }
                }
            }
            self.queue.clear(index);
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, peer_id: &Id) -> bool {
        let index = self.id.bucket_index(peer_id);

        self.buckets
            .get(&index)
            .map(|bucket| bucket.contains(peer_id))
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn bucket(&self, index: u8) -> Option<&KBucket> {
        self.buckets.get(&index)
    }
}

/// Acquire the shared table, recovering from a poisoned lock: the table's
/// invariants hold after every public method, panic or not.
pub(crate) fn lock(table: &Mutex<RoutingTable>) -> MutexGuard<'_, RoutingTable> {
    match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Debug for RoutingTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RoutingTable{{ id: {}, peers: {}, buckets: {} }}",
            self.id,
            self.size(),
            self.buckets.len()
        )
    }
}

/// Per-bucket FIFO of insertion candidates awaiting a probe outcome, plus the
/// head currently under probe (at most one per bucket).
#[derive(Default)]
struct InsertionQueue {
    pending: BTreeMap<u8, VecDeque<Peer>>,
    probing: BTreeMap<u8, Id>,
}

impl InsertionQueue {
    /// Queue a candidate. Duplicates by id collapse; the most recent wins.
    fn push(&mut self, index: u8, peer: Peer) {
        let fifo = self.pending.entry(index).or_default();
        fifo.retain(|candidate| candidate.id() != peer.id());
        fifo.push_back(peer);
    }

    fn pop(&mut self, index: u8) -> Option<Peer> {
        let fifo = self.pending.get_mut(&index)?;
        let candidate = fifo.pop_front();
        if fifo.is_empty() {
            self.pending.remove(&index);
        }
        candidate
    }

    fn discard(&mut self, index: u8, peer_id: &Id) {
        if let Some(fifo) = self.pending.get_mut(&index) {
            fifo.retain(|candidate| candidate.id() != peer_id);
            if fifo.is_empty() {
                self.pending.remove(&index);
            }
        }
    }

    fn has_pending(&self, index: u8) -> bool {
        self.pending.contains_key(&index)
    }

    fn pending_buckets(&self) -> Vec<u8> {
        self.pending.keys().copied().collect()
    }

    fn clear(&mut self, index: u8) {
        self.pending.remove(&index);
        self.probing.remove(&index);
    }

    fn is_probing(&self, index: u8) -> bool {
        self.probing.contains_key(&index)
    }

    fn set_probing(&mut self, index: u8, head_id: Id) {
        self.probing.insert(index, head_id);
    }

    fn clear_probing(&mut self, index: u8) {
        self.probing.remove(&index);
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddrV4;

    use super::*;
    use crate::common::ID_SIZE;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    fn id_with_last_byte(byte: u8) -> Id {
        let mut bytes = [0_u8; ID_SIZE];
        bytes[ID_SIZE - 1] = byte;
        Id(bytes)
    }

    /// Ids sharing exactly five leading bits with zero: 0b0000_0100 prefix.
    fn id_in_bucket_5(low: u8) -> Id {
        let mut bytes = [0_u8; ID_SIZE];
        bytes[0] = 0b0000_0100;
        bytes[ID_SIZE - 1] = low;
        Id(bytes)
    }

    #[test]
    fn fresh_insert() {
        let local = Id([0; ID_SIZE]);
        let mut table = RoutingTable::new(local);

        let peer = Peer::new(id_with_last_byte(1), addr(4000));
        assert_eq!(table.observe(peer.clone()), Observation::Inserted);

        let bucket = table.bucket(159).unwrap();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.head().unwrap().id(), peer.id());

        let closest = table.closest(peer.id(), 1);
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].id(), peer.id());
    }

    #[test]
    fn refresh_ordering() {
        let local = Id([0; ID_SIZE]);
        let mut table = RoutingTable::new(local).with_k(3);

        let p1 = Peer::new(id_in_bucket_5(1), addr(1));
        let p2 = Peer::new(id_in_bucket_5(2), addr(2));
        let p3 = Peer::new(id_in_bucket_5(3), addr(3));

        table.observe(p1.clone());
        table.observe(p2.clone());
        table.observe(p3.clone());
        assert_eq!(table.observe(p1.clone()), Observation::Refreshed);

        let order: Vec<Id> = table.bucket(5).unwrap().iter().map(|p| *p.id()).collect();
        assert_eq!(order, vec![*p2.id(), *p3.id(), *p1.id()]);
    }

    #[test]
    fn full_bucket_probe_head_alive() {
        let local = Id([0; ID_SIZE]);
        let mut table = RoutingTable::new(local).with_k(2);

        let head = Peer::new(id_in_bucket_5(1), addr(1));
        let tail = Peer::new(id_in_bucket_5(2), addr(2));
        let newcomer = Peer::new(id_in_bucket_5(3), addr(3));

        table.observe(head.clone());
        table.observe(tail.clone());
        assert_eq!(table.observe(newcomer.clone()), Observation::Enqueued);

        // Bucket untouched until the probe resolves.
        let order: Vec<Id> = table.bucket(5).unwrap().iter().map(|p| *p.id()).collect();
        assert_eq!(order, vec![*head.id(), *tail.id()]);

        let probed = match table.prepare_probe(5) {
            ProbeDecision::Probe(peer) => peer,
            other => panic!("expected probe, got {other:?}"),
        };
        assert_eq!(probed.id(), head.id());

        let more = table.on_probe_result(5, head.id(), true);
        assert!(!more);

        let order: Vec<Id> = table.bucket(5).unwrap().iter().map(|p| *p.id()).collect();
        assert_eq!(order, vec![*tail.id(), *head.id()]);
        assert!(!table.contains(newcomer.id()));
    }

    #[test]
    fn full_bucket_probe_head_dead() {
        let local = Id([0; ID_SIZE]);
        let mut table = RoutingTable::new(local).with_k(2);

        let head = Peer::new(id_in_bucket_5(1), addr(1));
        let tail = Peer::new(id_in_bucket_5(2), addr(2));
        let newcomer = Peer::new(id_in_bucket_5(3), addr(3));

        table.observe(head.clone());
        table.observe(tail.clone());
        table.observe(newcomer.clone());

        match table.prepare_probe(5) {
            ProbeDecision::Probe(peer) => assert_eq!(peer.id(), head.id()),
            other => panic!("expected probe, got {other:?}"),
        }

        let more = table.on_probe_result(5, head.id(), false);
        assert!(!more);

        let order: Vec<Id> = table.bucket(5).unwrap().iter().map(|p| *p.id()).collect();
        assert_eq!(order, vec![*tail.id(), *newcomer.id()]);
        assert!(!table.contains(head.id()));
    }

    #[test]
    fn one_probe_per_bucket() {
        let local = Id([0; ID_SIZE]);
        let mut table = RoutingTable::new(local).with_k(1);

        table.observe(Peer::new(id_in_bucket_5(1), addr(1)));
        table.observe(Peer::new(id_in_bucket_5(2), addr(2)));
        table.observe(Peer::new(id_in_bucket_5(3), addr(3)));

        assert!(matches!(table.prepare_probe(5), ProbeDecision::Probe(_)));
        // Second call while the probe is in flight.
        assert!(matches!(table.prepare_probe(5), ProbeDecision::Idle));
    }

    #[test]
    fn queued_duplicates_collapse() {
        let local = Id([0; ID_SIZE]);
        let mut table = RoutingTable::new(local).with_k(1);

        let resident = Peer::new(id_in_bucket_5(1), addr(1));
        table.observe(resident.clone());

        let candidate_id = id_in_bucket_5(2);
        table.observe(Peer::new(candidate_id, addr(2)));
        table.observe(Peer::new(candidate_id, addr(22)));

        match table.prepare_probe(5) {
            ProbeDecision::Probe(_) => {}
            other => panic!("expected probe, got {other:?}"),
        }
        // Head dead: the single collapsed candidate is admitted, with the
        // most recent address winning.
        table.on_probe_result(5, resident.id(), false);

        let bucket = table.bucket(5).unwrap();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.head().unwrap().address(), &addr(22));
    }

    #[test]
    fn admits_directly_when_space_appears() {
        let local = Id([0; ID_SIZE]);
        let mut table = RoutingTable::new(local).with_k(2);

        let head = Peer::new(id_in_bucket_5(1), addr(1));
        let tail = Peer::new(id_in_bucket_5(2), addr(2));
        let newcomer = Peer::new(id_in_bucket_5(3), addr(3));

        table.observe(head.clone());
        table.observe(tail);
        table.observe(newcomer.clone());

        // The head goes away through another path before any probe starts.
        table.remove(head.id());

        match table.prepare_probe(5) {
            ProbeDecision::Admitted(count) => assert_eq!(count, 1),
            other => panic!("expected direct admission, got {other:?}"),
        }
        assert!(table.contains(newcomer.id()));
    }

    #[test]
    fn observe_is_idempotent_in_membership() {
        let mut table = RoutingTable::new(Id::random());
        let peer = Peer::random();

        table.observe(peer.clone());
        table.observe(peer.clone());
        table.observe(peer.clone());

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn should_not_add_self() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);

        assert_eq!(
            table.observe(Peer::new(local, addr(1))),
            Observation::OwnId
        );
        assert!(table.is_empty());
    }

    #[test]
    fn peers_live_in_their_prefix_bucket() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);

        for _ in 0..64 {
            table.observe(Peer::random());
        }

        for peer in table.peers() {
            let index = local.bucket_index(peer.id());
            assert!(table.bucket(index).unwrap().contains(peer.id()));
        }
    }

    #[test]
    fn closest_is_sorted_and_deterministic() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);

        for _ in 0..50 {
            table.observe(Peer::random());
        }

        let target = Id::random();
        let first = table.closest(&target, 20);
        let second = table.closest(&target, 20);

        assert_eq!(first.len(), 20);
        for window in first.windows(2) {
            assert!(window[0].id().xor(&target) < window[1].id().xor(&target));
        }
        let first_ids: Vec<Id> = first.iter().map(|p| *p.id()).collect();
        let second_ids: Vec<Id> = second.iter().map(|p| *p.id()).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn closest_returns_fewer_when_table_is_small() {
        let mut table = RoutingTable::new(Id::random());
        table.observe(Peer::random());

        assert_eq!(table.closest(&Id::random(), 20).len(), 1);
    }

    #[test]
    fn remove_drops_queued_candidates_too() {
        let local = Id([0; ID_SIZE]);
        let mut table = RoutingTable::new(local).with_k(1);

        table.observe(Peer::new(id_in_bucket_5(1), addr(1)));
        let queued = Peer::new(id_in_bucket_5(2), addr(2));
        table.observe(queued.clone());

        table.remove(queued.id());

        assert!(matches!(table.prepare_probe(5), ProbeDecision::Idle));
    }

    #[test]
    fn drain_admits_without_probing() {
        let local = Id([0; ID_SIZE]);
        let mut table = RoutingTable::new(local).with_k(2);

        table.observe(Peer::new(id_in_bucket_5(1), addr(1)));
        let queued = Peer::new(id_in_bucket_5(2), addr(2));
        table.observe(Peer::new(id_in_bucket_5(3), addr(3)));
        table.observe(queued.clone());

        table.drain_insertion_queue();

        // No free slot: everything pending was dropped, nothing was evicted.
        assert_eq!(table.size(), 2);
        assert!(matches!(table.prepare_probe(5), ProbeDecision::Idle));
    }

    #[test]
    fn stale_buckets_reports_untouched_ones() {
        let mut table = RoutingTable::new(Id::random());
        table.observe(Peer::random());

        assert!(table.stale_buckets(Duration::from_secs(60)).is_empty());

        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(table.stale_buckets(Duration::from_millis(1)).len(), 1);
    }
}
