//! Iterative FIND_NODE lookup.
//!
//! The canonical Kademlia convergence procedure: keep `alpha` FIND_NODE
//! requests in flight against the closest unqueried peers to the target,
//! merge every returned peer into a distance-sorted shortlist, and stop once
//! the k closest observed peers have all answered. Only peers among the k
//! closest are ever queried, so a round that discovers nothing closer leads
//! straight to termination.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::closest::ClosestPeers;
use crate::common::{Id, Peer};
use crate::messages::{Message, MessageKind};
use crate::routing_table::{self, RoutingTable};
use crate::socket::KadSocket;
use crate::supervisor::Supervisor;

pub(crate) enum LookupEvent {
    Response { peer_id: Id, peers: Vec<Peer> },
    Failed { peer_id: Id },
}

/// One iterative lookup. Runs on the calling thread; responses and timeouts
/// arrive through supervisor callbacks and are collected over a channel.
pub(crate) struct Lookup {
    pub local_id: Id,
    pub target: Id,
    pub alpha: usize,
    pub k: usize,
    pub request_timeout: Duration,
}

impl Lookup {
    /// Drive the lookup to completion and return up to k responders,
    /// distance-sorted. Non-responders are removed from the routing table.
    pub fn run(
        &self,
        table: &Arc<Mutex<RoutingTable>>,
        supervisor: &Arc<Supervisor>,
        socket: &Arc<KadSocket>,
        seeds: Vec<Peer>,
    ) -> Vec<Peer> {
        let (tx, rx) = flume::unbounded::<LookupEvent>();

        let mut shortlist = ClosestPeers::new(self.target);
        for seed in seeds {
            if seed.id() != &self.local_id {
                shortlist.add(seed);
            }
        }

        if shortlist.is_empty() {
            debug!(lookup_target = %self.target, "lookup with no candidates");
            return Vec::new();
        }

        let mut queried: HashSet<Id> = HashSet::new();
        let mut failed: HashSet<Id> = HashSet::new();
        let mut inflight: HashSet<Id> = HashSet::new();
        let mut round = 0_usize;

        // Waiting longer than this means timeouts themselves went missing;
        // bail out rather than hang.
        let grace = self.request_timeout * 2 + Duration::from_millis(500);

        loop {
            let launched = self.replenish(
                &shortlist,
                &queried,
                &failed,
                &mut inflight,
                table,
                supervisor,
                socket,
                &tx,
            );

            if launched > 0 {
                round += 1;
                debug!(
                    lookup_target = %self.target,
                    round,
                    launched,
                    inflight = inflight.len(),
                    candidates = shortlist.len(),
                    responders = queried.len(),
                    "lookup_round"
                );
            }

            if inflight.is_empty() {
                break;
            }

            let event = match rx.recv_timeout(grace) {
                Ok(event) => event,
                Err(_) => {
                    warn!(lookup_target = %self.target, "lookup gave up waiting for events");
                    break;
                }
            };

            match event {
                LookupEvent::Response { peer_id, peers } => {
                    inflight.remove(&peer_id);
                    queried.insert(peer_id);

                    for peer in peers {
                        if peer.id() != &self.local_id {
                            shortlist.add(peer);
                        }
                    }
                }
                LookupEvent::Failed { peer_id } => {
                    inflight.remove(&peer_id);
                    failed.insert(peer_id);
                }
            }

            if self.converged(&shortlist, &queried, &failed) {
                break;
            }
        }

        let responders: Vec<Peer> = shortlist
            .peers()
            .iter()
            .filter(|peer| queried.contains(peer.id()))
            .take(self.k)
            .cloned()
            .collect();

        debug!(
            lookup_target = %self.target,
            rounds = round,
            responders = responders.len(),
            failed = failed.len(),
            "lookup done"
        );

        responders
    }

    /// Issue FIND_NODE requests to the closest unqueried candidates until
    /// `alpha` are in flight. Only the k closest non-failed candidates are
    /// ever considered.
    #[allow(clippy::too_many_arguments)]
    fn replenish(
        &self,
        shortlist: &ClosestPeers,
        queried: &HashSet<Id>,
        failed: &HashSet<Id>,
        inflight: &mut HashSet<Id>,
        table: &Arc<Mutex<RoutingTable>>,
        supervisor: &Arc<Supervisor>,
        socket: &Arc<KadSocket>,
        tx: &flume::Sender<LookupEvent>,
    ) -> usize {
        let mut launched = 0;

        let candidates: Vec<Peer> = shortlist
            .peers()
            .iter()
            .filter(|peer| !failed.contains(peer.id()))
            .take(self.k)
            .filter(|peer| !queried.contains(peer.id()) && !inflight.contains(peer.id()))
            .cloned()
            .collect();

        for peer in candidates {
            if inflight.len() >= self.alpha {
                break;
            }

            let token = supervisor.next_token();
            let peer_id = *peer.id();

            let tx_response = tx.clone();
            let tx_timeout = tx.clone();
            let table_on_timeout = Arc::clone(table);

            let registered = supervisor.register(
                token,
                peer_id,
                self.request_timeout,
                Box::new(move |message| {
                    let peers = match message.kind {
                        MessageKind::Nodes { peers } => peers,
                        _ => Vec::new(),
                    };
                    let _ = tx_response.send(LookupEvent::Response { peer_id, peers });
                }),
                Box::new(move |peer_id| {
                    // Non-responders leave the routing table, even if the
                    // lookup itself has moved on.
                    routing_table::lock(&table_on_timeout).remove(&peer_id);
                    let _ = tx_timeout.send(LookupEvent::Failed { peer_id });
                }),
            );

            if let Err(error) = registered {
                warn!(?error, "failed to register lookup request");
                continue;
            }

            socket.send(
                *peer.address(),
                &Message {
                    sender_id: self.local_id,
                    token,
                    kind: MessageKind::FindNode {
                        target: self.target,
                    },
                },
            );

            inflight.insert(peer_id);
            launched += 1;
        }

        launched
    }

    /// Condition (a): the k closest observed, non-failed peers have all been
    /// successfully queried, and there is at least one responder.
    fn converged(
        &self,
        shortlist: &ClosestPeers,
        queried: &HashSet<Id>,
        failed: &HashSet<Id>,
    ) -> bool {
        let mut checked = 0;

        for peer in shortlist.peers() {
            if failed.contains(peer.id()) {
                continue;
            }
            if !queried.contains(peer.id()) {
                return false;
            }
            checked += 1;
            if checked >= self.k {
                break;
            }
        }

        checked > 0
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddrV4;
    use std::thread;

    use super::*;
    use crate::common::ID_SIZE;

    fn localhost(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    /// A bootstrap peer answers with closer-but-dead peers; the lookup
    /// queries them, times them out, removes them from the table, and
    /// converges on the only real responder.
    #[test]
    fn converges_and_excludes_non_responders() {
        let local_id = Id::random();
        let target = Id([0; ID_SIZE]);

        // The one real peer on the network.
        let stub_socket = KadSocket::bind(None).unwrap();
        let mut stub_id_bytes = [0_u8; ID_SIZE];
        stub_id_bytes[0] = 0b0100_0000;
        let stub_id = Id(stub_id_bytes);
        let stub_addr = localhost(stub_socket.local_addr().port());

        // Peers closer to the target than the stub, but unreachable.
        let dead_peers: Vec<Peer> = (1..=3)
            .map(|low| {
                let mut bytes = [0_u8; ID_SIZE];
                bytes[ID_SIZE - 1] = low;
                Peer::new(Id(bytes), localhost(1))
            })
            .collect();

        let dead_clone = dead_peers.clone();
        let stub = thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(10);
            let mut served = 0;
            while served < 1 && std::time::Instant::now() < deadline {
                if let Some((message, from)) = stub_socket.recv() {
                    if let MessageKind::FindNode { .. } = message.kind {
                        stub_socket.send(
                            from,
                            &Message {
                                sender_id: stub_id,
                                token: message.token,
                                kind: MessageKind::Nodes {
                                    peers: dead_clone.clone(),
                                },
                            },
                        );
                        served += 1;
                    }
                }
            }
        });

        let mut table = RoutingTable::new(local_id);
        table.observe(Peer::new(stub_id, stub_addr));
        for peer in &dead_peers {
            table.observe(peer.clone());
        }
        let table = Arc::new(Mutex::new(table));

        let supervisor = Arc::new(Supervisor::new(Duration::from_millis(50)));
        let socket = Arc::new(KadSocket::bind(None).unwrap());

        let lookup = Lookup {
            local_id,
            target,
            alpha: 2,
            k: 4,
            request_timeout: Duration::from_millis(300),
        };

        let seeds = routing_table::lock(&table).closest(&target, 4);
        let responders = lookup.run(&table, &supervisor, &socket, seeds);

        stub.join().unwrap();

        let responder_ids: Vec<Id> = responders.iter().map(|peer| *peer.id()).collect();
        assert_eq!(responder_ids, vec![stub_id]);

        // Failed peers were reported to the routing table.
        let table = routing_table::lock(&table);
        for peer in &dead_peers {
            assert!(!table.contains(peer.id()));
        }
        assert!(table.contains(&stub_id));
    }
}
