//! Peer entry in the Kademlia routing table
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddrV4,
    time::Instant,
};

use crate::common::Id;

#[derive(Clone, PartialEq)]
/// A known remote node: its self-declared [Id], transport address, and the
/// last time it gave evidence of liveness.
///
/// A peer is uniquely identified by its `id`; the address may change and is
/// updated in place on re-observation.
pub struct Peer {
    pub(crate) id: Id,
    pub(crate) address: SocketAddrV4,
    pub(crate) last_seen: Instant,
}

impl Debug for Peer {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Peer")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("last_seen", &self.last_seen.elapsed().as_secs())
            .finish()
    }
}

impl Peer {
    /// Creates a new Peer from an id and socket address, seen now.
    pub fn new(id: Id, address: SocketAddrV4) -> Peer {
        Peer {
            id,
            address,
            last_seen: Instant::now(),
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> &SocketAddrV4 {
        &self.address
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Creates a peer with a random Id for testing purposes.
    pub fn random() -> Peer {
        Peer::new(Id::random(), SocketAddrV4::new(0.into(), 0))
    }

    pub fn with_address(mut self, address: SocketAddrV4) -> Self {
        self.address = address;
        self
    }

    // === Public Methods ===

    /// Record fresh evidence of liveness, possibly from a new address.
    pub(crate) fn touch(&mut self, address: SocketAddrV4) {
        self.address = address;
        self.last_seen = Instant::now();
    }

    /// Refresh `last_seen` keeping the current address.
    pub(crate) fn promote(&mut self) {
        self.last_seen = Instant::now();
    }
}
