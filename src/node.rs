//! Dht node façade.
//!
//! Owns the local id, the UDP socket, the routing table, and the message
//! supervisor, and runs the background activities that keep the node's view
//! of the network alive: the listener, the maintenance (CRON) loop, and the
//! insertion-queue worker. Shutdown is join-based: every background thread
//! is awaited before the socket is released.

use std::net::SocketAddrV4;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use lru::LruCache;
use tracing::{debug, info, warn};

use crate::common::{Id, Peer};
use crate::config::Config;
use crate::lookup::Lookup;
use crate::messages::{Message, MessageKind};
use crate::routing_table::{lock as lock_table, Observation, ProbeDecision, RoutingTable};
use crate::socket::KadSocket;
use crate::supervisor::Supervisor;
use crate::Result;

/// How many recent lookup results are kept to seed subsequent lookups.
const MAX_CACHED_LOOKUPS: usize = 64;

enum WorkerMessage {
    /// A bucket has queued insertion candidates to resolve.
    BucketPending(u8),
    Shutdown,
}

/// Everything the background threads need, cheaply cloneable.
#[derive(Clone)]
struct Shared {
    id: Id,
    config: Config,
    socket: Arc<KadSocket>,
    table: Arc<Mutex<RoutingTable>>,
    supervisor: Arc<Supervisor>,
    worker_tx: flume::Sender<WorkerMessage>,
    running: Arc<AtomicBool>,
}

pub struct Node {
    shared: Shared,
    recent_lookups: Arc<Mutex<LruCache<Id, Vec<Peer>>>>,
    shutdown_tx: flume::Sender<()>,
    threads: Vec<JoinHandle<()>>,
}

impl Node {
    /// Validate the configuration, bind the socket, and start the listener,
    /// CRON, and insertion-worker threads.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let id = config.local_id.unwrap_or_else(Id::random);
        let socket = Arc::new(KadSocket::bind(config.port)?);
        let table = Arc::new(Mutex::new(RoutingTable::new(id).with_k(config.k)));
        let supervisor = Arc::new(Supervisor::new(config.sweep_interval));

        let (worker_tx, worker_rx) = flume::unbounded();
        let (shutdown_tx, shutdown_rx) = flume::unbounded();

        let shared = Shared {
            id,
            config,
            socket,
            table,
            supervisor,
            worker_tx,
            running: Arc::new(AtomicBool::new(true)),
        };

        let recent_lookups = Arc::new(Mutex::new(LruCache::new(
            NonZeroUsize::new(MAX_CACHED_LOOKUPS).expect("cache size is non-zero"),
        )));

        let mut threads = Vec::with_capacity(3);

        let listener_shared = shared.clone();
        threads.push(
            thread::Builder::new()
                .name("xorline-listener".into())
                .spawn(move || listener_loop(listener_shared))?,
        );

        let cron_shared = shared.clone();
        let cron_cache = Arc::clone(&recent_lookups);
        threads.push(
            thread::Builder::new()
                .name("xorline-cron".into())
                .spawn(move || cron_loop(cron_shared, shutdown_rx, cron_cache))?,
        );

        let worker_shared = shared.clone();
        threads.push(
            thread::Builder::new()
                .name("xorline-insertion".into())
                .spawn(move || insertion_worker(worker_shared, worker_rx))?,
        );

        info!(id = %shared.id, address = %shared.socket.local_addr(), "node started");

        Ok(Node {
            shared,
            recent_lookups,
            shutdown_tx,
            threads,
        })
    }

    // === Getters ===

    /// The node's [Id].
    pub fn id(&self) -> Id {
        self.shared.id
    }

    /// The address the node is listening to.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.shared.socket.local_addr()
    }

    /// Number of peers currently in the routing table.
    pub fn routing_table_size(&self) -> usize {
        lock_table(&self.shared.table).size()
    }

    /// Snapshot of every known peer.
    pub fn peers(&self) -> Vec<Peer> {
        lock_table(&self.shared.table).peers()
    }

    // === Public Methods ===

    /// Iterative FIND_NODE: returns up to k responders closest to `target`,
    /// distance-sorted. Returns an empty list after shutdown.
    pub fn lookup(&self, target: Id) -> Vec<Peer> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Vec::new();
        }

        run_lookup(&self.shared, &self.recent_lookups, target)
    }

    /// Stop every background activity, cancel outstanding requests, and join
    /// all threads before releasing the socket.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    // === Private Methods ===

    fn shutdown_inner(&mut self) {
        if self.threads.is_empty() {
            return;
        }

        info!(id = %self.shared.id, "shutting down");

        self.shared.running.store(false, Ordering::Release);
        let _ = self.shared.worker_tx.send(WorkerMessage::Shutdown);
        let _ = self.shutdown_tx.send(());

        self.shared.supervisor.shutdown();

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

// === Listener ===

fn listener_loop(shared: Shared) {
    while shared.running.load(Ordering::Acquire) {
        if let Some((message, from)) = shared.socket.recv() {
            handle_message(&shared, message, from);
        }
    }
}

/// Protocol handler: map one inbound frame to its side effects. The only
/// state mutated is the routing table and the supervisor.
fn handle_message(shared: &Shared, message: Message, from: SocketAddrV4) {
    observe_sender(shared, Peer::new(message.sender_id, from));

    match message.kind {
        MessageKind::Ping => {
            shared.socket.send(
                from,
                &Message {
                    sender_id: shared.id,
                    token: message.token,
                    kind: MessageKind::Pong,
                },
            );
        }
        MessageKind::FindNode { target } => {
            let peers = lock_table(&shared.table).closest(&target, shared.config.k);
            shared.socket.send(
                from,
                &Message {
                    sender_id: shared.id,
                    token: message.token,
                    kind: MessageKind::Nodes { peers },
                },
            );
        }
        MessageKind::Pong | MessageKind::Nodes { .. } => {
            shared.supervisor.deliver(message.token, message);
        }
    }
}

/// Any inbound frame is evidence of liveness for its sender.
fn observe_sender(shared: &Shared, peer: Peer) {
    let index = shared.id.bucket_index(peer.id());
    let observation = lock_table(&shared.table).observe(peer);

    if observation == Observation::Enqueued {
        let _ = shared.worker_tx.send(WorkerMessage::BucketPending(index));
    }
}

// === Insertion worker ===

/// Drains the insertion queue: admits candidates directly when their bucket
/// has room, otherwise probes the bucket head and lets
/// [RoutingTable::on_probe_result] reconcile the outcome.
fn insertion_worker(shared: Shared, rx: flume::Receiver<WorkerMessage>) {
    loop {
        match rx.recv() {
            Ok(WorkerMessage::BucketPending(index)) => run_probe(&shared, index),
            Ok(WorkerMessage::Shutdown) | Err(_) => break,
        }
    }

    // Shutdown: admit what fits, drop the rest, no new probes.
    lock_table(&shared.table).drain_insertion_queue();
}

fn run_probe(shared: &Shared, index: u8) {
    let decision = lock_table(&shared.table).prepare_probe(index);

    let head = match decision {
        ProbeDecision::Probe(head) => head,
        ProbeDecision::Admitted(_) | ProbeDecision::Idle => return,
    };

    let token = shared.supervisor.next_token();
    let head_id = *head.id();

    let table_response = Arc::clone(&shared.table);
    let worker_response = shared.worker_tx.clone();
    let table_timeout = Arc::clone(&shared.table);
    let worker_timeout = shared.worker_tx.clone();

    let registered = shared.supervisor.register(
        token,
        head_id,
        shared.config.request_timeout,
        Box::new(move |_pong| {
            let more = lock_table(&table_response).on_probe_result(index, &head_id, true);
            if more {
                let _ = worker_response.send(WorkerMessage::BucketPending(index));
            }
        }),
        Box::new(move |peer_id| {
            let more = lock_table(&table_timeout).on_probe_result(index, &peer_id, false);
            if more {
                let _ = worker_timeout.send(WorkerMessage::BucketPending(index));
            }
        }),
    );

    if let Err(error) = registered {
        warn!(?error, bucket = index, "could not register probe");
        if lock_table(&shared.table).abort_probe(index) {
            let _ = shared.worker_tx.send(WorkerMessage::BucketPending(index));
        }
        return;
    }

    debug!(head = %head_id, bucket = index, token, "probe_sent");
    shared.socket.send(
        *head.address(),
        &Message {
            sender_id: shared.id,
            token,
            kind: MessageKind::Ping,
        },
    );
}

// === CRON ===

fn cron_loop(
    shared: Shared,
    shutdown_rx: flume::Receiver<()>,
    recent_lookups: Arc<Mutex<LruCache<Id, Vec<Peer>>>>,
) {
    let mut last_self_lookup: Option<Instant> = None;

    loop {
        cron_pass(&shared, &shutdown_rx, &recent_lookups, &mut last_self_lookup);

        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        match shutdown_rx.recv_timeout(shared.config.cron_interval) {
            Err(flume::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn cron_pass(
    shared: &Shared,
    shutdown_rx: &flume::Receiver<()>,
    recent_lookups: &Arc<Mutex<LruCache<Id, Vec<Peer>>>>,
    last_self_lookup: &mut Option<Instant>,
) {
    if !shared.running.load(Ordering::Acquire) {
        return;
    }

    // While the table is empty, ping the bootstrap peers and give their
    // pongs a moment to populate it before the self-lookup.
    if lock_table(&shared.table).is_empty() && !shared.config.bootstrap.is_empty() {
        debug!(count = shared.config.bootstrap.len(), "pinging bootstrap peers");

        for address in &shared.config.bootstrap {
            shared.socket.send(
                *address,
                &Message {
                    sender_id: shared.id,
                    token: shared.supervisor.next_token(),
                    kind: MessageKind::Ping,
                },
            );
        }

        match shutdown_rx.recv_timeout(shared.config.request_timeout) {
            Err(flume::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => return,
        }
    }

    // Self-lookup populates the close neighborhood on startup and after
    // long idleness.
    let self_lookup_due = last_self_lookup
        .map(|at| at.elapsed() >= shared.config.stale_after)
        .unwrap_or(true);

    if self_lookup_due && !lock_table(&shared.table).is_empty() {
        *last_self_lookup = Some(Instant::now());
        debug!(id = %shared.id, "self lookup");
        run_lookup(shared, recent_lookups, shared.id);
    }

    // Refresh buckets that saw no traffic within the staleness horizon.
    for index in lock_table(&shared.table).stale_buckets(shared.config.stale_after) {
        if !shared.running.load(Ordering::Acquire) {
            return;
        }

        let target = shared.id.random_in_bucket(index);
        debug!(bucket = index, refresh_target = %target, "refreshing stale bucket");
        run_lookup(shared, recent_lookups, target);
        lock_table(&shared.table).mark_refreshed(index);
    }

    if let Some(republish) = &shared.config.republish {
        republish();
    }
}

fn run_lookup(
    shared: &Shared,
    recent_lookups: &Arc<Mutex<LruCache<Id, Vec<Peer>>>>,
    target: Id,
) -> Vec<Peer> {
    let mut seeds = lock_table(&shared.table).closest(&target, shared.config.k);

    if let Some(cached) = lock_cache(recent_lookups).get(&target) {
        seeds.extend(cached.iter().cloned());
    }

    let lookup = Lookup {
        local_id: shared.id,
        target,
        alpha: shared.config.alpha,
        k: shared.config.k,
        request_timeout: shared.config.request_timeout,
    };

    let responders = lookup.run(&shared.table, &shared.supervisor, &shared.socket, seeds);

    if !responders.is_empty() {
        lock_cache(recent_lookups).put(target, responders.clone());
    }

    responders
}

fn lock_cache(
    cache: &Mutex<LruCache<Id, Vec<Peer>>>,
) -> MutexGuard<'_, LruCache<Id, Vec<Peer>>> {
    match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    /// Maintenance is kept out of the way: these tests drive the listener
    /// directly.
    fn test_config() -> Config {
        Config {
            port: Some(0),
            cron_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(50),
            request_timeout: Duration::from_millis(400),
            ..Default::default()
        }
    }

    fn localhost(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    /// Wait for the frame answering `token`, skipping unrelated traffic such
    /// as the node's own maintenance lookups.
    fn recv_reply(socket: &KadSocket, token: u64) -> Message {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some((message, _)) = socket.recv() {
                if message.token == token && message.kind.is_response() {
                    return message;
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for a reply");
        }
    }

    #[test]
    fn starts_and_shuts_down() {
        let node = Node::new(test_config()).unwrap();
        assert_eq!(node.routing_table_size(), 0);
        node.shutdown();
    }

    #[test]
    fn rejects_invalid_config() {
        let config = Config {
            k: 0,
            ..test_config()
        };

        assert!(Node::new(config).is_err());
    }

    #[test]
    fn answers_ping_with_pong_and_observes_sender() {
        let node = Node::new(test_config()).unwrap();
        let node_addr = localhost(node.local_addr().port());

        let probe = KadSocket::bind(Some(0)).unwrap();
        let probe_id = Id::random();

        probe.send(
            node_addr,
            &Message {
                sender_id: probe_id,
                token: 99,
                kind: MessageKind::Ping,
            },
        );

        let reply = recv_reply(&probe, 99);
        assert_eq!(reply.sender_id, node.id());
        assert_eq!(reply.kind, MessageKind::Pong);

        // Any inbound frame is evidence of liveness.
        assert_eq!(node.routing_table_size(), 1);
        assert_eq!(node.peers()[0].id(), &probe_id);

        node.shutdown();
    }

    #[test]
    fn answers_find_node_with_closest_peers() {
        let node = Node::new(test_config()).unwrap();
        let node_addr = localhost(node.local_addr().port());

        // Teach the node one peer, then ask for it.
        let seeded = KadSocket::bind(Some(0)).unwrap();
        let seeded_id = Id::random();
        seeded.send(
            node_addr,
            &Message {
                sender_id: seeded_id,
                token: 1,
                kind: MessageKind::Ping,
            },
        );
        let _ = recv_reply(&seeded, 1);

        let asker = KadSocket::bind(Some(0)).unwrap();
        asker.send(
            node_addr,
            &Message {
                sender_id: Id::random(),
                token: 2,
                kind: MessageKind::FindNode { target: seeded_id },
            },
        );

        let reply = recv_reply(&asker, 2);
        match reply.kind {
            MessageKind::Nodes { peers } => {
                assert!(peers.iter().any(|peer| peer.id() == &seeded_id));
            }
            other => panic!("expected NODES, got {other:?}"),
        }

        node.shutdown();
    }
}
