//! In-flight request supervision.
//!
//! Every request the node emits is registered here under its correlation
//! token. A matching response fires `on_response`; a background cleaner
//! sweeps expired entries and fires `on_timeout`. Exactly one of the two
//! callbacks runs per entry, and callbacks always run with the supervisor
//! lock released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::common::Id;
use crate::messages::Message;
use crate::{Error, Result};

pub type ResponseCallback = Box<dyn FnOnce(Message) + Send>;
pub type TimeoutCallback = Box<dyn FnOnce(Id) + Send>;

/// A request awaiting its response or its deadline, whichever comes first.
pub struct OutstandingRequest {
    pub peer_id: Id,
    pub sent_at: Instant,
    pub deadline: Instant,
    on_response: ResponseCallback,
    on_timeout: TimeoutCallback,
}

pub struct Supervisor {
    state: Arc<Mutex<HashMap<u64, OutstandingRequest>>>,
    next_token: AtomicU64,
    shutdown_tx: flume::Sender<()>,
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Create a supervisor and start its cleaner thread, sweeping expired
    /// entries every `sweep_interval`.
    pub fn new(sweep_interval: Duration) -> Self {
        let state: Arc<Mutex<HashMap<u64, OutstandingRequest>>> = Arc::default();
        let (shutdown_tx, shutdown_rx) = flume::bounded::<()>(1);

        let cleaner_state = Arc::clone(&state);
        let cleaner = thread::Builder::new()
            .name("supervisor-cleaner".into())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(sweep_interval) {
                    Err(flume::RecvTimeoutError::Timeout) => sweep(&cleaner_state),
                    Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
                }
            })
            .ok();

        Supervisor {
            state,
            next_token: AtomicU64::new(rand::thread_rng().gen()),
            shutdown_tx,
            cleaner: Mutex::new(cleaner),
        }
    }

    // === Public Methods ===

    /// Fresh correlation token from the process-local generator.
    ///
    /// Monotonically increasing from a random seed; collisions within the
    /// supervisor's retention window are vanishingly unlikely.
    pub fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Place a request under supervision.
    ///
    /// Exactly one of `on_response` and `on_timeout` will eventually be
    /// invoked, assuming the cleaner runs.
    pub fn register(
        &self,
        token: u64,
        peer_id: Id,
        timeout: Duration,
        on_response: ResponseCallback,
        on_timeout: TimeoutCallback,
    ) -> Result<()> {
        let mut state = lock(&self.state);

        if state.contains_key(&token) {
            return Err(Error::DuplicateToken(token));
        }

        let now = Instant::now();
        state.insert(
            token,
            OutstandingRequest {
                peer_id,
                sent_at: now,
                deadline: now + timeout,
                on_response,
                on_timeout,
            },
        );
        trace!(token, peer_id = %peer_id, ?timeout, "request_sent: registered");

        Ok(())
    }

    /// Dispatch a correlated response. Returns true if a request claimed it.
    ///
    /// Unknown tokens (never registered, timed out, or cancelled) and
    /// responses claiming someone else's token are logged and dropped.
    pub fn deliver(&self, token: u64, message: Message) -> bool {
        let entry = {
            let mut state = lock(&self.state);
            let expected = state.get(&token).map(|request| request.peer_id);

            match expected {
                Some(peer_id) if peer_id == message.sender_id => state.remove(&token),
                Some(peer_id) => {
                    debug!(
                        token,
                        expected = %peer_id,
                        got = %message.sender_id,
                        "response from wrong peer dropped"
                    );
                    return false;
                }
                None => None,
            }
        };

        match entry {
            Some(request) => {
                let elapsed = request.sent_at.elapsed();
                debug!(token, peer_id = %request.peer_id, ?elapsed, "response");
                (request.on_response)(message);
                true
            }
            None => {
                debug!(token, kind = message.kind.name(), "unsolicited response dropped");
                false
            }
        }
    }

    /// Remove an entry without invoking either callback.
    pub fn cancel(&self, token: u64) {
        if lock(&self.state).remove(&token).is_some() {
            trace!(token, "request cancelled");
        }
    }

    /// Remove every entry without invoking callbacks. Shutdown path.
    pub fn cancel_all(&self) {
        let count = {
            let mut state = lock(&self.state);
            let count = state.len();
            state.clear();
            count
        };

        if count > 0 {
            debug!(count, "cancelled all outstanding requests");
        }
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.state).len()
    }

    /// Cancel everything and stop the cleaner. Blocks until it exits.
    pub fn shutdown(&self) {
        self.cancel_all();
        let _ = self.shutdown_tx.try_send(());

        if let Some(handle) = lock_cleaner(&self.cleaner).take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One sweep: expired entries leave the map under the lock, their timeout
/// callbacks run after it is released.
fn sweep(state: &Mutex<HashMap<u64, OutstandingRequest>>) {
    let now = Instant::now();

    let expired: Vec<(u64, OutstandingRequest)> = {
        let mut state = lock(state);
        let tokens: Vec<u64> = state
            .iter()
            .filter(|(_, request)| now >= request.deadline)
            .map(|(token, _)| *token)
            .collect();

        tokens
            .into_iter()
            .filter_map(|token| state.remove(&token).map(|request| (token, request)))
            .collect()
    };

    for (token, request) in expired {
        warn!(token, peer_id = %request.peer_id, "timeout");
        (request.on_timeout)(request.peer_id);
    }
}

fn lock<'a>(
    state: &'a Mutex<HashMap<u64, OutstandingRequest>>,
) -> MutexGuard<'a, HashMap<u64, OutstandingRequest>> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_cleaner<'a>(
    cleaner: &'a Mutex<Option<JoinHandle<()>>>,
) -> MutexGuard<'a, Option<JoinHandle<()>>> {
    match cleaner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
