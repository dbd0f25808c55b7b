//! Iterative peer lookup: rounds of parallel LOOKUP requests walking closer
//! to the target until it is found or progress stalls.

use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use super::{ClosestNodes, ResponseEvent, Rpc, LOOKUP_CONCURRENCY, MAX_LOOKUP_ROUNDS};
use crate::common::{Id, MessageKind, Node, MAX_BUCKET_SIZE_K};
use crate::{Error, Result};

/// Asynchronous result handle returned by `get_peer`.
///
/// Resolves to the target node, a timeout, or an I/O error when no round
/// could reach any recipient.
pub struct GetPeer {
    receiver: flume::Receiver<Result<Node>>,
}

impl GetPeer {
    /// Block until the lookup settles.
    pub fn recv(&self) -> Result<Node> {
        self.receiver
            .recv()
            .unwrap_or(Err(Error::NotRunning))
    }

    /// Block until the lookup settles or `timeout` passes.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Result<Node> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(flume::RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(flume::RecvTimeoutError::Disconnected) => Err(Error::NotRunning),
        }
    }
}

struct Lookup {
    target: Id,
    /// Union of everything seen so far, closest first.
    known: ClosestNodes,
    /// Addresses already sent a LOOKUP; never queried twice.
    queried: HashSet<SocketAddrV4>,
    rounds: usize,
    result: flume::Sender<Result<Node>>,
}

impl Lookup {
    fn settle(&self, result: Result<Node>) {
        let _ = self.result.send(result);
    }
}

pub(crate) fn start(engine: &Arc<Rpc>, target: Id) -> GetPeer {
    let (result, receiver) = flume::bounded(1);

    if !engine.running_flag() {
        let _ = result.send(Err(Error::NotRunning));
        return GetPeer { receiver };
    }

    let mut known = ClosestNodes::new(target, MAX_BUCKET_SIZE_K);
    for node in engine.closest(&target, LOOKUP_CONCURRENCY) {
        known.add(node);
    }

    let lookup = Arc::new(Mutex::new(Lookup {
        target,
        known,
        queried: HashSet::new(),
        rounds: 0,
        result,
    }));

    next_round(engine.clone(), lookup);

    GetPeer { receiver }
}

/// Send one round of LOOKUP requests to the closest unqueried candidates,
/// all sharing a single message id so any one response advances the lookup.
fn next_round(engine: Arc<Rpc>, lookup: Arc<Mutex<Lookup>>) {
    let message_id = Id::random();
    let target;

    let to_visit = {
        let mut state = lookup.lock().expect("lookup lock poisoned");
        target = state.target;

        state.rounds += 1;
        if state.rounds > MAX_LOOKUP_ROUNDS {
            debug!(context = "lookup", ?target, "Round cap reached");
            state.settle(Err(Error::Timeout));
            return;
        }

        let to_visit = state
            .known
            .nodes()
            .iter()
            .filter(|node| !state.queried.contains(&node.address))
            .take(LOOKUP_CONCURRENCY)
            .cloned()
            .collect::<Vec<_>>();

        if to_visit.is_empty() {
            debug!(context = "lookup", ?target, "No unqueried candidates left");
            state.settle(Err(Error::Timeout));
            return;
        }

        for node in &to_visit {
            state.queried.insert(node.address);
        }

        to_visit
    };

    trace!(
        context = "lookup",
        ?target,
        round = lookup.lock().expect("lookup lock poisoned").rounds,
        recipients = to_visit.len(),
        "Lookup round"
    );

    let on_response = {
        let engine = engine.clone();
        let lookup = lookup.clone();

        move |event: ResponseEvent| {
            on_round_response(engine, lookup, event);
        }
    };

    let on_timeout = {
        let lookup = lookup.clone();

        move || {
            lookup
                .lock()
                .expect("lookup lock poisoned")
                .settle(Err(Error::Timeout));
        }
    };

    // Register before sending; a loopback peer can respond before a
    // registration done afterwards would be visible.
    Rpc::register_correlation(&engine, message_id, on_response, on_timeout);

    let mut sent = 0;
    for node in &to_visit {
        match engine.send_request(node.address, message_id, MessageKind::Lookup(target)) {
            Ok(()) => sent += 1,
            Err(e) => debug!(?e, address = ?node.address, "Error sending lookup request"),
        }
    }

    if sent == 0 {
        // Nothing is in flight; drop the round's correlation so its timeout
        // can not settle the lookup a second time.
        engine.cancel_correlation(&message_id);

        lookup
            .lock()
            .expect("lookup lock poisoned")
            .settle(Err(Error::NoRecipients));
    }
}

fn on_round_response(engine: Arc<Rpc>, lookup: Arc<Mutex<Lookup>>, event: ResponseEvent) {
    if !engine.running_flag() {
        return;
    }

    let target = lookup.lock().expect("lookup lock poisoned").target;

    if let Some(found) = event.nodes.iter().find(|node| node.id == target) {
        trace!(context = "lookup", ?target, from = ?event.from, "Found target");
        lookup
            .lock()
            .expect("lookup lock poisoned")
            .settle(Ok(found.clone()));
        return;
    }

    {
        let mut state = lookup.lock().expect("lookup lock poisoned");
        for node in event.nodes {
            state.known.add(node);
        }
    }

    next_round(engine, lookup);
}
