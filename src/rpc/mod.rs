//! DHT engine: inbound dispatch, bucket verification pings, and the
//! sequential bootstrap join.

mod closest;
mod lookup;
mod mailbox;
mod socket;

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use crate::common::{
    Id, Message, MessageKind, Node, RoutingTable, UpdateOutcome, MAX_BUCKET_SIZE_K,
};
use crate::scheduler::Scheduler;
use crate::{Error, Result};

pub use closest::ClosestNodes;
pub use lookup::GetPeer;
use mailbox::Mailbox;
use socket::DhtSocket;

/// Default request timeout before abandoning an inflight request to a
/// non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// How many lookup requests a round sends in parallel.
pub const LOOKUP_CONCURRENCY: usize = 3;

/// Hard bound on iterative lookup rounds. The original protocol relies only on
/// the shrinking candidate set to terminate; the explicit cap prevents
/// unbounded amplification on a pathological network.
pub const MAX_LOOKUP_ROUNDS: usize = 16;

#[derive(Debug)]
/// Engine configuration.
pub struct Config {
    /// Port to listen on; `0` asks the OS for any free port.
    pub port: u16,
    /// Timeout for every outgoing request, including bootstrap contacts,
    /// verification pings, and lookup rounds.
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 0,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum State {
    Created,
    Joining,
    Running,
    Stopped,
}

/// A decoded RESPONSE delivered to a waiting continuation.
pub(crate) struct ResponseEvent {
    pub from: SocketAddrV4,
    pub nodes: Vec<Node>,
}

/// Called exactly once when the bootstrap join settles.
pub type JoinCompletion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// The DHT engine: one per node, shared between the poll-loop thread and the
/// scheduler threads running correlation callbacks.
///
/// The routing table and the mailbox each have their own lock; no lock is held
/// across a call into the other, since callbacks may recurse into either.
pub(crate) struct Rpc {
    id: Id,
    socket: DhtSocket,
    routing_table: Mutex<RoutingTable>,
    mailbox: Arc<Mailbox<ResponseEvent>>,
    scheduler: Scheduler,
    state: Mutex<State>,
    running: AtomicBool,
    request_timeout: Duration,
}

impl Rpc {
    pub fn new(config: &Config) -> Result<Self> {
        let id = Id::random();
        let socket = DhtSocket::bind(config.port)?;

        Ok(Rpc {
            id,
            socket,
            routing_table: Mutex::new(RoutingTable::new(id)),
            mailbox: Arc::new(Mailbox::new()),
            scheduler: Scheduler::new(),
            state: Mutex::new(State::Created),
            running: AtomicBool::new(true),
            request_timeout: config.request_timeout,
        })
    }

    // === Getters ===

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    pub fn state(&self) -> State {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.state() == State::Running
    }

    pub(crate) fn running_flag(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// A copy of every node currently in the routing table.
    pub fn nodes(&self) -> Vec<Node> {
        let table = self.routing_table.lock().expect("routing table lock poisoned");
        let id = *table.id();

        // Everything is within MAX_DISTANCE of the local id.
        table.closest(&id, table.size().max(MAX_BUCKET_SIZE_K))
    }

    // === Public Methods ===

    /// Service the socket once: decode and dispatch at most one datagram.
    /// This is the body of the poll loop and the single entry point for
    /// inbound messages.
    pub fn tick(this: &Arc<Rpc>) {
        if let Some((message, from)) = this.socket.recv_from() {
            Rpc::handle_message(this, message, from);
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        *self.state.lock().expect("state lock poisoned") = State::Stopped;
        self.scheduler.shutdown();
    }

    /// Contact the bootstrap nodes one at a time with a lookup for our own id.
    ///
    /// A response or a timeout both advance to the next node. The first
    /// response transitions the engine to `Running` and reports success; a
    /// pass over the whole list without any response reports a timeout. Either
    /// way the engine keeps serving afterwards.
    pub fn join(this: &Arc<Rpc>, bootstrap: Vec<Node>, completion: JoinCompletion) {
        *this.state.lock().expect("state lock poisoned") = State::Joining;

        let engine = this.clone();
        let bootstrap: Arc<[Node]> = bootstrap.into();
        let completion = Arc::new(Mutex::new(Some(completion)));

        this.scheduler.schedule(move || {
            join_step(engine, bootstrap, 0, None, completion);
        });
    }

    /// Start an iterative lookup for `target`.
    pub fn get_peer(this: &Arc<Rpc>, target: Id) -> GetPeer {
        lookup::start(this, target)
    }

    // === Private Methods ===

    fn handle_message(this: &Arc<Rpc>, message: Message, from: SocketAddrV4) {
        // Every inbound message is evidence the sender is alive.
        Rpc::record_seen(this, Node::new(message.sender_id, from));

        match message.kind {
            MessageKind::Ping => {
                let _ = this
                    .send_response(from, message.message_id, Vec::new())
                    .map_err(|e| debug!(?e, "Error sending pong"));
            }
            MessageKind::Lookup(target) => {
                let closest = this
                    .routing_table
                    .lock()
                    .expect("routing table lock poisoned")
                    .closest(&target, MAX_BUCKET_SIZE_K);

                let _ = this
                    .send_response(from, message.message_id, closest)
                    .map_err(|e| debug!(?e, "Error sending lookup response"));
            }
            MessageKind::Response(nodes) => {
                this.mailbox
                    .resolve(&message.message_id, ResponseEvent { from, nodes });
            }
        }
    }

    /// Record a live peer, starting a verification ping when its bucket is
    /// full.
    pub(crate) fn record_seen(this: &Arc<Rpc>, node: Node) {
        let outcome = this
            .routing_table
            .lock()
            .expect("routing table lock poisoned")
            .update(node.clone());

        if let UpdateOutcome::Verifying { incumbent } = outcome {
            Rpc::verify(this, incumbent, node);
        }
    }

    /// Ping a bucket incumbent challenged by `candidate`. The candidate takes
    /// the slot when the ping round completes, pong or no pong.
    fn verify(this: &Arc<Rpc>, incumbent: Node, candidate: Node) {
        let message_id = Id::random();

        trace!(
            context = "verification",
            incumbent = ?incumbent.id,
            candidate = ?candidate.id,
            "Pinging incumbent"
        );

        let on_response = {
            let engine = this.clone();
            let incumbent_id = incumbent.id;
            let candidate_id = candidate.id;
            move |_: ResponseEvent| {
                engine.finish_verification(incumbent_id, candidate_id);
            }
        };

        let on_timeout = {
            let engine = this.clone();
            let incumbent_id = incumbent.id;
            let candidate_id = candidate.id;
            move || {
                engine.finish_verification(incumbent_id, candidate_id);
            }
        };

        // Register before sending; the poll thread may dispatch the pong
        // before a registration done afterwards would be visible.
        Mailbox::register(
            &this.mailbox,
            &this.scheduler,
            message_id,
            on_response,
            on_timeout,
            this.request_timeout,
        );

        let _ = this
            .send_request(incumbent.address, message_id, MessageKind::Ping)
            .map_err(|e| debug!(?e, "Error sending verification ping"));
    }

    fn finish_verification(&self, incumbent_id: Id, candidate_id: Id) {
        if !self.running_flag() {
            return;
        }

        self.routing_table
            .lock()
            .expect("routing table lock poisoned")
            .replace(&incumbent_id, &candidate_id);
    }

    pub(crate) fn remove_node(&self, id: &Id) {
        self.routing_table
            .lock()
            .expect("routing table lock poisoned")
            .remove(id);
    }

    pub(crate) fn closest(&self, target: &Id, max_n: usize) -> Vec<Node> {
        self.routing_table
            .lock()
            .expect("routing table lock poisoned")
            .closest(target, max_n)
    }

    pub(crate) fn send_request(
        &self,
        to: SocketAddrV4,
        message_id: Id,
        kind: MessageKind,
    ) -> Result<()> {
        self.socket.send(
            to,
            &Message {
                message_id,
                sender_id: self.id,
                kind,
            },
        )
    }

    fn send_response(&self, to: SocketAddrV4, message_id: Id, nodes: Vec<Node>) -> Result<()> {
        self.socket.send(
            to,
            &Message {
                message_id,
                sender_id: self.id,
                kind: MessageKind::Response(nodes),
            },
        )
    }

    pub(crate) fn register_correlation<R, O>(
        this: &Arc<Rpc>,
        message_id: Id,
        on_response: R,
        on_timeout: O,
    ) where
        R: FnOnce(ResponseEvent) + Send + 'static,
        O: FnOnce() + Send + 'static,
    {
        Mailbox::register(
            &this.mailbox,
            &this.scheduler,
            message_id,
            on_response,
            on_timeout,
            this.request_timeout,
        );
    }

    /// Drop a registered correlation without firing either callback.
    pub(crate) fn cancel_correlation(&self, message_id: &Id) {
        self.mailbox.cancel(message_id);
    }
}

/// One link of the sequential bootstrap chain.
fn join_step(
    engine: Arc<Rpc>,
    bootstrap: Arc<[Node]>,
    index: usize,
    previous: Option<Id>,
    completion: Arc<Mutex<Option<JoinCompletion>>>,
) {
    if !engine.running_flag() {
        if let Some(completion) = completion.lock().expect("completion lock poisoned").take() {
            completion(Err(Error::NotRunning));
        }
        return;
    }

    if index >= bootstrap.len() {
        // List exhausted: the engine serves either way, but the join only
        // succeeded if some contact responded earlier.
        *engine.state.lock().expect("state lock poisoned") = State::Running;

        if let Some(completion) = completion.lock().expect("completion lock poisoned").take() {
            debug!(context = "join", "Exhausted bootstrap list without a response");
            completion(Err(Error::Timeout));
        }
        return;
    }

    let node = bootstrap[index].clone();
    let message_id = Id::random();
    let target = engine.id();

    trace!(context = "join", index, address = ?node.address, "Contacting bootstrap node");

    let on_response = {
        let engine = engine.clone();
        let bootstrap = bootstrap.clone();
        let completion = completion.clone();
        let contacted = node.clone();

        move |event: ResponseEvent| {
            if !engine.running_flag() {
                return;
            }

            for found in event.nodes {
                Rpc::record_seen(&engine, found);
            }

            // Drop the previously contacted bootstrap node so one bootstrap
            // peer does not monopolize a bucket slot.
            if let Some(previous) = previous {
                engine.remove_node(&previous);
            }

            {
                let mut state = engine.state.lock().expect("state lock poisoned");
                if *state == State::Joining {
                    *state = State::Running;
                }
            }

            if let Some(completion) =
                completion.lock().expect("completion lock poisoned").take()
            {
                completion(Ok(()));
            }

            join_step(
                engine.clone(),
                bootstrap,
                index + 1,
                Some(contacted.id),
                completion,
            );
        }
    };

    let on_timeout = {
        let engine = engine.clone();
        let bootstrap = bootstrap.clone();
        let completion = completion.clone();
        let contacted_id = node.id;

        move || {
            join_step(engine, bootstrap, index + 1, Some(contacted_id), completion);
        }
    };

    // Register before sending; a loopback bootstrap node can respond before
    // a registration done afterwards would be visible. A failed send is
    // settled by the timeout like any unanswered contact.
    Rpc::register_correlation(&engine, message_id, on_response, on_timeout);

    let _ = engine
        .send_request(node.address, message_id, MessageKind::Lookup(target))
        .map_err(|e| debug!(?e, "Error contacting bootstrap node"));
}
