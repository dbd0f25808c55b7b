//! Kademlia-style DHT node: an XOR-metric routing table with liveness-checked
//! bucket eviction, a correlation mailbox for asynchronous request/response
//! matching over UDP, and iterative peer lookup, behind a compact binary wire
//! protocol.

mod common;
mod dht;
mod error;
pub mod rpc;
pub mod scheduler;

pub use crate::common::{Id, Message, MessageKind, Node, ID_SIZE, MAX_BUCKET_SIZE_K};
pub use crate::error::{Error, Result};
pub use dht::Dht;
pub use rpc::{Config, GetPeer, State, DEFAULT_REQUEST_TIMEOUT};
