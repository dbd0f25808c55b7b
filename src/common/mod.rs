//! Types common to the routing table, the wire codec, and the engine.

mod id;
mod messages;
mod node;
mod routing_table;

pub use id::{Id, ID_SIZE, MAX_DISTANCE};
pub use messages::{Message, MessageKind};
pub use node::Node;
pub use routing_table::{RoutingTable, UpdateOutcome, MAX_BUCKET_SIZE_K};
