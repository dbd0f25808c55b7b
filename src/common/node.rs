//! Struct and implementation of the Node entry in the Kademlia routing table
use std::net::SocketAddrV4;

use crate::common::Id;

#[derive(Debug, Clone, PartialEq)]
/// Node entry in Kademlia routing table
pub struct Node {
    pub id: Id,
    pub address: SocketAddrV4,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node { id, address }
    }

    #[cfg(test)]
    pub fn random() -> Node {
        Node {
            id: Id::random(),
            address: SocketAddrV4::new(0.into(), 0),
        }
    }

    /// Creates a node with a distinct Id and address for a test index.
    #[cfg(test)]
    pub fn unique(i: usize) -> Node {
        Node {
            id: Id::random(),
            address: SocketAddrV4::new((i as u32).into(), i as u16),
        }
    }
}
