use std::vec::IntoIter;

use crate::common::{Id, Node};

/// An insertion-sorted accumulator of the closest nodes to a target,
/// keyed by the XOR of each node's Id with the target.
#[derive(Debug, Clone)]
pub struct ClosestNodes {
    target: Id,
    max: usize,
    nodes: Vec<Node>,
}

impl ClosestNodes {
    pub fn new(target: Id, max: usize) -> Self {
        Self {
            target,
            max,
            nodes: Vec::with_capacity(max + 1),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // === Public Methods ===

    /// Insert a node in distance order, dropping the farthest node when
    /// the accumulator is over capacity. Duplicate ids are ignored.
    pub fn add(&mut self, node: Node) {
        let seek = node.id.xor(&self.target);

        let found = self.nodes.binary_search_by(|probe| {
            if probe.id == node.id {
                std::cmp::Ordering::Equal
            } else {
                probe.id.xor(&self.target).cmp(&seek)
            }
        });

        if let Err(pos) = found {
            self.nodes.insert(pos, node);
            self.nodes.truncate(self.max);
        }
    }

    /// Returns `true` if `id` is already among the accumulated nodes.
    pub fn contains(&self, id: &Id) -> bool {
        self.nodes.iter().any(|node| node.id == *id)
    }
}

impl IntoIterator for ClosestNodes {
    type Item = Node;
    type IntoIter = IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}
