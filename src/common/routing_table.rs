//! Kademlia routing table with liveness-verified bucket eviction.

use std::collections::BTreeMap;

use crate::common::{Id, Node};
use crate::rpc::ClosestNodes;

/// K = the maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

/// What [RoutingTable::update] did with a node, so the caller can drive the
/// network side effects (the table itself never touches the socket).
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The node was already present and moved to the most-recently-seen end.
    Refreshed,
    /// The node was appended to a bucket with free capacity.
    Added,
    /// The bucket is full. The least-recently-seen non-pending incumbent was
    /// marked pending and the new node queued as its replacement candidate;
    /// the caller should ping the incumbent and later call
    /// [RoutingTable::replace].
    Verifying { incumbent: Node },
    /// The node was dropped: it is the local id, or every incumbent in its
    /// full bucket is already undergoing verification.
    Discarded,
}

#[derive(Debug, Clone)]
struct BucketEntry {
    node: Node,
    pending: bool,
}

/// Kbuckets are ordered from the least recently seen node at the front to the
/// most recently seen at the back.
#[derive(Debug, Clone, Default)]
struct KBucket {
    entries: Vec<BucketEntry>,
}

impl KBucket {
    fn position(&self, id: &Id) -> Option<usize> {
        self.entries.iter().position(|entry| entry.node.id == *id)
    }

    /// Index of the least-recently-seen entry not already under verification.
    fn eviction_candidate(&self) -> Option<usize> {
        self.entries.iter().position(|entry| !entry.pending)
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
/// Kademlia routing table
pub struct RoutingTable {
    id: Id,
    buckets: BTreeMap<u8, KBucket>,
    /// Candidates waiting for an incumbent's verification ping to settle.
    pending: Vec<Node>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            buckets: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.entries.len())
    }

    pub fn contains(&self, id: &Id) -> bool {
        let distance = self.id.distance(id);

        self.buckets
            .get(&distance)
            .map(|bucket| bucket.position(id).is_some())
            .unwrap_or(false)
    }

    // === Public Methods ===

    /// Record that `node` was seen.
    ///
    /// A node already in its bucket becomes the most recently seen. A node new
    /// to a bucket with free capacity is appended. A node new to a full bucket
    /// becomes a replacement candidate for the least-recently-seen incumbent
    /// that is not already under verification; the incumbent keeps its slot
    /// until [Self::replace] settles the verification.
    pub fn update(&mut self, node: Node) -> UpdateOutcome {
        let distance = self.id.distance(&node.id);

        if distance == 0 {
            // Do not add self to the routing_table
            return UpdateOutcome::Discarded;
        }

        let bucket = self.buckets.entry(distance).or_default();

        if let Some(index) = bucket.position(&node.id) {
            let mut entry = bucket.entries.remove(index);
            entry.node = node;
            bucket.entries.push(entry);

            return UpdateOutcome::Refreshed;
        }

        if bucket.entries.len() < MAX_BUCKET_SIZE_K {
            bucket.entries.push(BucketEntry {
                node,
                pending: false,
            });

            return UpdateOutcome::Added;
        }

        match bucket.eviction_candidate() {
            Some(index) => {
                bucket.entries[index].pending = true;
                let incumbent = bucket.entries[index].node.clone();

                self.pending.push(node);

                UpdateOutcome::Verifying { incumbent }
            }
            // Every incumbent is already being verified; drop the newcomer.
            None => UpdateOutcome::Discarded,
        }
    }

    /// Settle a verification started by [Self::update]: the candidate takes
    /// the incumbent's slot in place and becomes the most recently seen.
    ///
    /// The candidate wins the slot whether the incumbent answered its ping or
    /// not; this mirrors the replace-regardless eviction policy this table is
    /// specified to keep (canonical Kademlia would retain a responsive
    /// incumbent).
    ///
    /// A no-op if either side is gone, e.g. the incumbent was erased or the
    /// candidate already settled elsewhere.
    pub fn replace(&mut self, incumbent_id: &Id, candidate_id: &Id) {
        let candidate = match self.pending.iter().position(|node| node.id == *candidate_id) {
            Some(index) => self.pending.remove(index),
            None => return,
        };

        let distance = self.id.distance(incumbent_id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            if let Some(index) = bucket.position(incumbent_id) {
                bucket.entries.remove(index);
                bucket.entries.push(BucketEntry {
                    node: candidate,
                    pending: false,
                });
            }
        }
    }

    /// Remove a node from this routing table.
    pub fn remove(&mut self, node_id: &Id) {
        let distance = self.id.distance(node_id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.entries.retain(|entry| entry.node.id != *node_id);

            if bucket.is_empty() {
                self.buckets.remove(&distance);
            }
        }
    }

    /// Return the closest `max_n` nodes to the target, ascending by distance.
    pub fn closest(&self, target: &Id, max_n: usize) -> Vec<Node> {
        let mut closest = ClosestNodes::new(*target, max_n);

        for bucket in self.buckets.values() {
            for entry in &bucket.entries {
                closest.add(entry.node.clone());
            }
        }

        closest.into_iter().collect()
    }
}
