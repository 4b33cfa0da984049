//! Consistent hashing with virtual nodes.
//!
//! Each member is placed on the ring `vnodes_per_node` times, so that a
//! membership change only moves the identifiers adjacent to the vnodes of
//! the member that joined or left.

use crate::types::Node;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Number of virtual nodes per member.
pub const DEFAULT_VNODES_PER_NODE: usize = 256;

/// A consistent hash ring mapping identifiers to members.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Ring position to owning member.
    vnodes: BTreeMap<u64, Node>,

    /// Number of virtual nodes per member.
    vnodes_per_node: usize,

    /// Members on the ring, sorted.
    nodes: Vec<Node>,
}

impl HashRing {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self::with_vnodes(DEFAULT_VNODES_PER_NODE)
    }

    /// Create an empty ring with a custom vnode count.
    pub fn with_vnodes(vnodes_per_node: usize) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            vnodes_per_node: vnodes_per_node.max(1),
            nodes: Vec::new(),
        }
    }

    /// Build a ring holding every member of `members`.
    pub fn from_members<'a>(members: impl IntoIterator<Item = &'a Node>, vnodes_per_node: usize) -> Self {
        let mut ring = Self::with_vnodes(vnodes_per_node);
        for node in members {
            ring.add_node(node.clone());
        }
        ring
    }

    /// Number of members on the ring.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Members on the ring, sorted by address.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Whether a member is on the ring.
    pub fn contains_node(&self, node: &Node) -> bool {
        self.nodes.contains(node)
    }

    /// Add a member.
    pub fn add_node(&mut self, node: Node) {
        if self.nodes.contains(&node) {
            return;
        }

        for i in 0..self.vnodes_per_node {
            let position = Self::vnode_position(&node, i);
            self.vnodes.insert(position, node.clone());
        }

        self.nodes.push(node);
        self.nodes.sort();
    }

    /// Remove a member.
    pub fn remove_node(&mut self, node: &Node) {
        if !self.nodes.contains(node) {
            return;
        }

        self.nodes.retain(|n| n != node);

        for i in 0..self.vnodes_per_node {
            let position = Self::vnode_position(node, i);
            // Only drop the vnode if it was not claimed by a colliding member.
            if self.vnodes.get(&position) == Some(node) {
                self.vnodes.remove(&position);
            }
        }
    }

    /// The owner of `key`, or None if the ring is empty.
    pub fn owner<K: Hash + ?Sized>(&self, key: &K) -> Option<&Node> {
        self.owner_at(hash_key(key))
    }

    /// Whether `node` owns `key`.
    pub fn is_owner<K: Hash + ?Sized>(&self, key: &K, node: &Node) -> bool {
        self.owner(key) == Some(node)
    }

    /// Count owners over a sample of generated keys.
    pub fn distribution(&self, sample_size: usize) -> std::collections::HashMap<Node, usize> {
        let mut distribution = std::collections::HashMap::new();

        for i in 0..sample_size {
            let key = format!("sample_key_{}", i);
            if let Some(owner) = self.owner(key.as_str()) {
                *distribution.entry(owner.clone()).or_insert(0) += 1;
            }
        }

        distribution
    }

    fn owner_at(&self, position: u64) -> Option<&Node> {
        // First vnode at or after the position, wrapping around.
        self.vnodes
            .range(position..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .map(|(_, node)| node)
    }

    fn vnode_position(node: &Node, index: usize) -> u64 {
        hash_key(format!("{}:{}", node.addr, index).as_str())
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a key with xxHash64 (seed 0).
pub fn hash_key<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    key.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> Node {
        Node::new(format!("node-{}", port), ([127, 0, 0, 1], port).into())
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::new();
        assert_eq!(ring.node_count(), 0);
        assert!(ring.owner("key").is_none());
    }

    #[test]
    fn test_single_node() {
        let mut ring = HashRing::new();
        ring.add_node(node(1));

        assert_eq!(ring.node_count(), 1);
        assert_eq!(ring.owner("key"), Some(&node(1)));
        assert!(ring.is_owner("key", &node(1)));
    }

    #[test]
    fn test_add_remove_node() {
        let mut ring = HashRing::new();
        ring.add_node(node(1));
        ring.add_node(node(2));
        assert!(ring.contains_node(&node(1)));

        ring.remove_node(&node(1));

        assert_eq!(ring.node_count(), 1);
        assert!(!ring.contains_node(&node(1)));
        // All keys now go to the remaining member
        assert_eq!(ring.owner("key"), Some(&node(2)));
        assert_eq!(ring.owner(&42u64), Some(&node(2)));
    }

    #[test]
    fn test_owner_independent_of_insertion_order() {
        let a = HashRing::from_members(&[node(1), node(2), node(3)], 64);
        let b = HashRing::from_members(&[node(3), node(1), node(2)], 64);

        for i in 0..200u32 {
            assert_eq!(a.owner(&i), b.owner(&i));
        }
    }

    #[test]
    fn test_removal_only_moves_departed_keys() {
        let full = HashRing::from_members(&[node(1), node(2), node(3)], 64);
        let mut reduced = full.clone();
        reduced.remove_node(&node(3));

        for i in 0..500u32 {
            let before = full.owner(&i).cloned();
            let after = reduced.owner(&i).cloned();
            if before != Some(node(3)) {
                assert_eq!(before, after);
            }
        }
    }

    #[test]
    fn test_distribution() {
        let ring = HashRing::from_members(&[node(1), node(2), node(3)], DEFAULT_VNODES_PER_NODE);
        let distribution = ring.distribution(10000);

        for member in ring.nodes() {
            let count = distribution.get(member).copied().unwrap_or(0);
            assert!(count > 2500 && count < 4500, "{} has {} keys", member, count);
        }
    }

    #[test]
    fn test_duplicate_add() {
        let mut ring = HashRing::new();
        ring.add_node(node(1));
        ring.add_node(node(1));
        assert_eq!(ring.node_count(), 1);
    }
}
