//! Consistent-hash ring for routing queue names to an owning node.
//!
//! The ring hashes `"<node>:<virtual-index>"` with MD5 for each of `V` virtual points per
//! physical node, matching the source exactly (SPEC_FULL.md §4.2 / §9: "pin to a fixed 128-bit
//! hash"). Any stable 128-bit hash would satisfy the property below; MD5 is kept rather than
//! swapped for something else because every node must agree on the same function and there is
//! nothing to gain from picking a different one.

use std::collections::BTreeMap;

use md5::{Digest, Md5};

/// Default virtual nodes per physical node (SPEC_FULL.md §4.2).
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

pub struct ConsistentHashRing {
    virtual_nodes: usize,
    ring: BTreeMap<u128, String>,
}

fn hash_to_u128(input: &str) -> u128 {
    let digest = Md5::digest(input.as_bytes());
    u128::from_be_bytes(digest.into())
}

impl ConsistentHashRing {
    pub fn new(nodes: impl IntoIterator<Item = String>) -> Self {
        Self::with_virtual_nodes(nodes, DEFAULT_VIRTUAL_NODES)
    }

    pub fn with_virtual_nodes(nodes: impl IntoIterator<Item = String>, virtual_nodes: usize) -> Self {
        let mut ring = Self {
            virtual_nodes,
            ring: BTreeMap::new(),
        };
        for node in nodes {
            ring.add_node(&node);
        }
        ring
    }

    pub fn add_node(&mut self, node: &str) {
        for i in 0..self.virtual_nodes {
            let point = hash_to_u128(&format!("{node}:{i}"));
            self.ring.insert(point, node.to_string());
        }
    }

    pub fn remove_node(&mut self, node: &str) {
        for i in 0..self.virtual_nodes {
            let point = hash_to_u128(&format!("{node}:{i}"));
            self.ring.remove(&point);
        }
    }

    /// Returns the node owning `key`, or `None` if the ring has no nodes.
    pub fn get_node(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let hashed = hash_to_u128(key);
        self.ring
            .range(hashed..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_key_maps_to_a_known_node() {
        let nodes = vec!["n0".to_string(), "n1".to_string(), "n2".to_string()];
        let ring = ConsistentHashRing::new(nodes.clone());
        for i in 0..1000 {
            let owner = ring.get_node(&format!("queue-{i}")).unwrap();
            assert!(nodes.contains(&owner.to_string()));
        }
    }

    #[test]
    fn removing_a_node_remaps_only_its_share() {
        let nodes = vec!["n0".to_string(), "n1".to_string(), "n2".to_string()];
        let mut ring = ConsistentHashRing::new(nodes);

        let keys: Vec<String> = (0..2000).map(|i| format!("key-{i}")).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|k| ring.get_node(k).unwrap().to_string())
            .collect();

        ring.remove_node("n1");

        let after: Vec<String> = keys
            .iter()
            .map(|k| ring.get_node(k).unwrap().to_string())
            .collect();

        let remapped = before
            .iter()
            .zip(after.iter())
            .filter(|(b, a)| b != a)
            .count();

        // Removing one of three nodes should remap roughly its own share, well under all keys.
        assert!(remapped < keys.len());
        let moved_away_from_survivors: HashSet<_> = before
            .iter()
            .zip(after.iter())
            .filter(|(b, a)| *b != *a && b.as_str() != "n1")
            .collect();
        assert!(moved_away_from_survivors.is_empty());
    }
}
