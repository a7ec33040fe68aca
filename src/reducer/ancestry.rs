//! Ancestor chains
//!
//! Walks a node's parents through the node cache, falling back to nodes that
//! the batch itself creates (new directories, copy destinations) when the
//! cache does not know a parent yet.

use crate::node::{Node, NodeCache, NodeKey};
use crate::op::Operation;
use std::collections::{HashMap, HashSet};

pub struct AncestorWalker<'a> {
    cache: &'a dyn NodeCache,
    batch_nodes: HashMap<NodeKey, Node>,
}

impl<'a> AncestorWalker<'a> {
    pub fn new(cache: &'a dyn NodeCache, ops: &[Operation]) -> Self {
        let batch_nodes = ops
            .iter()
            .filter_map(Operation::created_node)
            .map(|node| (node.key(), node.clone()))
            .collect();
        Self { cache, batch_nodes }
    }

    /// `node` followed by every ancestor reachable through any parent,
    /// nearest first. Each node appears once even on multi-parent trees.
    pub fn chain(&self, node: &Node) -> Vec<NodeKey> {
        let mut chain = Vec::new();
        let mut seen: HashSet<NodeKey> = HashSet::new();
        let mut frontier = vec![node.clone()];

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for current in frontier {
                if !seen.insert(current.key()) {
                    continue;
                }
                chain.push(current.key());
                next.extend(self.parents(&current));
            }
            frontier = next;
        }

        chain
    }

    fn parents(&self, node: &Node) -> Vec<Node> {
        let mut parents = self.cache.parents_of(node);
        for parent_id in &node.parent_ids {
            let key = NodeKey {
                device_id: node.device_id(),
                node_id: parent_id.clone(),
            };
            if parents.iter().any(|p| p.key() == key) {
                continue;
            }
            if let Some(planned) = self.batch_nodes.get(&key) {
                parents.push(planned.clone());
            }
        }
        parents
    }
}
