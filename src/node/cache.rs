//! Node cache collaborator
//!
//! The live node cache is owned by the provider-sync layer; the scheduler only
//! needs to resolve nodes, walk their parents, and push placeholder / completed
//! nodes back into it. `InMemoryNodeCache` is a complete implementation used by
//! embedders without a persistent cache and by the tests.

use super::{ContentHash, DeviceId, Node, NodeId, NodeKey};
use crate::error::HashUnavailable;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

/// Trashed nodes remembered by `InMemoryNodeCache`; older entries are dropped
pub const TRASH_HISTORY: usize = 256;

/// Operations the scheduler performs against the live node cache.
pub trait NodeCache: Send + Sync {
    /// Look up a node by identity
    fn resolve_node(&self, device_id: &DeviceId, node_id: &NodeId) -> Option<Node>;

    /// All resolvable parents of `node` (several on multi-parent cloud drives)
    fn parents_of(&self, node: &Node) -> Vec<Node>;

    /// Insert or replace a node
    fn upsert_node(&self, node: Node);

    /// Remove a node, optionally recording that it went to the trash
    fn remove_node(&self, node: &Node, to_trash: bool);
}

/// Read access to a subtree, used by the differ to walk both sides.
pub trait SubtreeReader {
    /// Direct children of `node`
    fn children_of(&self, node: &Node) -> Vec<Node>;

    /// Content hash of a file node.
    ///
    /// The default trusts the hash the provider reported during sync.
    fn content_hash(&self, node: &Node) -> Result<ContentHash, HashUnavailable> {
        node.content_hash.clone().ok_or_else(|| HashUnavailable {
            node: node.node_ref.clone(),
            reason: "no content hash recorded".to_string(),
        })
    }
}

/// Thread-safe in-memory node cache
#[derive(Default)]
pub struct InMemoryNodeCache {
    nodes: RwLock<HashMap<NodeKey, Node>>,
    trashed: RwLock<VecDeque<Node>>,
}

impl InMemoryNodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cache pre-populated with `nodes`
    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let cache = Self::new();
        for node in nodes {
            cache.upsert_node(node);
        }
        cache
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// The most recent `TRASH_HISTORY` nodes removed with `to_trash = true`,
    /// oldest first
    pub fn trashed(&self) -> Vec<Node> {
        self.trashed.read().iter().cloned().collect()
    }
}

impl NodeCache for InMemoryNodeCache {
    fn resolve_node(&self, device_id: &DeviceId, node_id: &NodeId) -> Option<Node> {
        let key = NodeKey {
            device_id: *device_id,
            node_id: node_id.clone(),
        };
        self.nodes.read().get(&key).cloned()
    }

    fn parents_of(&self, node: &Node) -> Vec<Node> {
        let nodes = self.nodes.read();
        node.parent_ids
            .iter()
            .filter_map(|parent_id| {
                nodes
                    .get(&NodeKey {
                        device_id: node.device_id(),
                        node_id: parent_id.clone(),
                    })
                    .cloned()
            })
            .collect()
    }

    fn upsert_node(&self, node: Node) {
        self.nodes.write().insert(node.key(), node);
    }

    fn remove_node(&self, node: &Node, to_trash: bool) {
        let removed = self.nodes.write().remove(&node.key());
        if to_trash {
            let mut trashed = self.trashed.write();
            if trashed.len() == TRASH_HISTORY {
                trashed.pop_front();
            }
            trashed.push_back(removed.unwrap_or_else(|| node.clone()));
        }
    }
}

impl SubtreeReader for InMemoryNodeCache {
    fn children_of(&self, node: &Node) -> Vec<Node> {
        let mut children: Vec<Node> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.device_id() == node.device_id() && n.parent_ids.contains(&node.node_ref.node_id))
            .cloned()
            .collect();
        // HashMap order is random; keep walks reproducible
        children.sort_by(|a, b| {
            a.node_ref
                .path
                .cmp(&b.node_ref.path)
                .then_with(|| a.node_ref.node_id.cmp(&b.node_ref.node_id))
        });
        children
    }
}
