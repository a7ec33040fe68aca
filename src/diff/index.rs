//! Per-side subtree index
//!
//! One walk over a subtree builds the hash and relative-path indexes the
//! differ works from.

use crate::error::HashUnavailable;
use crate::node::{ContentHash, Node, SubtreeReader};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Hash and path indexes for one side of a diff
pub struct TreeIndex {
    pub root: Node,
    /// Hashed files grouped by content, in walk order
    pub by_hash: BTreeMap<ContentHash, Vec<Node>>,
    /// Every walked node (files and directories) by path relative to the root
    pub by_path: HashMap<PathBuf, Vec<Node>>,
    /// Relative paths of files whose hash could not be computed
    pub unhashable: HashSet<PathBuf>,
    /// Hash failures, for the caller to surface
    pub skipped: Vec<HashUnavailable>,
}

impl TreeIndex {
    /// Walk the subtree under `root` (depth first, children in reader order)
    pub fn build(reader: &dyn SubtreeReader, root: &Node) -> Self {
        let mut index = Self {
            root: root.clone(),
            by_hash: BTreeMap::new(),
            by_path: HashMap::new(),
            unhashable: HashSet::new(),
            skipped: Vec::new(),
        };

        let mut stack: Vec<Node> = reader.children_of(root);
        stack.reverse();

        while let Some(node) = stack.pop() {
            let rel = index.relative_path(node.path());

            if node.is_directory() {
                let mut children = reader.children_of(&node);
                children.reverse();
                stack.extend(children);
            } else {
                match reader.content_hash(&node) {
                    Ok(hash) => index.by_hash.entry(hash).or_default().push(node.clone()),
                    Err(err) => {
                        tracing::error!(node = %node.node_ref, error = %err, "Skipping node without content hash");
                        index.unhashable.insert(rel.clone());
                        index.skipped.push(err);
                    }
                }
            }

            let entries = index.by_path.entry(rel.clone()).or_default();
            if !entries.is_empty() {
                tracing::warn!(
                    path = %rel.display(),
                    device = %node.device_id(),
                    count = entries.len() + 1,
                    "Duplicate name at one parent; first match wins"
                );
            }
            entries.push(node);
        }

        index
    }

    /// Path of `path` relative to this side's root
    pub fn relative_path(&self, path: &Path) -> PathBuf {
        path.strip_prefix(self.root.path())
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    pub fn relative_path_of(&self, node: &Node) -> PathBuf {
        self.relative_path(node.path())
    }

    /// Absolute path on this side for a relative path
    pub fn absolute_path(&self, rel: &Path) -> PathBuf {
        self.root.path().join(rel)
    }

    /// First node at `rel`, by walk order
    pub fn first_at(&self, rel: &Path) -> Option<&Node> {
        self.by_path.get(rel).and_then(|nodes| nodes.first())
    }

    pub fn has_hash(&self, hash: &ContentHash) -> bool {
        self.by_hash.contains_key(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{DeviceId, InMemoryNodeCache, NodeCache, NodeId, NodeRef};

    #[test]
    fn test_index_skips_unhashable_files() {
        let device = DeviceId::new();
        let root = Node::directory(NodeRef::new(device, NodeId::new("r"), "/root"));
        let hashed = Node::file(NodeRef::new(device, NodeId::new("a"), "/root/a.txt"))
            .with_parent(NodeId::new("r"))
            .with_hash(ContentHash::new("H1"));
        let unhashed = Node::file(NodeRef::new(device, NodeId::new("b"), "/root/b.txt"))
            .with_parent(NodeId::new("r"));
        let cache = InMemoryNodeCache::with_nodes([root.clone(), hashed, unhashed]);

        let index = TreeIndex::build(&cache, &root);
        assert_eq!(index.by_hash.len(), 1);
        assert_eq!(index.skipped.len(), 1);
        assert!(index.unhashable.contains(Path::new("b.txt")));
        assert!(index.first_at(Path::new("a.txt")).is_some());
    }

    #[test]
    fn test_index_walks_nested_directories() {
        let device = DeviceId::new();
        let root = Node::directory(NodeRef::new(device, NodeId::new("r"), "/root"));
        let sub = Node::directory(NodeRef::new(device, NodeId::new("s"), "/root/sub"))
            .with_parent(NodeId::new("r"));
        let file = Node::file(NodeRef::new(device, NodeId::new("f"), "/root/sub/f.txt"))
            .with_parent(NodeId::new("s"))
            .with_hash(ContentHash::new("H"));
        let cache = InMemoryNodeCache::with_nodes([root.clone(), sub, file]);
        cache.upsert_node(root.clone());

        let index = TreeIndex::build(&cache, &root);
        assert!(index.first_at(Path::new("sub")).unwrap().is_directory());
        assert_eq!(
            index.relative_path_of(index.first_at(Path::new("sub/f.txt")).unwrap()),
            PathBuf::from("sub/f.txt")
        );
    }
}
