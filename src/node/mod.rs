//! Node Identity Layer
//!
//! Stable identifiers for a location in a tree. A node is named by the device
//! (tree) it lives on, a provider-assigned node id, and the path it was seen at.
//! Everything above this layer (differ, reducer, scheduler) refers to nodes only
//! through these types.

pub mod cache;

pub use cache::{InMemoryNodeCache, NodeCache, SubtreeReader, TRASH_HISTORY};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Identifies one tree: a local disk, a cloud drive account, etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provider-assigned identifier of a node within one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate an id for a node that does not exist yet (copy/move
    /// destinations, planned directories).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash-map key naming one node independent of the path it was seen at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub device_id: DeviceId,
    pub node_id: NodeId,
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_id, self.node_id)
    }
}

/// A reference to one node at one path in one tree. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    pub device_id: DeviceId,
    pub node_id: NodeId,
    pub path: PathBuf,
}

impl NodeRef {
    pub fn new(device_id: DeviceId, node_id: NodeId, path: impl Into<PathBuf>) -> Self {
        Self {
            device_id,
            node_id,
            path: path.into(),
        }
    }

    pub fn key(&self) -> NodeKey {
        NodeKey {
            device_id: self.device_id,
            node_id: self.node_id.clone(),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_id, self.path.display())
    }
}

/// Content digest (MD5 for most cloud providers) used to match files across trees.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Type of node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Regular file
    #[default]
    File,
    /// Directory containing other nodes
    Directory,
}

/// A node as known to the node cache.
///
/// `parent_ids` holds every parent the provider reports; local trees have
/// exactly one, some cloud drives allow several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_ref: NodeRef,

    /// Basename
    pub name: String,

    pub node_type: NodeType,

    /// Parent node ids on the same device (empty for a tree root)
    pub parent_ids: Vec<NodeId>,

    /// Content digest; `None` for directories and for files not hashed yet
    pub content_hash: Option<ContentHash>,

    /// Size in bytes (0 for directories)
    pub size: u64,

    pub modified_at: Option<DateTime<Utc>>,

    /// False for placeholders of nodes that a pending operation will create
    pub is_live: bool,
}

impl Node {
    /// Create a new node with minimal required fields
    pub fn new(node_ref: NodeRef, node_type: NodeType) -> Self {
        let name = node_ref
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| node_ref.path.to_string_lossy().to_string());

        Self {
            node_ref,
            name,
            node_type,
            parent_ids: Vec::new(),
            content_hash: None,
            size: 0,
            modified_at: None,
            is_live: true,
        }
    }

    /// Create a file node
    pub fn file(node_ref: NodeRef) -> Self {
        Self::new(node_ref, NodeType::File)
    }

    /// Create a directory node
    pub fn directory(node_ref: NodeRef) -> Self {
        Self::new(node_ref, NodeType::Directory)
    }

    pub fn with_parent(mut self, parent_id: NodeId) -> Self {
        if !self.parent_ids.contains(&parent_id) {
            self.parent_ids.push(parent_id);
        }
        self
    }

    pub fn with_hash(mut self, hash: ContentHash) -> Self {
        self.content_hash = Some(hash);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_modified_at(mut self, modified_at: DateTime<Utc>) -> Self {
        self.modified_at = Some(modified_at);
        self
    }

    /// Mark as a placeholder for a node that does not exist yet
    pub fn as_placeholder(mut self) -> Self {
        self.is_live = false;
        self
    }

    pub fn key(&self) -> NodeKey {
        self.node_ref.key()
    }

    pub fn device_id(&self) -> DeviceId {
        self.node_ref.device_id
    }

    pub fn path(&self) -> &Path {
        &self.node_ref.path
    }

    pub fn is_directory(&self) -> bool {
        self.node_type == NodeType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.node_type == NodeType::File
    }
}
