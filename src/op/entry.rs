//! Operation types
//!
//! Defines the closed set of file-level mutations and the `Operation` record
//! that flows from the differ (or a user action) through the reducer, the
//! scheduler and the durable store.

use crate::error::InvalidOperation;
use crate::node::{Node, NodeKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic operation identifier. Orders operations globally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Identifier shared by every operation of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch#{}", self.0)
    }
}

/// Kind of file-level mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpKind {
    /// Create a directory
    Mkdir,
    /// Remove a node
    Rm,
    /// Copy to a new destination node
    Cp,
    /// Copy over an existing destination node
    CpOnto,
    /// Move to a new destination node
    Mv,
    /// Move over an existing destination node
    MvOnto,
    /// Overwrite an existing destination's content with the source's
    Up,
}

impl OpKind {
    /// Whether operations of this kind carry a destination node
    pub fn has_dst(self) -> bool {
        match self {
            OpKind::Mkdir | OpKind::Rm => false,
            OpKind::Cp | OpKind::CpOnto | OpKind::Mv | OpKind::MvOnto | OpKind::Up => true,
        }
    }

    /// Whether the operation brings a node into existence (MKDIR's source,
    /// CP/MV's destination)
    pub fn creates_node(self) -> bool {
        match self {
            OpKind::Mkdir | OpKind::Cp | OpKind::Mv => true,
            OpKind::Rm | OpKind::CpOnto | OpKind::MvOnto | OpKind::Up => false,
        }
    }

    /// Whether the operation reads its source node's content
    pub fn reads_src(self) -> bool {
        self.has_dst()
    }

    /// Copy and move family (everything the ancestor rules treat as a transfer)
    pub fn is_transfer(self) -> bool {
        match self {
            OpKind::Cp | OpKind::CpOnto | OpKind::Mv | OpKind::MvOnto => true,
            OpKind::Mkdir | OpKind::Rm | OpKind::Up => false,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Mkdir => "MKDIR",
            OpKind::Rm => "RM",
            OpKind::Cp => "CP",
            OpKind::CpOnto => "CP_ONTO",
            OpKind::Mv => "MV",
            OpKind::MvOnto => "MV_ONTO",
            OpKind::Up => "UP",
        };
        f.write_str(name)
    }
}

/// A single file-level mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub op_id: OpId,
    pub batch_id: BatchId,
    pub kind: OpKind,
    pub src_node: Node,
    /// Present exactly when `kind.has_dst()`
    pub dst_node: Option<Node>,
    pub created_at: DateTime<Utc>,
}

impl Operation {
    /// Create an operation, checking that the destination matches the kind
    pub fn new(
        op_id: OpId,
        batch_id: BatchId,
        kind: OpKind,
        src_node: Node,
        dst_node: Option<Node>,
    ) -> Result<Self, InvalidOperation> {
        match (kind.has_dst(), dst_node.is_some()) {
            (true, false) => return Err(InvalidOperation::MissingDestination { op_id, kind }),
            (false, true) => return Err(InvalidOperation::UnexpectedDestination { op_id, kind }),
            _ => {}
        }

        Ok(Self {
            op_id,
            batch_id,
            kind,
            src_node,
            dst_node,
            created_at: Utc::now(),
        })
    }

    /// The node this operation occupies in the dependency graph:
    /// the destination if present, else the source.
    pub fn target_node(&self) -> &Node {
        self.dst_node.as_ref().unwrap_or(&self.src_node)
    }

    pub fn target_key(&self) -> NodeKey {
        self.target_node().key()
    }

    /// The node brought into existence, if any
    pub fn created_node(&self) -> Option<&Node> {
        match self.kind {
            OpKind::Mkdir => Some(&self.src_node),
            OpKind::Cp | OpKind::Mv => self.dst_node.as_ref(),
            _ => None,
        }
    }

    /// True when both operations describe the same mutation on the same nodes
    pub fn same_effect(&self, other: &Operation) -> bool {
        self.kind == other.kind
            && self.src_node.key() == other.src_node.key()
            && self.dst_node.as_ref().map(Node::key) == other.dst_node.as_ref().map(Node::key)
    }

    /// Human-readable description of this operation
    pub fn description(&self) -> String {
        match &self.dst_node {
            Some(dst) => format!(
                "{} {} {} -> {}",
                self.op_id,
                self.kind,
                self.src_node.node_ref,
                dst.node_ref
            ),
            None => format!("{} {} {}", self.op_id, self.kind, self.src_node.node_ref),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{DeviceId, NodeId, NodeRef};

    fn node(device: DeviceId, id: &str, path: &str) -> Node {
        Node::file(NodeRef::new(device, NodeId::new(id), path))
    }

    #[test]
    fn test_kind_destination_rules() {
        let device = DeviceId::new();
        let err = Operation::new(OpId(1), BatchId(1), OpKind::Cp, node(device, "a", "/a"), None);
        assert!(matches!(err, Err(InvalidOperation::MissingDestination { .. })));

        let err = Operation::new(
            OpId(1),
            BatchId(1),
            OpKind::Rm,
            node(device, "a", "/a"),
            Some(node(device, "b", "/b")),
        );
        assert!(matches!(err, Err(InvalidOperation::UnexpectedDestination { .. })));
    }

    #[test]
    fn test_target_node() {
        let device = DeviceId::new();
        let rm = Operation::new(OpId(1), BatchId(1), OpKind::Rm, node(device, "a", "/a"), None).unwrap();
        assert_eq!(rm.target_node().name, "a");

        let cp = Operation::new(
            OpId(2),
            BatchId(1),
            OpKind::Cp,
            node(device, "a", "/a"),
            Some(node(device, "b", "/b")),
        )
        .unwrap();
        assert_eq!(cp.target_key(), NodeKey { device_id: device, node_id: NodeId::new("b") });
        assert_eq!(cp.created_node().map(|n| n.name.as_str()), Some("b"));
    }

    #[test]
    fn test_serde_kind_names() {
        let json = serde_json::to_string(&OpKind::CpOnto).unwrap();
        assert_eq!(json, "\"CP_ONTO\"");
    }
}
