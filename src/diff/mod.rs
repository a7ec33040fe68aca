//! Content-first diffing of two subtrees
//!
//! Produces the operations that would reconcile a left and a right subtree,
//! expressed from each side's perspective.

pub mod differ;
pub mod index;

pub use differ::ContentFirstDiffer;
pub use index::TreeIndex;

use crate::error::HashUnavailable;
use crate::node::{Node, NodeRef};
use crate::op::Operation;
use serde::{Deserialize, Serialize};

/// How same-hash files at different paths are paired into moves.
///
/// Both strategies are heuristics: content equality says nothing about which
/// file was actually moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovePairing {
    /// Pair in tree walk order
    #[default]
    IndexOrder,
    /// Pair most recently modified files first; unknown times go last
    NewestFirst,
}

impl MovePairing {
    pub(crate) fn order<'n>(&self, mut nodes: Vec<&'n Node>) -> Vec<&'n Node> {
        match self {
            MovePairing::IndexOrder => nodes,
            MovePairing::NewestFirst => {
                // stable, so ties keep walk order
                nodes.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
                nodes
            }
        }
    }
}

/// Differ configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffConfig {
    pub move_pairing: MovePairing,
}

/// Output of one diff
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// Operations whose target is on the left tree (one batch)
    pub left_ops: Vec<Operation>,
    /// Operations whose target is on the right tree (one batch)
    pub right_ops: Vec<Operation>,
    /// Left nodes copied to the right with no left-side counterpart.
    /// Informational only: no RM is generated for them.
    pub left_removed: Vec<NodeRef>,
    /// Mirror of `left_removed`
    pub right_removed: Vec<NodeRef>,
    /// Nodes left out of the diff because their hash was unavailable
    pub skipped: Vec<HashUnavailable>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.left_ops.is_empty() && self.right_ops.is_empty()
    }
}
