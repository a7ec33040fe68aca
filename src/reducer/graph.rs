//! Batch graphs and admission checks
//!
//! A reduced batch is wrapped into graph nodes under one root before it is
//! handed to the live `OpGraph`. Admission validation runs against the live
//! node cache and graph just before insertion.

use crate::error::AdmissionError;
use crate::graph::OpGraph;
use crate::node::{NodeCache, NodeKey};
use crate::op::{BatchId, OpId, OpKind, Operation};
use std::collections::HashSet;
use std::sync::Arc;

/// Role of a graph node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphNodeKind {
    /// Iteration anchor for one batch; never scheduled
    Root,
    /// Occupies the source node of a MKDIR or transfer
    Src,
    /// Occupies the destination node of a transfer
    Dst,
    /// Occupies the node being removed
    Rm,
}

/// One operation's claim on one node, or a batch root
#[derive(Debug, Clone)]
pub enum GraphNode {
    Root {
        batch_id: BatchId,
        children: Vec<GraphNode>,
    },
    Src(Arc<Operation>),
    Dst(Arc<Operation>),
    Rm(Arc<Operation>),
}

impl GraphNode {
    pub fn kind(&self) -> GraphNodeKind {
        match self {
            GraphNode::Root { .. } => GraphNodeKind::Root,
            GraphNode::Src(_) => GraphNodeKind::Src,
            GraphNode::Dst(_) => GraphNodeKind::Dst,
            GraphNode::Rm(_) => GraphNodeKind::Rm,
        }
    }

    pub fn op(&self) -> Option<&Arc<Operation>> {
        match self {
            GraphNode::Root { .. } => None,
            GraphNode::Src(op) | GraphNode::Dst(op) | GraphNode::Rm(op) => Some(op),
        }
    }

    /// The tree node whose queue this graph node joins
    pub fn node_key(&self) -> Option<NodeKey> {
        match self {
            GraphNode::Root { .. } => None,
            GraphNode::Src(op) | GraphNode::Rm(op) => Some(op.src_node.key()),
            GraphNode::Dst(op) => op.dst_node.as_ref().map(|dst| dst.key()),
        }
    }
}

/// All graph nodes of one batch, linked under a single root
#[derive(Debug, Clone)]
pub struct BatchGraph {
    batch_id: BatchId,
    root: GraphNode,
}

impl BatchGraph {
    /// Wrap a batch. Fails unless the batch is non-empty, uses one batch id,
    /// and is ordered by non-decreasing op id.
    pub fn build(ops: Vec<Operation>) -> Result<Self, AdmissionError> {
        check_batch_shape(&ops)?;
        let batch_id = ops[0].batch_id;

        let mut children = Vec::with_capacity(ops.len() * 2);
        for op in ops {
            let op = Arc::new(op);
            children.push(match op.kind {
                OpKind::Rm => GraphNode::Rm(Arc::clone(&op)),
                _ => GraphNode::Src(Arc::clone(&op)),
            });
            if op.dst_node.is_some() {
                children.push(GraphNode::Dst(op));
            }
        }

        Ok(Self {
            batch_id,
            root: GraphNode::Root { batch_id, children },
        })
    }

    pub fn root(&self) -> &GraphNode {
        &self.root
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Graph nodes below the root, in insertion order
    pub fn members(&self) -> &[GraphNode] {
        match &self.root {
            GraphNode::Root { children, .. } => children,
            _ => &[],
        }
    }

    /// Distinct operations in op id order
    pub fn operations(&self) -> Vec<Arc<Operation>> {
        let mut seen = HashSet::new();
        self.members()
            .iter()
            .filter_map(GraphNode::op)
            .filter(|op| seen.insert(op.op_id))
            .cloned()
            .collect()
    }

    pub fn min_op_id(&self) -> OpId {
        self.members()
            .iter()
            .filter_map(GraphNode::op)
            .map(|op| op.op_id)
            .min()
            .unwrap_or(OpId(0))
    }

    pub fn max_op_id(&self) -> OpId {
        self.members()
            .iter()
            .filter_map(GraphNode::op)
            .map(|op| op.op_id)
            .max()
            .unwrap_or(OpId(0))
    }
}

/// Non-empty, single batch id, non-decreasing op ids
pub fn check_batch_shape(ops: &[Operation]) -> Result<(), AdmissionError> {
    let first = ops.first().ok_or(AdmissionError::EmptyBatch)?;

    for pair in ops.windows(2) {
        if pair[1].op_id < pair[0].op_id {
            return Err(AdmissionError::OutOfOrder {
                previous: pair[0].op_id,
                op_id: pair[1].op_id,
            });
        }
    }

    if let Some(stray) = ops.iter().find(|op| op.batch_id != first.batch_id) {
        return Err(AdmissionError::MixedBatch {
            expected: first.batch_id,
            found: stray.batch_id,
            op_id: stray.op_id,
        });
    }

    Ok(())
}

/// Check a batch against the live cache and graph before insertion
pub fn validate_admission(
    batch: &BatchGraph,
    cache: &dyn NodeCache,
    graph: &OpGraph,
) -> Result<(), AdmissionError> {
    let ops = batch.operations();

    let created: HashSet<NodeKey> = ops
        .iter()
        .filter_map(|op| op.created_node())
        .map(|node| node.key())
        .collect();

    for op in &ops {
        match op.created_node() {
            Some(node) => {
                let has_parent = node.parent_ids.iter().any(|parent_id| {
                    cache.resolve_node(&node.device_id(), parent_id).is_some()
                        || created.contains(&NodeKey {
                            device_id: node.device_id(),
                            node_id: parent_id.clone(),
                        })
                });
                if !has_parent {
                    return Err(AdmissionError::MissingParent {
                        op_id: op.op_id,
                        node: node.node_ref.clone(),
                    });
                }
            }
            None => {
                let target = op.target_node();
                if cache
                    .resolve_node(&target.device_id(), &target.node_ref.node_id)
                    .is_none()
                {
                    return Err(AdmissionError::MissingTarget {
                        op_id: op.op_id,
                        node: target.node_ref.clone(),
                    });
                }
            }
        }

        if op.kind != OpKind::Rm {
            let mut touched = vec![op.src_node.key()];
            if let Some(dst) = &op.dst_node {
                touched.push(dst.key());
            }
            for key in touched {
                if let Some(pending) = graph.last_pending_op_for(&key) {
                    if pending.kind == OpKind::Rm {
                        return Err(AdmissionError::ReadFromRemoved {
                            op_id: op.op_id,
                            rm_op_id: pending.op_id,
                            node: pending.src_node.node_ref.clone(),
                        });
                    }
                }
            }
        }
    }

    let high_water_mark = graph.high_water_mark();
    let min_op_id = batch.min_op_id();
    if min_op_id <= high_water_mark {
        return Err(AdmissionError::StaleBatch {
            min_op_id,
            high_water_mark,
        });
    }

    Ok(())
}
