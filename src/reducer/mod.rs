//! Batch reduction and validation
//!
//! Collapses duplicate operations in a raw batch and rejects batches whose
//! operations contradict each other through the tree's ancestor relationships.
//! A conflict always fails the whole batch; nothing is dropped silently except
//! exact duplicates, which are logged.
//!
//! # Ancestor rules
//!
//! Chains start at the node itself and climb through every parent:
//! - RM conflicts with a pending MKDIR anywhere on its chain
//! - MKDIR conflicts with a pending RM anywhere on its chain
//! - a transfer's (or UP's) source chain must hold no pending MKDIR, no RM
//!   issued at or after the transfer, and no other transfer's destination
//! - a transfer's (or UP's) destination chain must hold no pending RM and no
//!   other transfer's source

pub mod ancestry;
pub mod graph;

pub use ancestry::AncestorWalker;
pub use graph::{check_batch_shape, validate_admission, BatchGraph, GraphNode, GraphNodeKind};

use crate::error::BatchConflictError;
use crate::node::{DeviceId, Node, NodeCache, NodeId, NodeKey};
use crate::op::{OpKind, Operation};
use std::collections::HashMap;
use std::path::PathBuf;

/// How a destination's parent is identified in the dedup key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ParentIdentity {
    Id(NodeId),
    Path(PathBuf),
}

/// Destination slot: (device, parent, name). Some providers allow identical
/// names under one parent, so this is a slot, not a node identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DstKey {
    device_id: DeviceId,
    parent: ParentIdentity,
    name: String,
}

impl DstKey {
    fn of(node: &Node) -> Self {
        let parent = match node.parent_ids.iter().min() {
            Some(id) => ParentIdentity::Id(id.clone()),
            None => ParentIdentity::Path(
                node.path().parent().map(PathBuf::from).unwrap_or_default(),
            ),
        };
        Self {
            device_id: node.device_id(),
            parent,
            name: node.name.clone(),
        }
    }
}

/// Index of the operations kept so far
#[derive(Default)]
struct Pending {
    mkdir: HashMap<NodeKey, Operation>,
    rm: HashMap<NodeKey, Operation>,
    dst_slots: HashMap<DstKey, Operation>,
    transfer_src: HashMap<NodeKey, Operation>,
    transfer_dst: HashMap<NodeKey, Operation>,
}

impl Pending {
    /// Record `op`, returning false for an exact duplicate
    fn insert(&mut self, op: &Operation) -> Result<bool, BatchConflictError> {
        match op.kind {
            OpKind::Mkdir => {
                let key = op.src_node.key();
                if self.mkdir.contains_key(&key) {
                    tracing::warn!(op = %op, "Discarding duplicate MKDIR");
                    return Ok(false);
                }
                self.mkdir.insert(key, op.clone());
            }
            OpKind::Rm => {
                let key = op.src_node.key();
                if self.rm.contains_key(&key) {
                    tracing::warn!(op = %op, "Discarding duplicate RM");
                    return Ok(false);
                }
                self.rm.insert(key, op.clone());
            }
            OpKind::Cp | OpKind::CpOnto | OpKind::Mv | OpKind::MvOnto | OpKind::Up => {
                let Some(dst) = op.dst_node.as_ref() else {
                    return Ok(true);
                };
                let slot = DstKey::of(dst);
                if let Some(existing) = self.dst_slots.get(&slot) {
                    if existing.kind == op.kind && existing.src_node.key() == op.src_node.key() {
                        tracing::warn!(op = %op, duplicate_of = %existing.op_id, "Discarding duplicate transfer");
                        return Ok(false);
                    }
                    return Err(BatchConflictError::new(
                        existing,
                        op,
                        format!("both write {} under the same parent", dst.name),
                    ));
                }
                self.dst_slots.insert(slot, op.clone());
                self.transfer_src.entry(op.src_node.key()).or_insert_with(|| op.clone());
                self.transfer_dst.insert(dst.key(), op.clone());
            }
        }
        Ok(true)
    }
}

/// Deduplicates and validates raw batches
pub struct BatchReducer<'a> {
    cache: &'a dyn NodeCache,
}

impl<'a> BatchReducer<'a> {
    pub fn new(cache: &'a dyn NodeCache) -> Self {
        Self { cache }
    }

    /// Drop exact duplicates and reject conflicting combinations.
    ///
    /// Reducing an already-reduced batch returns it unchanged.
    pub fn reduce_and_validate(&self, ops: Vec<Operation>) -> Result<Vec<Operation>, BatchConflictError> {
        let total = ops.len();
        let mut pending = Pending::default();
        let mut kept = Vec::with_capacity(total);

        for op in ops {
            if pending.insert(&op)? {
                kept.push(op);
            }
        }

        let walker = AncestorWalker::new(self.cache, &kept);
        for op in &kept {
            if let Err(err) = check_ancestors(op, &pending, &walker) {
                tracing::error!(error = %err, "Rejecting batch");
                return Err(err);
            }
        }

        if kept.len() < total {
            tracing::info!(kept = kept.len(), discarded = total - kept.len(), "Reduced batch");
        }

        Ok(kept)
    }
}

fn check_ancestors(op: &Operation, pending: &Pending, walker: &AncestorWalker) -> Result<(), BatchConflictError> {
    match op.kind {
        OpKind::Mkdir => {
            for key in walker.chain(&op.src_node) {
                if let Some(rm) = pending.rm.get(&key) {
                    return Err(BatchConflictError::new(rm, op, "MKDIR below a node being removed"));
                }
            }
        }
        OpKind::Rm => {
            for key in walker.chain(&op.src_node) {
                if let Some(mkdir) = pending.mkdir.get(&key) {
                    return Err(BatchConflictError::new(mkdir, op, "RM of a node being created"));
                }
            }
        }
        OpKind::Cp | OpKind::CpOnto | OpKind::Mv | OpKind::MvOnto | OpKind::Up => {
            for key in walker.chain(&op.src_node) {
                if let Some(mkdir) = pending.mkdir.get(&key) {
                    return Err(BatchConflictError::new(mkdir, op, "source is being created"));
                }
                if let Some(rm) = pending.rm.get(&key) {
                    // RMs issued strictly before the transfer are permitted
                    if rm.op_id >= op.op_id {
                        return Err(BatchConflictError::new(op, rm, "source is removed after the transfer"));
                    }
                }
                if let Some(other) = pending.transfer_dst.get(&key) {
                    if other.op_id != op.op_id {
                        return Err(BatchConflictError::new(other, op, "source is another transfer's destination"));
                    }
                }
            }

            if let Some(dst) = &op.dst_node {
                for key in walker.chain(dst) {
                    if let Some(rm) = pending.rm.get(&key) {
                        return Err(BatchConflictError::new(rm, op, "destination is being removed"));
                    }
                    if let Some(other) = pending.transfer_src.get(&key) {
                        if other.op_id != op.op_id {
                            return Err(BatchConflictError::new(other, op, "destination is another transfer's source"));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
