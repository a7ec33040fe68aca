//! Batch assembly
//!
//! Operation and batch ids come from one process-wide monotonic sequence so
//! that every batch created after startup sorts after everything already
//! persisted, and the scheduler's high-water-mark can reject replays.

use super::entry::{BatchId, OpId, OpKind, Operation};
use crate::error::InvalidOperation;
use crate::node::Node;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic id source shared by op ids and batch ids
#[derive(Debug)]
pub struct UidGenerator {
    next: AtomicU64,
}

impl UidGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_uid(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_op_id(&self) -> OpId {
        OpId(self.next_uid())
    }

    pub fn next_batch_id(&self) -> BatchId {
        BatchId(self.next_uid())
    }

    /// Make sure every id handed out from now on is greater than `uid`
    pub fn ensure_above(&self, uid: u64) {
        self.next.fetch_max(uid.saturating_add(1), Ordering::SeqCst);
    }

    /// The id the next call will return (for diagnostics)
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for UidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects operations for one batch, assigning op ids in creation order.
pub struct BatchBuilder<'a> {
    uids: &'a UidGenerator,
    batch_id: BatchId,
    ops: Vec<Operation>,
}

impl<'a> BatchBuilder<'a> {
    pub fn new(uids: &'a UidGenerator) -> Self {
        Self {
            batch_id: uids.next_batch_id(),
            uids,
            ops: Vec::new(),
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Append an operation of any kind
    pub fn push(
        &mut self,
        kind: OpKind,
        src_node: Node,
        dst_node: Option<Node>,
    ) -> Result<OpId, InvalidOperation> {
        let op = Operation::new(self.uids.next_op_id(), self.batch_id, kind, src_node, dst_node)?;
        let op_id = op.op_id;
        self.ops.push(op);
        Ok(op_id)
    }

    pub fn mkdir(&mut self, node: Node) -> OpId {
        self.push_unchecked(OpKind::Mkdir, node, None)
    }

    pub fn rm(&mut self, node: Node) -> OpId {
        self.push_unchecked(OpKind::Rm, node, None)
    }

    /// CP, CP_ONTO, MV, MV_ONTO or UP
    pub fn transfer(&mut self, kind: OpKind, src: Node, dst: Node) -> Result<OpId, InvalidOperation> {
        self.push(kind, src, Some(dst))
    }

    // kind/destination agreement is guaranteed by the callers above
    fn push_unchecked(&mut self, kind: OpKind, src_node: Node, dst_node: Option<Node>) -> OpId {
        let op_id = self.uids.next_op_id();
        self.ops.push(Operation {
            op_id,
            batch_id: self.batch_id,
            kind,
            src_node,
            dst_node,
            created_at: Utc::now(),
        });
        op_id
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn build(self) -> Vec<Operation> {
        self.ops
    }
}
