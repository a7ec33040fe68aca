//! Operation Graph
//!
//! The live scheduling structure. Every tree node touched by a pending
//! operation owns a FIFO queue; an operation is handed to a worker once it is
//! at the head of every queue it occupies and its structural prerequisites
//! (parent MKDIRs, work below an RM) have completed.
//!
//! One mutex guards all state. Workers block on a condition variable in
//! `next_ready` and are woken by `enqueue`, `complete`, `retry` and `shutdown`.
//! Readiness is tracked incrementally: an operation is only re-examined when
//! it reaches the head of a queue, loses its last prerequisite, or is retried.

use crate::error::{AdmissionError, GraphError};
use crate::node::{Node, NodeKey};
use crate::op::{OpId, OpKind, Operation};
use crate::reducer::BatchGraph;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

/// Scheduling state of an admitted operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpState {
    /// Waiting for its queues and prerequisites
    Queued,
    /// Handed out by `next_ready`, not yet completed
    Running,
    /// Reported failed; holds its queues until retried
    Failed,
}

struct Slot {
    op: Arc<Operation>,
    state: OpState,
    /// Node queues this operation occupies
    queues: Vec<NodeKey>,
    /// Operations that must complete first
    waits_on: BTreeSet<OpId>,
}

#[derive(Default)]
struct GraphState {
    ops: BTreeMap<OpId, Slot>,
    queues: HashMap<NodeKey, VecDeque<OpId>>,
    /// Prerequisite -> operations waiting on it
    dependents: HashMap<OpId, Vec<OpId>>,
    /// Queued operations that could be dispatched right now
    ready: BTreeSet<OpId>,
    high_water_mark: OpId,
    shutdown: bool,
}

impl GraphState {
    fn is_ready(&self, op_id: OpId, slot: &Slot) -> bool {
        slot.state == OpState::Queued
            && slot.waits_on.is_empty()
            && slot
                .queues
                .iter()
                .all(|key| self.queues.get(key).and_then(|q| q.front()) == Some(&op_id))
    }

    /// Add `op_id` to the ready set if it can run now
    fn refresh(&mut self, op_id: OpId) {
        if self.ops.get(&op_id).is_some_and(|slot| self.is_ready(op_id, slot)) {
            self.ready.insert(op_id);
        }
    }

    /// Lowest ready op id, so older work on a node always goes first
    fn take_ready(&mut self) -> Option<Operation> {
        let op_id = self.ready.pop_first()?;
        let slot = self.ops.get_mut(&op_id)?;
        slot.state = OpState::Running;
        tracing::debug!(op_id = %op_id, kind = %slot.op.kind, "Dispatching operation");
        Some(slot.op.as_ref().clone())
    }

    fn last_pending(&self, key: &NodeKey) -> Option<&Arc<Operation>> {
        let tail = self.queues.get(key)?.back()?;
        self.ops.get(tail).map(|slot| &slot.op)
    }

    /// Pending operations `op` has to wait for beyond its own queues
    fn prerequisites(&self, op: &Operation) -> BTreeSet<OpId> {
        let mut waits_on = BTreeSet::new();

        if let Some(created) = op.created_node() {
            for (op_id, slot) in &self.ops {
                if slot.op.kind == OpKind::Mkdir && is_parent_of(&slot.op.src_node, created) {
                    waits_on.insert(*op_id);
                }
            }
        }

        if op.kind == OpKind::Rm {
            let removed = &op.src_node;
            for (op_id, slot) in &self.ops {
                let below = std::iter::once(&slot.op.src_node)
                    .chain(slot.op.dst_node.as_ref())
                    .any(|node| is_below(node, removed));
                if below {
                    waits_on.insert(*op_id);
                }
            }
        }

        waits_on
    }
}

fn is_parent_of(dir: &Node, child: &Node) -> bool {
    dir.device_id() == child.device_id()
        && (child.parent_ids.contains(&dir.node_ref.node_id) || child.path().parent() == Some(dir.path()))
}

fn is_below(node: &Node, ancestor: &Node) -> bool {
    node.device_id() == ancestor.device_id()
        && node.path() != ancestor.path()
        && node.path().starts_with(ancestor.path())
}

/// Live per-node operation queues plus the replay high-water-mark
pub struct OpGraph {
    state: Mutex<GraphState>,
    ready: Condvar,
}

impl OpGraph {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GraphState::default()),
            ready: Condvar::new(),
        }
    }

    /// Admit a validated batch.
    ///
    /// Returns the operations that were dropped because the last pending
    /// operation on the same target already has the same effect. Callers must
    /// purge those from durable storage.
    pub fn enqueue(&self, batch: BatchGraph) -> Result<Vec<Operation>, AdmissionError> {
        self.enqueue_resumed(batch, &BTreeSet::new())
    }

    /// `enqueue` for a batch recovered from storage: operations listed in
    /// `failed` are admitted already parked and wait for `retry`.
    pub fn enqueue_resumed(&self, batch: BatchGraph, failed: &BTreeSet<OpId>) -> Result<Vec<Operation>, AdmissionError> {
        let mut state = self.state.lock();

        let min_op_id = batch.min_op_id();
        if min_op_id <= state.high_water_mark {
            return Err(AdmissionError::StaleBatch {
                min_op_id,
                high_water_mark: state.high_water_mark,
            });
        }

        let mut queues_by_op: HashMap<OpId, Vec<NodeKey>> = HashMap::new();
        for member in batch.members() {
            if let (Some(op), Some(key)) = (member.op(), member.node_key()) {
                let keys = queues_by_op.entry(op.op_id).or_default();
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }

        let mut discarded = Vec::new();
        let mut admitted = 0usize;

        for op in batch.operations() {
            if let Some(last) = state.last_pending(&op.target_key()) {
                if last.op_id != op.op_id && last.same_effect(&op) {
                    tracing::warn!(op = %op, redundant_with = %last.op_id, "Discarding redundant operation");
                    discarded.push(op.as_ref().clone());
                    continue;
                }
            }

            let queues = queues_by_op.remove(&op.op_id).unwrap_or_default();
            for key in &queues {
                state.queues.entry(key.clone()).or_default().push_back(op.op_id);
            }
            let waits_on = state.prerequisites(&op);
            for prerequisite in &waits_on {
                state.dependents.entry(*prerequisite).or_default().push(op.op_id);
            }
            let op_id = op.op_id;
            let op_state = if failed.contains(&op_id) {
                OpState::Failed
            } else {
                OpState::Queued
            };
            state.ops.insert(
                op_id,
                Slot {
                    op,
                    state: op_state,
                    queues,
                    waits_on,
                },
            );
            state.refresh(op_id);
            admitted += 1;
        }

        state.high_water_mark = state.high_water_mark.max(batch.max_op_id());
        tracing::debug!(
            batch_id = %batch.batch_id(),
            admitted,
            discarded = discarded.len(),
            high_water_mark = %state.high_water_mark,
            "Enqueued batch"
        );

        drop(state);
        self.ready.notify_all();
        Ok(discarded)
    }

    /// Block until an operation is ready and mark it running.
    ///
    /// Returns `None` once the graph has been shut down.
    pub fn next_ready(&self) -> Option<Operation> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(op) = state.take_ready() {
                return Some(op);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Non-blocking variant of `next_ready`
    pub fn try_next_ready(&self) -> Option<Operation> {
        let mut state = self.state.lock();
        if state.shutdown {
            return None;
        }
        state.take_ready()
    }

    /// Remove a finished operation, unblocking whatever waited behind it
    pub fn complete(&self, op: &Operation) -> Result<(), GraphError> {
        let mut state = self.state.lock();

        match state.ops.get(&op.op_id) {
            None => return Err(GraphError::UnknownOp(op.op_id)),
            Some(slot) if slot.state != OpState::Running => return Err(GraphError::NotRunning(op.op_id)),
            Some(_) => {}
        }

        let mut touched = Vec::new();
        if let Some(slot) = state.ops.remove(&op.op_id) {
            for key in &slot.queues {
                if let Some(queue) = state.queues.get_mut(key) {
                    queue.retain(|id| *id != op.op_id);
                    match queue.front().copied() {
                        Some(head) => touched.push(head),
                        None => {
                            state.queues.remove(key);
                        }
                    }
                }
            }
        }
        for dependent in state.dependents.remove(&op.op_id).unwrap_or_default() {
            if let Some(slot) = state.ops.get_mut(&dependent) {
                slot.waits_on.remove(&op.op_id);
                touched.push(dependent);
            }
        }
        for op_id in touched {
            state.refresh(op_id);
        }

        tracing::debug!(op_id = %op.op_id, remaining = state.ops.len(), "Completed operation");
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    /// Park a running operation after an execution failure.
    ///
    /// It keeps its place at the head of its queues until `retry`.
    pub fn fail(&self, op: &Operation) -> Result<(), GraphError> {
        let mut state = self.state.lock();
        let slot = state.ops.get_mut(&op.op_id).ok_or(GraphError::UnknownOp(op.op_id))?;
        if slot.state != OpState::Running {
            return Err(GraphError::NotRunning(op.op_id));
        }
        slot.state = OpState::Failed;
        Ok(())
    }

    /// Re-arm a failed operation
    pub fn retry(&self, op_id: OpId) -> Result<Operation, GraphError> {
        let mut state = self.state.lock();
        let slot = state.ops.get_mut(&op_id).ok_or(GraphError::UnknownOp(op_id))?;
        if slot.state != OpState::Failed {
            return Err(GraphError::NotFailed(op_id));
        }
        slot.state = OpState::Queued;
        let op = slot.op.as_ref().clone();
        state.refresh(op_id);
        drop(state);
        self.ready.notify_all();
        Ok(op)
    }

    /// Wake every blocked `next_ready` caller and make it return `None`.
    /// Running operations may still be completed.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.ready.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// The most recently admitted operation still queued on `target`
    pub fn last_pending_op_for(&self, target: &NodeKey) -> Option<Operation> {
        self.state.lock().last_pending(target).map(|op| op.as_ref().clone())
    }

    /// Operations queued on `target`, oldest first
    pub fn pending_for(&self, target: &NodeKey) -> Vec<Operation> {
        let state = self.state.lock();
        state
            .queues
            .get(target)
            .map(|queue| {
                queue
                    .iter()
                    .filter_map(|id| state.ops.get(id))
                    .map(|slot| slot.op.as_ref().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn state_of(&self, op_id: OpId) -> Option<OpState> {
        self.state.lock().ops.get(&op_id).map(|slot| slot.state)
    }

    /// Largest op id ever admitted
    pub fn high_water_mark(&self) -> OpId {
        self.state.lock().high_water_mark
    }

    /// Number of admitted, not yet completed operations
    pub fn len(&self) -> usize {
        self.state.lock().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OpGraph {
    fn default() -> Self {
        Self::new()
    }
}
