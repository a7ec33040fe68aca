//! Error types
//!
//! Batch-level errors (conflicts, admission failures) reject a whole batch
//! before any side effect. Execution errors are scoped to a single operation.

use crate::node::NodeRef;
use crate::op::{BatchId, OpId, OpKind, Operation};
use thiserror::Error;

/// A node's content hash could not be computed. The differ logs and skips it.
#[derive(Debug, Clone, Error)]
#[error("content hash unavailable for {node}: {reason}")]
pub struct HashUnavailable {
    pub node: NodeRef,
    pub reason: String,
}

/// An operation whose destination does not agree with its kind
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidOperation {
    #[error("{op_id} ({kind}) requires a destination node")]
    MissingDestination { op_id: OpId, kind: OpKind },

    #[error("{op_id} ({kind}) must not have a destination node")]
    UnexpectedDestination { op_id: OpId, kind: OpKind },
}

/// Two operations of one batch cannot both be applied
#[derive(Debug, Clone, Error)]
#[error("batch conflict between {} and {}: {reason}", .first.op_id, .second.op_id)]
pub struct BatchConflictError {
    /// The operation already accepted by the reducer
    pub first: Box<Operation>,
    /// The operation that clashes with it
    pub second: Box<Operation>,
    pub reason: String,
}

impl BatchConflictError {
    pub fn new(first: &Operation, second: &Operation, reason: impl Into<String>) -> Self {
        Self {
            first: Box::new(first.clone()),
            second: Box::new(second.clone()),
            reason: reason.into(),
        }
    }
}

/// A reduced batch that cannot be admitted into the live graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("batch is empty")]
    EmptyBatch,

    #[error("batch mixes batch ids: expected {expected}, found {found} on {op_id}")]
    MixedBatch {
        expected: BatchId,
        found: BatchId,
        op_id: OpId,
    },

    #[error("operations out of order: {op_id} follows {previous}")]
    OutOfOrder { previous: OpId, op_id: OpId },

    #[error("{op_id}: no parent of {node} is known or being created")]
    MissingParent { op_id: OpId, node: NodeRef },

    #[error("{op_id}: target {node} is not in the node cache")]
    MissingTarget { op_id: OpId, node: NodeRef },

    #[error("{op_id}: {node} is pending removal by {rm_op_id}")]
    ReadFromRemoved {
        op_id: OpId,
        rm_op_id: OpId,
        node: NodeRef,
    },

    #[error("stale batch: smallest {min_op_id} is not above high-water-mark {high_water_mark}")]
    StaleBatch { min_op_id: OpId, high_water_mark: OpId },
}

/// Kind of durable store failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    Io,
    Serialization,
    Lock,
}

/// Durable pending-op store failure
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StoreError {
    pub message: String,
    pub kind: StoreErrorKind,
    #[source]
    pub source: Option<std::io::Error>,
}

impl StoreError {
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self {
            message: format!("{}: {}", message.into(), source),
            kind: StoreErrorKind::Io,
            source: Some(source),
        }
    }

    pub fn serialization(message: impl Into<String>, err: serde_json::Error) -> Self {
        Self {
            message: format!("{}: {}", message.into(), err),
            kind: StoreErrorKind::Serialization,
            source: None,
        }
    }

    pub fn lock(message: impl Into<String>, source: std::io::Error) -> Self {
        Self {
            message: format!("{}: {}", message.into(), source),
            kind: StoreErrorKind::Lock,
            source: Some(source),
        }
    }
}

/// Misuse of the scheduler's completion protocol
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("{0} is not in the operation graph")]
    UnknownOp(OpId),

    #[error("{0} was not handed out by next_ready")]
    NotRunning(OpId),

    #[error("{0} has not failed")]
    NotFailed(OpId),
}

/// A worker could not execute a command
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op_id} failed: {message}")]
pub struct CommandExecutionError {
    pub op_id: OpId,
    pub message: String,
}

/// Errors surfaced by the ledger façade
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Conflict(#[from] BatchConflictError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Execution(#[from] CommandExecutionError),
}
