//! treesync
//!
//! Reconciles two file trees by content and schedules the resulting file
//! operations safely: a content-first differ proposes operation batches, the
//! reducer rejects contradictory ones, and the ledger persists admitted
//! batches and hands them to workers in per-node FIFO order.

pub mod config;
pub mod diff;
pub mod error;
pub mod execution;
pub mod graph;
pub mod ledger;
pub mod node;
pub mod op;
pub mod reducer;

pub use config::LedgerConfig;
pub use diff::{ContentFirstDiffer, DiffConfig, DiffResult, MovePairing};
pub use error::{
    AdmissionError, BatchConflictError, CommandExecutionError, GraphError, HashUnavailable, LedgerError, StoreError,
};
pub use execution::{CommandExecutor, WorkerPool, WorkerStats};
pub use graph::{OpGraph, OpState};
pub use ledger::{
    AdmittedBatch, Command, CommandBuilder, CommandStatus, DefaultCommandBuilder, JsonOpStore, LedgerEvent, OpLedger,
    PendingOpStore, StartupReport,
};
pub use node::{ContentHash, DeviceId, InMemoryNodeCache, Node, NodeCache, NodeId, NodeKey, NodeRef, NodeType, SubtreeReader};
pub use op::{BatchBuilder, BatchId, OpId, OpKind, Operation, UidGenerator};
pub use reducer::{BatchGraph, BatchReducer};

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`.
///
/// Defaults to warnings for dependencies and info for this crate; use
/// `RUST_LOG=treesync=debug` for per-operation dispatch logs. Calling it
/// again once a subscriber is installed does nothing.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,treesync=info")))
        .try_init();
}
