//! Operation Ledger
//!
//! The single entry point for producers and workers. Producers hand raw
//! batches to `append_batch`, which reduces, validates, persists and only
//! then admits them to the scheduler. Workers pull `Command`s with
//! `next_command` and report back through `on_command_complete`.
//!
//! ## Crash safety
//! A batch is written to the pending-op store before it enters the
//! in-memory graph, so a crash can never leave an admitted operation that is
//! not on disk. `start` replays whatever the store still holds.

pub mod command;
pub mod store;

#[cfg(test)]
mod tests;

pub use command::{Command, CommandBuilder, CommandStatus, DefaultCommandBuilder};
pub use store::{ArchivedOp, JsonOpStore, PendingOpStore};

use crate::config::LedgerConfig;
use crate::diff::DiffResult;
use crate::error::{CommandExecutionError, LedgerError};
use crate::graph::OpGraph;
use crate::node::{Node, NodeCache, NodeKey};
use crate::op::{BatchBuilder, BatchId, OpId, Operation, UidGenerator};
use crate::reducer::{check_batch_shape, validate_admission, BatchGraph, BatchReducer};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Something observable happened to a batch or operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LedgerEvent {
    #[serde(rename_all = "camelCase")]
    BatchAdmitted { batch_id: BatchId, op_ids: Vec<OpId> },
    #[serde(rename_all = "camelCase")]
    OpDiscarded { op_id: OpId },
    #[serde(rename_all = "camelCase")]
    OpCompleted { op_id: OpId, batch_id: BatchId },
    #[serde(rename_all = "camelCase")]
    OpFailed { op_id: OpId, error: String },
    #[serde(rename_all = "camelCase")]
    OpRetried { op_id: OpId },
}

/// What `start` found in the pending-op store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupReport {
    pub batches_resumed: usize,
    pub ops_resumed: usize,
    /// Resumed operations that had failed and wait for `retry`
    pub ops_parked: usize,
    pub ops_cancelled: usize,
}

/// Result of a successful `append_batch`
#[derive(Debug, Clone)]
pub struct AdmittedBatch {
    pub batch_id: BatchId,
    /// Operations now queued, in op id order
    pub ops: Vec<Operation>,
    /// Operations dropped as redundant with already-pending work
    pub discarded: Vec<Operation>,
}

/// Façade over reducer, scheduler, durable store and node cache
pub struct OpLedger {
    config: LedgerConfig,
    graph: OpGraph,
    cache: Arc<dyn NodeCache>,
    store: Arc<dyn PendingOpStore>,
    builder: Arc<dyn CommandBuilder>,
    uids: Arc<UidGenerator>,
    /// Serializes validate → persist → admit across producers
    append_lock: Mutex<()>,
    events: broadcast::Sender<LedgerEvent>,
}

impl OpLedger {
    pub fn new(config: LedgerConfig, cache: Arc<dyn NodeCache>, store: Arc<dyn PendingOpStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            builder: Arc::new(DefaultCommandBuilder::new(config.rm_to_trash)),
            config,
            graph: OpGraph::new(),
            cache,
            store,
            uids: Arc::new(UidGenerator::new()),
            append_lock: Mutex::new(()),
            events,
        }
    }

    /// Ledger backed by a `JsonOpStore` in `config.store_dir`
    pub fn open(config: LedgerConfig, cache: Arc<dyn NodeCache>) -> Self {
        let store = Arc::new(JsonOpStore::with_dir(config.store_dir.clone()));
        Self::new(config, cache, store)
    }

    pub fn with_command_builder(mut self, builder: Arc<dyn CommandBuilder>) -> Self {
        self.builder = builder;
        self
    }

    /// Share an id generator with other producers (e.g. a differ)
    pub fn with_uids(mut self, uids: Arc<UidGenerator>) -> Self {
        self.uids = uids;
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn graph(&self) -> &OpGraph {
        &self.graph
    }

    pub fn uids(&self) -> &Arc<UidGenerator> {
        &self.uids
    }

    /// Start a new batch with ids from this ledger's generator
    pub fn new_batch(&self) -> BatchBuilder<'_> {
        BatchBuilder::new(&self.uids)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LedgerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Resume or cancel whatever the store holds from a previous run.
    ///
    /// Batches are re-admitted in ascending batch id order. Operations that
    /// had failed come back parked and still need `retry`. A batch that can
    /// no longer be admitted is archived as cancelled with the error as the
    /// reason; startup continues with the next one.
    pub fn start(&self) -> Result<StartupReport, LedgerError> {
        let _guard = self.append_lock.lock();
        let pending = self.store.load_pending()?;
        let mut report = StartupReport::default();

        if pending.is_empty() {
            tracing::info!("No pending operations to resume");
            return Ok(report);
        }

        let max_uid = pending
            .iter()
            .map(|op| op.op_id.0.max(op.batch_id.0))
            .max()
            .unwrap_or(0);
        self.uids.ensure_above(max_uid);

        if self.config.cancel_pending_on_startup {
            self.store.archive_cancelled(&pending, "cancelled at startup")?;
            report.ops_cancelled = pending.len();
            tracing::info!(count = pending.len(), "Cancelled pending operations at startup");
            return Ok(report);
        }

        let failed = self.store.load_failed()?;
        let mut batches: BTreeMap<BatchId, Vec<Operation>> = BTreeMap::new();
        for op in pending {
            batches.entry(op.batch_id).or_default().push(op);
        }

        for (batch_id, mut ops) in batches {
            ops.sort_by_key(|op| op.op_id);
            let parked: BTreeSet<OpId> = ops
                .iter()
                .map(|op| op.op_id)
                .filter(|op_id| failed.contains_key(op_id))
                .collect();

            let admitted = BatchGraph::build(ops.clone())
                .map_err(LedgerError::from)
                .and_then(|batch| self.graph.enqueue_resumed(batch, &parked).map_err(LedgerError::from));

            match admitted {
                Ok(discarded) => {
                    self.apply_placeholders(&ops);
                    if !discarded.is_empty() {
                        self.store.delete_pending(&discarded)?;
                    }
                    let parked = parked
                        .iter()
                        .filter(|op_id| !discarded.iter().any(|d| d.op_id == **op_id))
                        .count();
                    report.batches_resumed += 1;
                    report.ops_resumed += ops.len() - discarded.len();
                    report.ops_parked += parked;
                    tracing::info!(batch_id = %batch_id, ops = ops.len(), parked, "Resumed pending batch");
                }
                Err(error) => {
                    tracing::warn!(batch_id = %batch_id, error = %error, "Cancelling batch that cannot be resumed");
                    self.store.archive_cancelled(&ops, &error.to_string())?;
                    report.ops_cancelled += ops.len();
                }
            }
        }

        tracing::info!(
            batches = report.batches_resumed,
            resumed = report.ops_resumed,
            parked = report.ops_parked,
            cancelled = report.ops_cancelled,
            "Startup recovery complete"
        );
        Ok(report)
    }

    /// Reduce, validate, persist and admit one batch.
    ///
    /// Any conflict or admission failure rejects the whole batch before it
    /// touches the store or the cache.
    pub fn append_batch(&self, ops: Vec<Operation>) -> Result<AdmittedBatch, LedgerError> {
        check_batch_shape(&ops)?;
        let batch_id = ops[0].batch_id;

        let _guard = self.append_lock.lock();

        let reduced = BatchReducer::new(self.cache.as_ref()).reduce_and_validate(ops)?;
        let batch = BatchGraph::build(reduced.clone())?;
        validate_admission(&batch, self.cache.as_ref(), &self.graph)?;

        self.store.save_pending(&reduced)?;
        let placeholders = self.apply_placeholders(&reduced);

        let discarded = match self.graph.enqueue(batch) {
            Ok(discarded) => discarded,
            Err(error) => {
                // undo the persist so a restart does not resurrect the batch
                for node in &placeholders {
                    self.cache.remove_node(node, false);
                }
                self.store.delete_pending(&reduced)?;
                return Err(error.into());
            }
        };

        if !discarded.is_empty() {
            self.store.delete_pending(&discarded)?;
            for op in &discarded {
                self.emit(LedgerEvent::OpDiscarded { op_id: op.op_id });
            }
        }

        let ops: Vec<Operation> = reduced
            .into_iter()
            .filter(|op| !discarded.iter().any(|d| d.op_id == op.op_id))
            .collect();

        tracing::info!(batch_id = %batch_id, ops = ops.len(), discarded = discarded.len(), "Admitted batch");
        self.emit(LedgerEvent::BatchAdmitted {
            batch_id,
            op_ids: ops.iter().map(|op| op.op_id).collect(),
        });

        Ok(AdmittedBatch {
            batch_id,
            ops,
            discarded,
        })
    }

    /// Append both sides of a diff, left batch first. Empty sides are skipped.
    pub fn append_diff(&self, diff: DiffResult) -> Result<Vec<AdmittedBatch>, LedgerError> {
        let mut sides: Vec<Vec<Operation>> = [diff.left_ops, diff.right_ops]
            .into_iter()
            .filter(|ops| !ops.is_empty())
            .collect();
        sides.sort_by_key(|ops| ops[0].batch_id);

        sides.into_iter().map(|ops| self.append_batch(ops)).collect()
    }

    /// Insert placeholders for nodes the batch will create, returning them
    fn apply_placeholders(&self, ops: &[Operation]) -> Vec<Node> {
        let mut inserted = Vec::new();
        for node in ops.iter().filter_map(Operation::created_node) {
            if self
                .cache
                .resolve_node(&node.device_id(), &node.node_ref.node_id)
                .is_none()
            {
                let placeholder = node.clone().as_placeholder();
                self.cache.upsert_node(placeholder.clone());
                inserted.push(placeholder);
            }
        }
        inserted
    }

    /// Block until an operation is ready and return it as a command.
    ///
    /// `None` after `shutdown`.
    pub fn next_command(&self) -> Option<Command> {
        self.graph.next_ready().map(|op| self.builder.build(op))
    }

    /// Non-blocking `next_command`
    pub fn try_next_command(&self) -> Option<Command> {
        self.graph.try_next_ready().map(|op| self.builder.build(op))
    }

    /// Record a worker's result.
    ///
    /// A failure parks the operation until `retry`; nothing is retried
    /// automatically. A success applies the command's cache updates,
    /// archives the operation, then releases its queues. If the result
    /// cannot be recorded the operation is parked as well and the error is
    /// returned.
    pub fn on_command_complete(&self, command: &Command) -> Result<(), LedgerError> {
        let op = &command.op;

        match &command.status {
            CommandStatus::Failed(error) => {
                tracing::error!(op = %op, error = %error, "Operation failed; waiting for retry");
                self.park(op, error)
            }
            CommandStatus::Pending => {
                let error = CommandExecutionError {
                    op_id: op.op_id,
                    message: "command reported without a result".to_string(),
                };
                self.park(op, &error.message)?;
                Err(error.into())
            }
            CommandStatus::Completed => {
                for node in &command.upserted {
                    self.cache.upsert_node(node.clone());
                }
                for node in &command.removed {
                    self.cache.remove_node(node, command.to_trash);
                }

                if let Err(error) = self.store.archive_completed(std::slice::from_ref(op)) {
                    tracing::error!(op = %op, error = %error, "Failed to archive completed operation; waiting for retry");
                    self.park(op, &error.to_string())?;
                    return Err(error.into());
                }
                self.graph.complete(op)?;

                tracing::debug!(op = %op, "Operation completed");
                self.emit(LedgerEvent::OpCompleted {
                    op_id: op.op_id,
                    batch_id: op.batch_id,
                });
                Ok(())
            }
        }
    }

    /// Hold a running operation at the head of its queues until `retry`
    fn park(&self, op: &Operation, error: &str) -> Result<(), LedgerError> {
        self.graph.fail(op)?;
        self.emit(LedgerEvent::OpFailed {
            op_id: op.op_id,
            error: error.to_string(),
        });
        self.store.mark_failed(op, error)?;
        Ok(())
    }

    /// Operator signal to re-run a failed operation
    pub fn retry(&self, op_id: OpId) -> Result<(), LedgerError> {
        let op = self.graph.retry(op_id)?;
        self.store.clear_failed(&op)?;
        tracing::info!(op = %op, "Retrying operation");
        self.emit(LedgerEvent::OpRetried { op_id });
        Ok(())
    }

    pub fn last_pending_op_for(&self, target: &NodeKey) -> Option<Operation> {
        self.graph.last_pending_op_for(target)
    }

    pub fn high_water_mark(&self) -> OpId {
        self.graph.high_water_mark()
    }

    /// Number of admitted operations not yet completed
    pub fn pending_count(&self) -> usize {
        self.graph.len()
    }

    /// Stop handing out commands; blocked `next_command` callers return `None`
    pub fn shutdown(&self) {
        tracing::info!(pending = self.graph.len(), "Shutting down ledger");
        self.graph.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.graph.is_shutdown()
    }
}
