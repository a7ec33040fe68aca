//! Worker Pool
//!
//! Tokio workers that drain the ledger. Each worker blocks for the next ready
//! command on the blocking pool, runs it through the `CommandExecutor`, and
//! reports the outcome back to the ledger.

use crate::error::CommandExecutionError;
use crate::ledger::{Command, OpLedger};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Performs the provider-side work for a command.
///
/// Implementations may rewrite `command.upserted` / `command.removed` with
/// what the provider actually returned before the ledger applies them.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &mut Command) -> Result<(), CommandExecutionError>;
}

/// Counts reported by one worker (or summed over the pool)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    /// Commands that executed successfully
    pub completed: usize,
    /// Commands the executor reported as failed
    pub failed: usize,
}

impl std::ops::Add for WorkerStats {
    type Output = WorkerStats;

    fn add(self, other: WorkerStats) -> WorkerStats {
        WorkerStats {
            completed: self.completed + other.completed,
            failed: self.failed + other.failed,
        }
    }
}

/// A set of running workers
pub struct WorkerPool {
    ledger: Arc<OpLedger>,
    handles: Vec<JoinHandle<WorkerStats>>,
}

impl WorkerPool {
    /// Spawn `workers` workers (at least one) on the current tokio runtime
    pub fn spawn(ledger: Arc<OpLedger>, executor: Arc<dyn CommandExecutor>, workers: usize) -> Self {
        let workers = workers.max(1);
        tracing::info!(workers, "Starting worker pool");

        let handles = (0..workers)
            .map(|worker| {
                let ledger = Arc::clone(&ledger);
                let executor = Arc::clone(&executor);
                tokio::spawn(run_worker(worker, ledger, executor))
            })
            .collect();

        Self { ledger, handles }
    }

    /// Spawn as many workers as the ledger's config asks for
    pub fn spawn_configured(ledger: Arc<OpLedger>, executor: Arc<dyn CommandExecutor>) -> Self {
        let workers = ledger.config().worker_count;
        Self::spawn(ledger, executor, workers)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Shut the ledger down and wait for every worker to finish its
    /// in-flight command
    pub async fn shutdown(self) -> WorkerStats {
        self.ledger.shutdown();

        let mut total = WorkerStats::default();
        for handle in self.handles {
            match handle.await {
                Ok(stats) => total = total + stats,
                Err(e) => tracing::error!(error = %e, "Worker task panicked"),
            }
        }

        tracing::info!(completed = total.completed, failed = total.failed, "Worker pool stopped");
        total
    }
}

async fn run_worker(worker: usize, ledger: Arc<OpLedger>, executor: Arc<dyn CommandExecutor>) -> WorkerStats {
    let mut stats = WorkerStats::default();

    loop {
        let waiting = Arc::clone(&ledger);
        let mut command = match tokio::task::spawn_blocking(move || waiting.next_command()).await {
            Ok(Some(command)) => command,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(worker, error = %e, "Failed to wait for next command");
                break;
            }
        };

        tracing::debug!(worker, operation = %command.op, "Executing operation");

        match executor.execute(&mut command).await {
            Ok(()) => {
                command.mark_completed();
                stats.completed += 1;
            }
            Err(e) => {
                command.mark_failed(e.message);
                stats.failed += 1;
            }
        }

        // the ledger parks the op when it cannot record the result
        if let Err(e) = ledger.on_command_complete(&command) {
            tracing::error!(worker, op_id = %command.op.op_id, error = %e, "Failed to record command result; waiting for retry");
        }
    }

    tracing::debug!(worker, completed = stats.completed, failed = stats.failed, "Worker exiting");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::graph::OpState;
    use crate::ledger::{JsonOpStore, LedgerEvent};
    use crate::node::{DeviceId, InMemoryNodeCache, Node, NodeCache, NodeId, NodeRef};
    use crate::op::{OpId, OpKind};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Records executed ops; fails any op id listed in `fail_once` the first time
    #[derive(Default)]
    struct RecordingExecutor {
        executed: Mutex<Vec<OpId>>,
        fail_once: Mutex<HashSet<OpId>>,
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn execute(&self, command: &mut Command) -> Result<(), CommandExecutionError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let op_id = command.op.op_id;
            if self.fail_once.lock().remove(&op_id) {
                return Err(CommandExecutionError {
                    op_id,
                    message: "provider unavailable".to_string(),
                });
            }
            self.executed.lock().push(op_id);
            Ok(())
        }
    }

    fn ledger(dir: &std::path::Path) -> (DeviceId, Arc<InMemoryNodeCache>, Arc<OpLedger>) {
        let device = DeviceId::new();
        let root = Node::directory(NodeRef::new(device, NodeId::new("root"), "/"));
        let cache = Arc::new(InMemoryNodeCache::with_nodes([root]));
        for name in ["a", "b", "c"] {
            cache.upsert_node(
                Node::file(NodeRef::new(device, NodeId::new(name), format!("/{}", name))).with_parent(NodeId::new("root")),
            );
        }
        let store = Arc::new(JsonOpStore::with_dir(dir));
        let ledger = OpLedger::new(LedgerConfig::default().with_store_dir(dir), cache.clone(), store);
        (device, cache, Arc::new(ledger))
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_drains_ledger() {
        let dir = tempdir().unwrap();
        let (device, cache, ledger) = ledger(dir.path());
        let executor = Arc::new(RecordingExecutor::default());
        let pool = WorkerPool::spawn(ledger.clone(), executor.clone(), 3);
        assert_eq!(pool.len(), 3);

        let mut batch = ledger.new_batch();
        for name in ["a", "b", "c"] {
            batch.rm(cache.resolve_node(&device, &NodeId::new(name)).unwrap());
        }
        ledger.append_batch(batch.build()).unwrap();

        wait_until(|| ledger.pending_count() == 0).await;
        let stats = pool.shutdown().await;

        assert_eq!(stats, WorkerStats { completed: 3, failed: 0 });
        assert_eq!(executor.executed.lock().len(), 3);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_command_waits_for_retry() {
        let dir = tempdir().unwrap();
        let (device, cache, ledger) = ledger(dir.path());
        let mut events = ledger.subscribe();

        let a = cache.resolve_node(&device, &NodeId::new("a")).unwrap();
        let b = cache.resolve_node(&device, &NodeId::new("b")).unwrap();
        let mut batch = ledger.new_batch();
        let up = batch.transfer(OpKind::Up, b, a).unwrap();
        ledger.append_batch(batch.build()).unwrap();

        let executor = Arc::new(RecordingExecutor::default());
        executor.fail_once.lock().insert(up);
        let pool = WorkerPool::spawn(ledger.clone(), executor.clone(), 2);

        wait_until(|| ledger.graph().state_of(up) == Some(OpState::Failed)).await;
        assert!(executor.executed.lock().is_empty());

        ledger.retry(up).unwrap();
        wait_until(|| ledger.pending_count() == 0).await;
        let stats = pool.shutdown().await;

        assert_eq!(stats, WorkerStats { completed: 1, failed: 1 });
        let seen: Vec<LedgerEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(seen.iter().any(|e| matches!(e, LedgerEvent::OpFailed { op_id, .. } if *op_id == up)));
        assert!(seen.contains(&LedgerEvent::OpRetried { op_id: up }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unrecorded_completion_waits_for_retry() {
        let dir = tempdir().unwrap();
        let (device, cache, ledger) = ledger(dir.path());

        let a = cache.resolve_node(&device, &NodeId::new("a")).unwrap();
        let b = cache.resolve_node(&device, &NodeId::new("b")).unwrap();
        let mut batch = ledger.new_batch();
        let up = batch.transfer(OpKind::Up, b, a.clone()).unwrap();
        ledger.append_batch(batch.build()).unwrap();
        let mut batch = ledger.new_batch();
        let rm = batch.rm(a);
        ledger.append_batch(batch.build()).unwrap();

        // a directory where the completed archive belongs makes archiving fail
        let archive = dir.path().join("completed.jsonl");
        std::fs::create_dir(&archive).unwrap();

        let executor = Arc::new(RecordingExecutor::default());
        let pool = WorkerPool::spawn(ledger.clone(), executor.clone(), 2);

        wait_until(|| ledger.graph().state_of(up) == Some(OpState::Failed)).await;
        assert_eq!(ledger.graph().state_of(rm), Some(OpState::Queued));

        std::fs::remove_dir(&archive).unwrap();
        ledger.retry(up).unwrap();
        wait_until(|| ledger.pending_count() == 0).await;
        let stats = pool.shutdown().await;

        assert_eq!(stats.completed, 3);
        assert_eq!(*executor.executed.lock(), vec![up, up, rm]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_with_idle_workers() {
        let dir = tempdir().unwrap();
        let (_device, _cache, ledger) = ledger(dir.path());
        let pool = WorkerPool::spawn(ledger.clone(), Arc::new(RecordingExecutor::default()), 0);
        assert_eq!(pool.len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.shutdown().await, WorkerStats::default());
        assert!(ledger.is_shutdown());
    }
}
