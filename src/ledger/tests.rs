//! Ledger scenario tests
//!
//! End-to-end flows through append, dispatch, completion, failure and
//! restart, backed by a real `JsonOpStore` in a temp directory.

use super::*;
use crate::diff::ContentFirstDiffer;
use crate::error::{AdmissionError, StoreError};
use crate::graph::OpState;
use crate::node::{ContentHash, DeviceId, InMemoryNodeCache, NodeId, NodeRef};
use crate::op::OpKind;
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::{tempdir, TempDir};

struct Harness {
    dir: TempDir,
    device: DeviceId,
    cache: Arc<InMemoryNodeCache>,
    store: Arc<JsonOpStore>,
    ledger: OpLedger,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|config| config)
    }

    fn with_config(adjust: impl FnOnce(LedgerConfig) -> LedgerConfig) -> Self {
        let dir = tempdir().unwrap();
        let device = DeviceId::new();
        let cache = Arc::new(base_cache(device));
        let store = Arc::new(JsonOpStore::with_dir(dir.path()));
        let config = adjust(LedgerConfig::default().with_store_dir(dir.path()));
        let ledger = OpLedger::new(config, cache.clone(), store.clone());
        Self {
            dir,
            device,
            cache,
            store,
            ledger,
        }
    }

    /// A second ledger over the same store, as after a process restart
    fn restart(&self, adjust: impl FnOnce(LedgerConfig) -> LedgerConfig) -> (Arc<InMemoryNodeCache>, OpLedger) {
        let cache = Arc::new(base_cache(self.device));
        let config = adjust(LedgerConfig::default().with_store_dir(self.dir.path()));
        let ledger = OpLedger::open(config, cache.clone());
        (cache, ledger)
    }

    fn node(&self, id: &str) -> Node {
        self.cache.resolve_node(&self.device, &NodeId::new(id)).unwrap()
    }

    fn new_file(&self, id: &str, path: &str) -> Node {
        Node::file(NodeRef::new(self.device, NodeId::new(id), path))
            .with_parent(NodeId::new("root"))
            .as_placeholder()
    }
}

fn base_cache(device: DeviceId) -> InMemoryNodeCache {
    let root = Node::directory(NodeRef::new(device, NodeId::new("root"), "/"));
    let f = Node::file(NodeRef::new(device, NodeId::new("f"), "/f.txt"))
        .with_parent(NodeId::new("root"))
        .with_hash(ContentHash::new("h-f"));
    let g = Node::file(NodeRef::new(device, NodeId::new("g"), "/g.txt"))
        .with_parent(NodeId::new("root"))
        .with_hash(ContentHash::new("h-g"));
    InMemoryNodeCache::with_nodes([root, f, g])
}

fn complete(ledger: &OpLedger) -> Command {
    let mut command = ledger.try_next_command().unwrap();
    command.mark_completed();
    ledger.on_command_complete(&command).unwrap();
    command
}

#[test]
fn test_copy_runs_to_completion() {
    let h = Harness::new();
    let mut events = h.ledger.subscribe();

    let mut batch = h.ledger.new_batch();
    let dst = h.new_file("copy", "/copy.txt");
    let op_id = batch.transfer(OpKind::Cp, h.node("f"), dst.clone()).unwrap();
    let admitted = h.ledger.append_batch(batch.build()).unwrap();
    assert_eq!(admitted.ops.len(), 1);

    // persisted and placeholder in place before anything runs
    assert_eq!(h.store.load_pending().unwrap().len(), 1);
    assert!(!h.cache.resolve_node(&h.device, &NodeId::new("copy")).unwrap().is_live);

    let command = complete(&h.ledger);
    assert_eq!(command.op.op_id, op_id);

    let copied = h.cache.resolve_node(&h.device, &NodeId::new("copy")).unwrap();
    assert!(copied.is_live);
    assert_eq!(copied.content_hash, Some(ContentHash::new("h-f")));
    assert!(h.store.load_pending().unwrap().is_empty());
    assert_eq!(h.store.completed().unwrap().len(), 1);
    assert_eq!(h.ledger.pending_count(), 0);

    assert!(matches!(events.try_recv().unwrap(), LedgerEvent::BatchAdmitted { .. }));
    assert_eq!(
        events.try_recv().unwrap(),
        LedgerEvent::OpCompleted {
            op_id,
            batch_id: admitted.batch_id
        }
    );
}

#[test]
fn test_conflicting_batch_leaves_no_trace() {
    let h = Harness::new();
    let x = Node::directory(NodeRef::new(h.device, NodeId::new("x"), "/x"))
        .with_parent(NodeId::new("root"))
        .as_placeholder();

    let mut batch = h.ledger.new_batch();
    let mkdir = batch.mkdir(x.clone());
    let rm = batch.rm(x);

    let err = h.ledger.append_batch(batch.build()).unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, LedgerError::Conflict(_)));
    assert!(message.contains(&mkdir.to_string()));
    assert!(message.contains(&rm.to_string()));

    assert!(h.store.load_pending().unwrap().is_empty());
    assert!(h.cache.resolve_node(&h.device, &NodeId::new("x")).is_none());
    assert_eq!(h.ledger.pending_count(), 0);
}

#[test]
fn test_unknown_target_is_refused() {
    let h = Harness::new();
    let mut batch = h.ledger.new_batch();
    batch.rm(Node::file(NodeRef::new(h.device, NodeId::new("ghost"), "/ghost")));

    let err = h.ledger.append_batch(batch.build()).unwrap_err();
    assert!(matches!(err, LedgerError::Admission(AdmissionError::MissingTarget { .. })));
    assert!(h.store.load_pending().unwrap().is_empty());
}

#[test]
fn test_redundant_batch_is_discarded_and_purged() {
    let h = Harness::new();
    let mut events = h.ledger.subscribe();

    let mut first = h.ledger.new_batch();
    first.rm(h.node("g"));
    h.ledger.append_batch(first.build()).unwrap();

    let mut second = h.ledger.new_batch();
    let dup = second.rm(h.node("g"));
    let admitted = h.ledger.append_batch(second.build()).unwrap();

    assert!(admitted.ops.is_empty());
    assert_eq!(admitted.discarded.len(), 1);
    assert_eq!(h.store.load_pending().unwrap().len(), 1);
    assert_eq!(h.ledger.pending_count(), 1);

    let seen: Vec<LedgerEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert!(seen.contains(&LedgerEvent::OpDiscarded { op_id: dup }));
}

#[test]
fn test_failure_halts_target_until_retry() {
    let h = Harness::new();
    let mut batch = h.ledger.new_batch();
    let up = batch.transfer(OpKind::Up, h.node("g"), h.node("f")).unwrap();
    h.ledger.append_batch(batch.build()).unwrap();
    let mut batch = h.ledger.new_batch();
    let rm = batch.rm(h.node("f"));
    h.ledger.append_batch(batch.build()).unwrap();

    let mut command = h.ledger.try_next_command().unwrap();
    assert_eq!(command.op.op_id, up);
    command.mark_failed("provider timeout");
    h.ledger.on_command_complete(&command).unwrap();

    assert_eq!(h.ledger.graph().state_of(up), Some(OpState::Failed));
    assert!(h.ledger.try_next_command().is_none());
    // failed work stays durable
    assert_eq!(h.store.load_pending().unwrap().len(), 2);

    h.ledger.retry(up).unwrap();
    assert_eq!(complete(&h.ledger).op.op_id, up);
    assert_eq!(complete(&h.ledger).op.op_id, rm);

    assert!(h.cache.resolve_node(&h.device, &NodeId::new("f")).is_none());
    assert_eq!(h.cache.trashed().len(), 1);
}

/// JSON store whose completed archive refuses the first `failures` writes
struct FlakyArchive {
    inner: JsonOpStore,
    failures: Mutex<usize>,
}

impl PendingOpStore for FlakyArchive {
    fn load_pending(&self) -> Result<Vec<Operation>, StoreError> {
        self.inner.load_pending()
    }

    fn save_pending(&self, ops: &[Operation]) -> Result<(), StoreError> {
        self.inner.save_pending(ops)
    }

    fn archive_completed(&self, ops: &[Operation]) -> Result<(), StoreError> {
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(StoreError::io(
                "Failed to append archive",
                std::io::Error::new(std::io::ErrorKind::Other, "device busy"),
            ));
        }
        self.inner.archive_completed(ops)
    }

    fn delete_pending(&self, ops: &[Operation]) -> Result<(), StoreError> {
        self.inner.delete_pending(ops)
    }

    fn archive_cancelled(&self, ops: &[Operation], reason: &str) -> Result<(), StoreError> {
        self.inner.archive_cancelled(ops, reason)
    }

    fn mark_failed(&self, op: &Operation, error: &str) -> Result<(), StoreError> {
        self.inner.mark_failed(op, error)
    }

    fn clear_failed(&self, op: &Operation) -> Result<(), StoreError> {
        self.inner.clear_failed(op)
    }

    fn load_failed(&self) -> Result<BTreeMap<OpId, String>, StoreError> {
        self.inner.load_failed()
    }
}

#[test]
fn test_unrecorded_completion_parks_op_for_retry() {
    let dir = tempdir().unwrap();
    let device = DeviceId::new();
    let cache = Arc::new(base_cache(device));
    let store = Arc::new(FlakyArchive {
        inner: JsonOpStore::with_dir(dir.path()),
        failures: Mutex::new(1),
    });
    let ledger = OpLedger::new(LedgerConfig::default().with_store_dir(dir.path()), cache.clone(), store.clone());
    let node = |id: &str| cache.resolve_node(&device, &NodeId::new(id)).unwrap();

    let mut batch = ledger.new_batch();
    let up = batch.transfer(OpKind::Up, node("g"), node("f")).unwrap();
    ledger.append_batch(batch.build()).unwrap();
    let mut batch = ledger.new_batch();
    let rm = batch.rm(node("f"));
    ledger.append_batch(batch.build()).unwrap();

    let mut command = ledger.try_next_command().unwrap();
    assert_eq!(command.op.op_id, up);
    command.mark_completed();
    let err = ledger.on_command_complete(&command).unwrap_err();
    assert!(matches!(err, LedgerError::Store(_)));

    assert_eq!(ledger.graph().state_of(up), Some(OpState::Failed));
    assert_eq!(ledger.graph().state_of(rm), Some(OpState::Queued));
    assert!(ledger.try_next_command().is_none());
    assert!(store.load_failed().unwrap().contains_key(&up));

    ledger.retry(up).unwrap();
    assert!(store.load_failed().unwrap().is_empty());
    assert_eq!(complete(&ledger).op.op_id, up);
    assert_eq!(complete(&ledger).op.op_id, rm);
    assert_eq!(ledger.pending_count(), 0);
    assert!(store.load_pending().unwrap().is_empty());
}

#[test]
fn test_reporting_pending_command_is_an_error() {
    let h = Harness::new();
    let mut batch = h.ledger.new_batch();
    batch.rm(h.node("g"));
    h.ledger.append_batch(batch.build()).unwrap();

    let command = h.ledger.try_next_command().unwrap();
    let err = h.ledger.on_command_complete(&command).unwrap_err();
    assert!(matches!(err, LedgerError::Execution(_)));
    assert_eq!(h.ledger.graph().state_of(command.op.op_id), Some(OpState::Failed));
    h.ledger.retry(command.op.op_id).unwrap();
    assert_eq!(complete(&h.ledger).op.op_id, command.op.op_id);
}

#[test]
fn test_restart_resumes_pending_batches() {
    let h = Harness::new();
    let mut batch = h.ledger.new_batch();
    let mkdir = batch.mkdir(
        Node::directory(NodeRef::new(h.device, NodeId::new("d"), "/d"))
            .with_parent(NodeId::new("root"))
            .as_placeholder(),
    );
    batch
        .transfer(
            OpKind::Cp,
            h.node("f"),
            Node::file(NodeRef::new(h.device, NodeId::new("c"), "/d/f.txt"))
                .with_parent(NodeId::new("d"))
                .as_placeholder(),
        )
        .unwrap();
    h.ledger.append_batch(batch.build()).unwrap();
    let last_uid = h.ledger.uids().peek();

    let (cache, ledger) = h.restart(|config| config);
    let report = ledger.start().unwrap();
    assert_eq!(
        report,
        StartupReport {
            batches_resumed: 1,
            ops_resumed: 2,
            ops_parked: 0,
            ops_cancelled: 0
        }
    );
    assert!(ledger.uids().peek() >= last_uid);
    assert!(cache.resolve_node(&h.device, &NodeId::new("d")).is_some());

    assert_eq!(complete(&ledger).op.op_id, mkdir);
    assert_eq!(complete(&ledger).op.kind, OpKind::Cp);
    assert!(ledger.try_next_command().is_none());
}

#[test]
fn test_restart_keeps_failed_op_parked() {
    let h = Harness::new();
    let mut batch = h.ledger.new_batch();
    let up = batch.transfer(OpKind::Up, h.node("g"), h.node("f")).unwrap();
    h.ledger.append_batch(batch.build()).unwrap();
    let mut batch = h.ledger.new_batch();
    let rm = batch.rm(h.node("f"));
    h.ledger.append_batch(batch.build()).unwrap();

    let mut command = h.ledger.try_next_command().unwrap();
    command.mark_failed("provider timeout");
    h.ledger.on_command_complete(&command).unwrap();

    let (_cache, ledger) = h.restart(|config| config);
    let report = ledger.start().unwrap();
    assert_eq!(report.ops_resumed, 2);
    assert_eq!(report.ops_parked, 1);

    assert_eq!(ledger.graph().state_of(up), Some(OpState::Failed));
    assert!(ledger.try_next_command().is_none());

    ledger.retry(up).unwrap();
    assert!(h.store.load_failed().unwrap().is_empty());
    assert_eq!(complete(&ledger).op.op_id, up);
    assert_eq!(complete(&ledger).op.op_id, rm);
}

#[test]
fn test_restart_can_cancel_pending_work() {
    let h = Harness::new();
    let mut batch = h.ledger.new_batch();
    batch.rm(h.node("g"));
    h.ledger.append_batch(batch.build()).unwrap();

    let (_cache, ledger) = h.restart(|mut config| {
        config.cancel_pending_on_startup = true;
        config
    });
    let report = ledger.start().unwrap();

    assert_eq!(report.ops_cancelled, 1);
    assert_eq!(ledger.pending_count(), 0);
    assert!(h.store.load_pending().unwrap().is_empty());
    assert_eq!(h.store.cancelled().unwrap()[0].reason.as_deref(), Some("cancelled at startup"));
}

#[test]
fn test_restart_cancels_batch_that_fails_replay_guard() {
    let h = Harness::new();
    let rm = |op_id: u64, batch_id: u64, id: &str| {
        Operation::new(OpId(op_id), BatchId(batch_id), OpKind::Rm, h.node(id), None).unwrap()
    };
    // batch 10 carries larger op ids than batch 11
    h.store.save_pending(&[rm(20, 10, "f")]).unwrap();
    h.store.save_pending(&[rm(15, 11, "g")]).unwrap();

    let (_cache, ledger) = h.restart(|config| config);
    let report = ledger.start().unwrap();

    assert_eq!(report.batches_resumed, 1);
    assert_eq!(report.ops_cancelled, 1);
    assert_eq!(ledger.high_water_mark(), OpId(20));
    assert!(ledger.uids().peek() > 20);

    let cancelled = h.store.cancelled().unwrap();
    assert_eq!(cancelled[0].op.op_id, OpId(15));
    assert!(cancelled[0].reason.as_deref().unwrap_or_default().contains("stale batch"));
}

#[test]
fn test_shutdown_unblocks_next_command() {
    let h = Harness::new();
    std::thread::scope(|s| {
        let worker = s.spawn(|| h.ledger.next_command());
        std::thread::sleep(std::time::Duration::from_millis(50));
        h.ledger.shutdown();
        assert!(worker.join().unwrap().is_none());
    });
    assert!(h.ledger.is_shutdown());
}

#[test]
fn test_diff_output_is_admitted_and_executed() {
    let h = Harness::new();
    let other = DeviceId::new();
    let right_root = Node::directory(NodeRef::new(other, NodeId::new("R"), "/mirror"));
    h.cache.upsert_node(right_root.clone());
    let left_root = h.node("root");

    let diff = ContentFirstDiffer::new(&*h.cache, &*h.cache, h.ledger.uids()).diff(
        &left_root,
        &right_root,
        false,
    );
    assert_eq!(diff.right_ops.len(), 2);

    let admitted = h.ledger.append_diff(diff).unwrap();
    assert_eq!(admitted.len(), 1);

    complete(&h.ledger);
    complete(&h.ledger);
    assert_eq!(h.ledger.pending_count(), 0);

    let mirrored = h.cache.resolve_node(&other, &NodeId::new("R")).unwrap();
    let copies: Vec<Node> = crate::node::SubtreeReader::children_of(&*h.cache, &mirrored);
    let paths: Vec<&Path> = copies.iter().map(Node::path).collect();
    assert_eq!(paths, vec![Path::new("/mirror/f.txt"), Path::new("/mirror/g.txt")]);
    assert!(copies.iter().all(|node| node.is_live));
}
