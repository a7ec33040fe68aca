//! Durable Pending-Operation Store
//!
//! Operations are persisted before they are admitted to the scheduler and
//! removed once they complete or are cancelled. `JsonOpStore` keeps one JSON
//! file per batch in `~/.config/treesync/ops/` plus two JSON-lines archives.
//! A failed operation stays in its batch file with a failure mark, so it is
//! resumed parked after a restart.
//!
//! ## Concurrency Safety
//! Every read-modify-write holds an fs2 exclusive lock on `ops.lock`, so
//! several workers completing operations of the same batch cannot lose
//! each other's updates.

use crate::error::StoreError;
use crate::op::{BatchId, OpId, Operation};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const BATCH_SUFFIX: &str = ".batch.json";
const COMPLETED_LOG: &str = "completed.jsonl";
const CANCELLED_LOG: &str = "cancelled.jsonl";

/// Durable storage for admitted-but-unfinished operations
pub trait PendingOpStore: Send + Sync {
    /// Every persisted pending operation, in op id order
    fn load_pending(&self) -> Result<Vec<Operation>, StoreError>;

    /// Persist operations; must be durable when this returns `Ok`
    fn save_pending(&self, ops: &[Operation]) -> Result<(), StoreError>;

    /// Move finished operations out of the pending set into the completed archive
    fn archive_completed(&self, ops: &[Operation]) -> Result<(), StoreError>;

    /// Drop operations from the pending set without archiving them
    fn delete_pending(&self, ops: &[Operation]) -> Result<(), StoreError>;

    /// Move operations into the cancelled archive, recording why
    fn archive_cancelled(&self, ops: &[Operation], reason: &str) -> Result<(), StoreError>;

    /// Mark a pending operation as failed; it stays pending
    fn mark_failed(&self, op: &Operation, error: &str) -> Result<(), StoreError>;

    /// Drop the failure mark after an operator retry
    fn clear_failed(&self, op: &Operation) -> Result<(), StoreError>;

    /// Failure marks of pending operations, with the recorded error
    fn load_failed(&self) -> Result<BTreeMap<OpId, String>, StoreError>;
}

/// On-disk representation of one pending batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchFile {
    batch_id: BatchId,
    saved_at: DateTime<Utc>,
    ops: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    failed: Vec<FailureMark>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailureMark {
    op_id: OpId,
    error: String,
    failed_at: DateTime<Utc>,
}

/// One line of an archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedOp {
    pub op: Operation,
    pub archived_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// JSON file store
pub struct JsonOpStore {
    dir: PathBuf,
}

impl JsonOpStore {
    /// Store rooted at the default directory
    pub fn new() -> Self {
        Self {
            dir: Self::default_dir(),
        }
    }

    /// Store rooted at `dir` (tests, embedders with their own data dir)
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.config/treesync/ops/`
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("treesync")
            .join("ops")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Completed archive, oldest first
    pub fn completed(&self) -> Result<Vec<ArchivedOp>, StoreError> {
        self.read_archive(COMPLETED_LOG)
    }

    /// Cancelled archive, oldest first
    pub fn cancelled(&self) -> Result<Vec<ArchivedOp>, StoreError> {
        self.read_archive(CANCELLED_LOG)
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::io("Failed to create store directory", e))
    }

    fn batch_path(&self, batch_id: BatchId) -> PathBuf {
        self.dir.join(format!("{}{}", batch_id.0, BATCH_SUFFIX))
    }

    /// Exclusive store lock; released when the returned handle drops
    fn acquire_lock(&self) -> Result<File, StoreError> {
        self.ensure_dir()?;

        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join("ops.lock"))
            .map_err(|e| StoreError::io("Failed to open lock file", e))?;

        lock_file
            .lock_exclusive()
            .map_err(|e| StoreError::lock("Failed to acquire store lock", e))?;

        Ok(lock_file)
    }

    fn read_batch(&self, batch_id: BatchId) -> Result<Option<BatchFile>, StoreError> {
        let path = self.batch_path(batch_id);
        if !path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&path).map_err(|e| StoreError::io("Failed to read batch file", e))?;
        let batch = serde_json::from_str(&json).map_err(|e| StoreError::serialization("Failed to parse batch file", e))?;
        Ok(Some(batch))
    }

    /// Write atomically via a temp file and rename
    fn write_batch(&self, batch: &BatchFile) -> Result<(), StoreError> {
        let path = self.batch_path(batch.batch_id);
        let temp_path = self.dir.join(format!("{}.batch.tmp", batch.batch_id.0));

        let json = serde_json::to_string_pretty(batch)
            .map_err(|e| StoreError::serialization("Failed to serialize batch", e))?;

        fs::write(&temp_path, &json).map_err(|e| StoreError::io("Failed to write batch temp file", e))?;
        fs::rename(&temp_path, &path).map_err(|e| StoreError::io("Failed to rename batch file", e))?;

        Ok(())
    }

    /// Remove `ops` from their batch files, deleting files that become empty.
    /// Caller holds the lock.
    fn remove_locked(&self, ops: &[Operation]) -> Result<(), StoreError> {
        for (batch_id, ids) in group_ids(ops) {
            let Some(mut batch) = self.read_batch(batch_id)? else {
                continue;
            };

            batch.ops.retain(|op| !ids.contains(&op.op_id));
            batch.failed.retain(|mark| !ids.contains(&mark.op_id));
            if batch.ops.is_empty() {
                fs::remove_file(self.batch_path(batch_id))
                    .map_err(|e| StoreError::io("Failed to delete batch file", e))?;
                tracing::debug!(batch_id = %batch_id, "Removed drained batch file");
            } else {
                batch.saved_at = Utc::now();
                self.write_batch(&batch)?;
            }
        }
        Ok(())
    }

    fn append_archive(&self, name: &str, ops: &[Operation], reason: Option<&str>) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(name))
            .map_err(|e| StoreError::io("Failed to open archive", e))?;

        let archived_at = Utc::now();
        for op in ops {
            let record = ArchivedOp {
                op: op.clone(),
                archived_at,
                reason: reason.map(str::to_string),
            };
            let line = serde_json::to_string(&record)
                .map_err(|e| StoreError::serialization("Failed to serialize archive record", e))?;
            writeln!(file, "{}", line).map_err(|e| StoreError::io("Failed to append archive", e))?;
        }
        file.sync_data().map_err(|e| StoreError::io("Failed to sync archive", e))?;

        Ok(())
    }

    /// Every readable batch file; unreadable ones are skipped with a warning
    fn load_batches(&self) -> Result<Vec<BatchFile>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let _lock = self.acquire_lock()?;
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::io("Failed to read store directory", e))?;

        let mut batches = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(BATCH_SUFFIX))
                .unwrap_or(false)
            {
                continue;
            }

            match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|json| serde_json::from_str::<BatchFile>(&json).map_err(|e| e.to_string()))
            {
                Ok(batch) => batches.push(batch),
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "Skipping unreadable batch file");
                }
            }
        }
        Ok(batches)
    }

    fn read_archive(&self, name: &str) -> Result<Vec<ArchivedOp>, StoreError> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path).map_err(|e| StoreError::io("Failed to open archive", e))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| StoreError::io("Failed to read archive", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line)
                .map_err(|e| StoreError::serialization("Failed to parse archive record", e))?;
            records.push(record);
        }
        Ok(records)
    }
}

impl Default for JsonOpStore {
    fn default() -> Self {
        Self::new()
    }
}

fn group_ids(ops: &[Operation]) -> BTreeMap<BatchId, HashSet<OpId>> {
    let mut grouped: BTreeMap<BatchId, HashSet<OpId>> = BTreeMap::new();
    for op in ops {
        grouped.entry(op.batch_id).or_default().insert(op.op_id);
    }
    grouped
}

impl PendingOpStore for JsonOpStore {
    fn load_pending(&self) -> Result<Vec<Operation>, StoreError> {
        let mut ops: Vec<Operation> = self.load_batches()?.into_iter().flat_map(|batch| batch.ops).collect();
        ops.sort_by_key(|op| op.op_id);
        tracing::info!(count = ops.len(), dir = %self.dir.display(), "Loaded pending operations");
        Ok(ops)
    }

    fn save_pending(&self, ops: &[Operation]) -> Result<(), StoreError> {
        let _lock = self.acquire_lock()?;

        let mut grouped: BTreeMap<BatchId, Vec<&Operation>> = BTreeMap::new();
        for op in ops {
            grouped.entry(op.batch_id).or_default().push(op);
        }

        for (batch_id, batch_ops) in grouped {
            let mut batch = self.read_batch(batch_id)?.unwrap_or_else(|| BatchFile {
                batch_id,
                saved_at: Utc::now(),
                ops: Vec::new(),
                failed: Vec::new(),
            });

            for op in batch_ops {
                match batch.ops.iter_mut().find(|existing| existing.op_id == op.op_id) {
                    Some(existing) => *existing = op.clone(),
                    None => batch.ops.push(op.clone()),
                }
            }
            batch.ops.sort_by_key(|op| op.op_id);
            batch.saved_at = Utc::now();
            self.write_batch(&batch)?;

            tracing::debug!(batch_id = %batch_id, ops = batch.ops.len(), "Saved pending batch");
        }

        Ok(())
    }

    fn archive_completed(&self, ops: &[Operation]) -> Result<(), StoreError> {
        let _lock = self.acquire_lock()?;
        self.append_archive(COMPLETED_LOG, ops, None)?;
        self.remove_locked(ops)
    }

    fn delete_pending(&self, ops: &[Operation]) -> Result<(), StoreError> {
        let _lock = self.acquire_lock()?;
        self.remove_locked(ops)
    }

    fn archive_cancelled(&self, ops: &[Operation], reason: &str) -> Result<(), StoreError> {
        let _lock = self.acquire_lock()?;
        self.append_archive(CANCELLED_LOG, ops, Some(reason))?;
        self.remove_locked(ops)?;
        tracing::info!(count = ops.len(), reason, "Cancelled pending operations");
        Ok(())
    }

    fn mark_failed(&self, op: &Operation, error: &str) -> Result<(), StoreError> {
        let _lock = self.acquire_lock()?;
        let Some(mut batch) = self.read_batch(op.batch_id)? else {
            tracing::warn!(op = %op, "Cannot mark an operation that is not persisted");
            return Ok(());
        };

        batch.failed.retain(|mark| mark.op_id != op.op_id);
        batch.failed.push(FailureMark {
            op_id: op.op_id,
            error: error.to_string(),
            failed_at: Utc::now(),
        });
        batch.saved_at = Utc::now();
        self.write_batch(&batch)
    }

    fn clear_failed(&self, op: &Operation) -> Result<(), StoreError> {
        let _lock = self.acquire_lock()?;
        let Some(mut batch) = self.read_batch(op.batch_id)? else {
            return Ok(());
        };

        let before = batch.failed.len();
        batch.failed.retain(|mark| mark.op_id != op.op_id);
        if batch.failed.len() == before {
            return Ok(());
        }
        batch.saved_at = Utc::now();
        self.write_batch(&batch)
    }

    fn load_failed(&self) -> Result<BTreeMap<OpId, String>, StoreError> {
        Ok(self
            .load_batches()?
            .into_iter()
            .flat_map(|batch| batch.failed)
            .map(|mark| (mark.op_id, mark.error))
            .collect())
    }
}
