//! Content-first differ
//!
//! Matches files across two subtrees by content hash first and by relative
//! path second. Same-hash files at different paths are paired up as moves
//! using the configured `MovePairing`; this pairing is a heuristic and makes
//! no claim about which file "really" moved.

use super::index::TreeIndex;
use super::{DiffConfig, DiffResult};
use crate::node::{ContentHash, Node, NodeId, NodeRef, SubtreeReader};
use crate::op::{BatchBuilder, OpKind, Operation, UidGenerator};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Computes the operations that reconcile two subtrees
pub struct ContentFirstDiffer<'a> {
    left: &'a dyn SubtreeReader,
    right: &'a dyn SubtreeReader,
    uids: &'a UidGenerator,
    config: DiffConfig,
}

impl<'a> ContentFirstDiffer<'a> {
    pub fn new(
        left: &'a dyn SubtreeReader,
        right: &'a dyn SubtreeReader,
        uids: &'a UidGenerator,
    ) -> Self {
        Self {
            left,
            right,
            uids,
            config: DiffConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DiffConfig) -> Self {
        self.config = config;
        self
    }

    /// Diff the subtrees under `left_root` and `right_root`.
    ///
    /// `left_ops` land on the left tree, `right_ops` on the right; each list is
    /// a separate batch.
    pub fn diff(&self, left_root: &Node, right_root: &Node, compare_paths_also: bool) -> DiffResult {
        let left = TreeIndex::build(self.left, left_root);
        let right = TreeIndex::build(self.right, right_root);

        tracing::debug!(
            left_hashes = left.by_hash.len(),
            right_hashes = right.by_hash.len(),
            compare_paths_also,
            "Diffing subtrees"
        );

        let mut left_plan = SidePlan::new(&left);
        let mut right_plan = SidePlan::new(&right);
        let mut left_orphans: Vec<Node> = Vec::new();
        let mut right_orphans: Vec<Node> = Vec::new();

        let hashes: BTreeSet<&ContentHash> = left.by_hash.keys().chain(right.by_hash.keys()).collect();

        for hash in hashes {
            match (left.by_hash.get(hash), right.by_hash.get(hash)) {
                (Some(l), None) => left_orphans.extend(l.iter().cloned()),
                (None, Some(r)) => right_orphans.extend(r.iter().cloned()),
                (Some(_), Some(_)) if !compare_paths_also => {}
                (Some(l), Some(r)) => {
                    let left_paths: HashSet<PathBuf> = l.iter().map(|n| left.relative_path_of(n)).collect();
                    let right_paths: HashSet<PathBuf> = r.iter().map(|n| right.relative_path_of(n)).collect();

                    let l_rem: Vec<&Node> = l
                        .iter()
                        .filter(|n| !right_paths.contains(&left.relative_path_of(n)))
                        .collect();
                    let r_rem: Vec<&Node> = r
                        .iter()
                        .filter(|n| !left_paths.contains(&right.relative_path_of(n)))
                        .collect();

                    let l_rem = self.config.move_pairing.order(l_rem);
                    let r_rem = self.config.move_pairing.order(r_rem);
                    let paired = l_rem.len().min(r_rem.len());

                    for (ln, rn) in l_rem.iter().zip(r_rem.iter()) {
                        let left_rel = left.relative_path_of(ln);
                        let right_rel = right.relative_path_of(rn);
                        left_plan.transfer_to(OpKind::Mv, ln, &right_rel);
                        right_plan.transfer_to(OpKind::Mv, rn, &left_rel);
                    }

                    left_orphans.extend(l_rem[paired..].iter().map(|n| (*n).clone()));
                    right_orphans.extend(r_rem[paired..].iter().map(|n| (*n).clone()));
                }
                (None, None) => {}
            }
        }

        let mut updated: HashSet<PathBuf> = HashSet::new();

        for orphan in &left_orphans {
            let rel = left.relative_path_of(orphan);
            if compare_paths_also {
                if let Some(occupant) = update_candidate(&right, &rel, orphan) {
                    // Direction cannot be inferred, so offer both
                    left_plan.update(occupant, orphan);
                    right_plan.update(orphan, occupant);
                    updated.insert(rel);
                    continue;
                }
            }
            if right_plan.transfer_to(OpKind::Cp, orphan, &rel) {
                left_plan.removed.push(orphan.node_ref.clone());
            }
        }

        for orphan in &right_orphans {
            let rel = right.relative_path_of(orphan);
            if updated.contains(&rel) {
                continue;
            }
            if compare_paths_also {
                if let Some(occupant) = update_candidate(&left, &rel, orphan) {
                    left_plan.update(orphan, occupant);
                    right_plan.update(occupant, orphan);
                    continue;
                }
            }
            if left_plan.transfer_to(OpKind::Cp, orphan, &rel) {
                right_plan.removed.push(orphan.node_ref.clone());
            }
        }

        let mut skipped = left.skipped.clone();
        skipped.extend(right.skipped.iter().cloned());

        let left_removed = std::mem::take(&mut left_plan.removed);
        let right_removed = std::mem::take(&mut right_plan.removed);
        let left_ops = left_plan.into_batch(self.uids);
        let right_ops = right_plan.into_batch(self.uids);

        tracing::info!(
            left_ops = left_ops.len(),
            right_ops = right_ops.len(),
            skipped = skipped.len(),
            "Diff complete"
        );

        DiffResult {
            left_ops,
            right_ops,
            left_removed,
            right_removed,
            skipped,
        }
    }
}

/// The file at `rel` on `side` whose content differs from `orphan`, if any
fn update_candidate<'i>(side: &'i TreeIndex, rel: &Path, orphan: &Node) -> Option<&'i Node> {
    let occupant = side.first_at(rel)?;
    if occupant.is_directory() || side.unhashable.contains(rel) {
        return None;
    }
    (occupant.content_hash != orphan.content_hash).then_some(occupant)
}

/// Operations collected for one side before ids are assigned
struct SidePlan<'i> {
    index: &'i TreeIndex,
    planned_dirs: HashMap<PathBuf, Node>,
    planned_dsts: HashSet<PathBuf>,
    mkdirs: Vec<Node>,
    transfers: Vec<(OpKind, Node, Node)>,
    removed: Vec<NodeRef>,
}

impl<'i> SidePlan<'i> {
    fn new(index: &'i TreeIndex) -> Self {
        Self {
            index,
            planned_dirs: HashMap::new(),
            planned_dsts: HashSet::new(),
            mkdirs: Vec::new(),
            transfers: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// Plan a CP or MV of `src` to `rel` on this side. Falls back to the
    /// `_ONTO` kind when `rel` is already occupied by a file.
    fn transfer_to(&mut self, kind: OpKind, src: &Node, rel: &Path) -> bool {
        if !self.planned_dsts.insert(rel.to_path_buf()) {
            tracing::warn!(path = %rel.display(), "Destination already planned; keeping first match");
            return false;
        }

        if self.index.unhashable.contains(rel) {
            tracing::warn!(path = %rel.display(), "Destination holds a file without content hash; skipping");
            return false;
        }

        if let Some(occupant) = self.index.first_at(rel) {
            if occupant.is_directory() {
                tracing::warn!(path = %rel.display(), "Destination is a directory; skipping");
                return false;
            }
            let onto = match kind {
                OpKind::Mv => OpKind::MvOnto,
                _ => OpKind::CpOnto,
            };
            self.transfers.push((onto, src.clone(), occupant.clone()));
            return true;
        }

        let Some(parent_id) = rel.parent().and_then(|parent| self.ensure_dir(parent)) else {
            tracing::warn!(path = %rel.display(), "No directory can hold destination; skipping");
            return false;
        };

        let mut dst = Node::new(
            NodeRef::new(
                self.index.root.device_id(),
                NodeId::generate(),
                self.index.absolute_path(rel),
            ),
            src.node_type,
        )
        .with_parent(parent_id)
        .with_size(src.size)
        .as_placeholder();
        dst.content_hash = src.content_hash.clone();

        self.transfers.push((kind, src.clone(), dst));
        true
    }

    fn update(&mut self, src: &Node, dst: &Node) {
        self.transfers.push((OpKind::Up, src.clone(), dst.clone()));
    }

    /// Id of the directory at `rel`, planning MKDIRs for missing ancestors
    fn ensure_dir(&mut self, rel: &Path) -> Option<NodeId> {
        if rel.as_os_str().is_empty() {
            return Some(self.index.root.node_ref.node_id.clone());
        }
        if let Some(existing) = self.index.first_at(rel) {
            return existing.is_directory().then(|| existing.node_ref.node_id.clone());
        }
        if let Some(planned) = self.planned_dirs.get(rel) {
            return Some(planned.node_ref.node_id.clone());
        }

        let parent_id = self.ensure_dir(rel.parent()?)?;
        let dir = Node::directory(NodeRef::new(
            self.index.root.device_id(),
            NodeId::generate(),
            self.index.absolute_path(rel),
        ))
        .with_parent(parent_id)
        .as_placeholder();

        let id = dir.node_ref.node_id.clone();
        self.mkdirs.push(dir.clone());
        self.planned_dirs.insert(rel.to_path_buf(), dir);
        Some(id)
    }

    /// Assign ids: directories first (parents before children), then transfers
    fn into_batch(self, uids: &UidGenerator) -> Vec<Operation> {
        if self.mkdirs.is_empty() && self.transfers.is_empty() {
            return Vec::new();
        }

        let mut batch = BatchBuilder::new(uids);
        for dir in self.mkdirs {
            batch.mkdir(dir);
        }
        for (kind, src, dst) in self.transfers {
            if let Err(err) = batch.transfer(kind, src, dst) {
                tracing::error!(error = %err, "Dropping malformed diff operation");
            }
        }
        batch.build()
    }
}
