// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Reconciliation
//!
//! [`merge_remote`] folds a diverged copy of a program (for example one edited offline, or on
//! another database) into the local tree. Both copies must share the program key.
//!
//! Reconciliation never fails because the two copies disagree. Everything it cannot settle on its
//! own is recorded on the affected nodes as [`ConflictNote`]s or as a
//! [`DataObjectConflict`](crate::DataObjectConflict), and the merged tree stays fully usable. The
//! returned [`MergeReport`] lists what happened.
//!
//! The decisions are driven by the version vectors of both sides:
//!
//! - **Payloads** of nodes both sides hold: the side whose version dominates wins. Concurrent edits
//!   that produced different payloads keep the local payload and preserve the remote one as a
//!   [`Perspective::Remote`](crate::Perspective::Remote) data-object conflict.
//! - **Placement** follows the remote copy, unless the local side edited both parents involved
//!   since. Moves leave a [`ConflictNote::Moved`] on the former parent.
//! - **Nodes only the remote holds** are created. If the local side deleted them, they stay
//!   deleted unless the remote edited them since, in which case they come back with a
//!   [`ConflictNote::ResurrectedLocalDelete`].
//! - **Nodes only the local side holds** stay, unless the remote has seen and deleted them. Those
//!   are removed if the local side did not edit them since, and re-created with new keys
//!   ([`ConflictNote::ReplacedRemoteDelete`]) if it did.
//!
//! A [`MergePolicy`] may refuse creations, updates and deletions, which is recorded as the
//! corresponding permission note. Remote nodes whose parent could not be materialized end up in
//! the program's conflict folder. A program holds one conflict folder, so the contents of a remote
//! folder are folded into the local one.
use crate::{
    DataObject,
    blob::DataObjectBlob,
    conflicts::{ConflictNote, DataObjectConflict},
    error::{Result, TreeError},
    factory::Factory,
    key::NodeKey,
    node::{Node, NodeKind},
    tree::ProgramTree,
    version::VersionVector,
};
use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
};

/// Decides which remote changes the local side accepts.
///
/// All methods allow by default.
#[expect(unused_variables)]
pub trait MergePolicy<D> {
    /// May `node` be created under `parent`?
    fn can_create(&self, tree: &ProgramTree<D>, parent: NodeKey, node: &Node<D>) -> bool {
        true
    }

    /// May the payload of `node` be replaced by `incoming`?
    fn can_update(&self, tree: &ProgramTree<D>, node: NodeKey, incoming: &D) -> bool {
        true
    }

    /// May `node` and its subtree be removed?
    fn can_delete(&self, tree: &ProgramTree<D>, node: NodeKey) -> bool {
        true
    }
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl<D> MergePolicy<D> for AllowAll {}

/// What [`merge_remote`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Nodes whose payload was taken from the remote.
    pub updated: Vec<NodeKey>,
    /// Nodes that got a conflict note or data-object conflict.
    pub conflicted: Vec<NodeKey>,
    /// Remote nodes created locally.
    pub created: Vec<NodeKey>,
    /// Locally deleted subtrees brought back, by root.
    pub resurrected: Vec<NodeKey>,
    /// Remotely deleted but locally edited subtrees, as `(old root, new root)`.
    pub replaced: Vec<(NodeKey, NodeKey)>,
    /// Local subtrees removed because the remote deleted them, by root.
    pub removed: Vec<NodeKey>,
    /// Nodes placed under a different parent.
    pub moved: Vec<NodeKey>,
}

impl MergeReport {
    /// Returns true if nothing needs a human to look at it.
    pub fn is_clean(&self) -> bool {
        self.conflicted.is_empty()
    }
}

/// Reconciles `remote` into `local`.
///
/// `factory` must know the local program; it creates the conflict folder and the replacements of
/// remotely deleted nodes.
///
/// The program write lock is held for the duration of the merge. The calling thread must not hold
/// the program read lock (for example while walking [`ProgramTree::observations`]): read locks
/// cannot be upgraded, so the merge would wait on itself forever. Holding the write lock is fine.
///
/// Errors for mismatched programs, a factory that does not know the program, or a tree that
/// violates its own invariants. The first two are detected before anything changes.
pub fn merge_remote<D: DataObject>(
    factory: &Factory<D>,
    local: &mut ProgramTree<D>,
    remote: &ProgramTree<D>,
    policy: &dyn MergePolicy<D>,
) -> Result<MergeReport> {
    if local.program_key() != remote.program_key() {
        return Err(TreeError::ProgramMismatch {
            local: local.program_key(),
            remote: remote.program_key(),
        });
    }
    if !factory.knows_program(local.program_key()) {
        return Err(TreeError::UnknownProgram(local.program_key()));
    }
    let _guard = local.program_write_guard();
    tracing::debug!(program = ?local.program_key(), "merging remote copy");

    let before = local.versions().map(|(k, vv)| (k, vv.clone())).collect();
    let local_attached = local.subtree(local.root());
    let remote_attached = remote.subtree(remote.root());

    let mut merge = Merge {
        factory,
        remote,
        policy,
        before,
        local_attached: local_attached.iter().copied().collect(),
        remote_attached: remote_attached.iter().copied().collect(),
        touched: HashSet::new(),
        materialized: HashSet::new(),
        refused: HashSet::new(),
        revive: HashSet::new(),
        folded: HashMap::new(),
        pending: Vec::new(),
        report: MergeReport::default(),
        local,
    };

    merge.payloads(&remote_attached)?;
    merge.structure(&remote_attached)?;
    merge.local_only(&local_attached)?;
    merge.settle_pending()?;
    merge.order_children(&remote_attached)?;
    merge.settle_versions();

    let Merge { mut report, .. } = merge;
    report.conflicted.sort();
    report.conflicted.dedup();
    tracing::debug!(?report, "merged remote copy");
    Ok(report)
}

/// A placement that waits for a single slot to free up.
struct Pending {
    node: NodeKey,
    parent: NodeKey,
    /// Current parent, for moves.
    from: Option<NodeKey>,
}

struct Merge<'a, D> {
    factory: &'a Factory<D>,
    local: &'a mut ProgramTree<D>,
    remote: &'a ProgramTree<D>,
    policy: &'a dyn MergePolicy<D>,
    /// Local versions as they were before the merge.
    before: HashMap<NodeKey, VersionVector>,
    local_attached: HashSet<NodeKey>,
    remote_attached: HashSet<NodeKey>,
    /// Nodes the merge itself edited, beyond adopting remote state.
    touched: HashSet<NodeKey>,
    /// Remote nodes created or brought back.
    materialized: HashSet<NodeKey>,
    /// Remote nodes that could not be materialized.
    refused: HashSet<NodeKey>,
    /// Remote nodes brought back with a resurrected ancestor.
    revive: HashSet<NodeKey>,
    /// Remote conflict folders, mapped to the local folder that takes their contents.
    folded: HashMap<NodeKey, NodeKey>,
    pending: Vec<Pending>,
    report: MergeReport,
}

impl<D: DataObject> Merge<'_, D> {
    fn before(&self, key: NodeKey) -> VersionVector {
        self.before.get(&key).cloned().unwrap_or_default()
    }

    fn remote_version(&self, key: NodeKey) -> VersionVector {
        self.remote.version(key).cloned().unwrap_or_default()
    }

    /// The local side edited `key` since the remote last saw it.
    fn local_newer(&self, key: NodeKey) -> bool {
        self.before(key).dominates(&self.remote_version(key))
    }

    /// The remote edited something in its subtree at `key` the local side has not seen.
    fn remote_edited(&self, key: NodeKey) -> bool {
        self.remote.subtree(key).into_iter().any(|n| {
            self.before
                .get(&n)
                .is_none_or(|lv| !lv.covers(&self.remote_version(n)))
        })
    }

    /// The local side edited something in its subtree at `key` the remote has not seen.
    fn local_edited(&self, key: NodeKey) -> bool {
        self.local.subtree(key).into_iter().any(|n| {
            self.remote
                .version(n)
                .is_none_or(|rv| !rv.covers(&self.before(n)))
        })
    }

    fn note(&mut self, key: NodeKey, note: ConflictNote) -> Result<()> {
        tracing::debug!(?key, %note, "conflict");
        self.local.add_conflict_note(key, note)?;
        self.touched.insert(key);
        self.report.conflicted.push(key);
        Ok(())
    }

    fn conflict_folder(&mut self) -> Result<NodeKey> {
        if let Some(folder) = self.local.conflict_folder() {
            return Ok(folder);
        }
        let folder = self.factory.create_conflict_folder(self.local, None)?;
        self.local.set_conflict_folder(Some(folder))?;
        self.touched.insert(self.local.root());
        self.note(folder, ConflictNote::ConflictFolder { node: folder })?;
        Ok(folder)
    }

    /// Takes back a materialized subtree that could not be placed. Its nodes count as never seen.
    fn drop_materialized(&mut self, key: NodeKey) {
        let keys = self.local.subtree(key);
        self.local.evict(key);
        self.refused.insert(key);
        for k in keys {
            self.materialized.remove(&k);
            self.report.created.retain(|c| *c != k);
            self.report.resurrected.retain(|c| *c != k);
            self.report.conflicted.retain(|c| *c != k);
            match self.before.get(&k) {
                Some(vv) => self.local.set_version(k, vv.clone()),
                None => self.local.forget_version(k),
            }
        }
    }

    /// Where remote children of `parent` go locally.
    fn local_parent(&self, parent: NodeKey) -> NodeKey {
        self.folded.get(&parent).copied().unwrap_or(parent)
    }

    /// Maps a remote conflict folder onto the local one, if the local side already has its own.
    fn fold_conflict_folder(&mut self, key: NodeKey) -> bool {
        if self.local_attached.contains(&key)
            || self.remote.kind_of(key) != Some(NodeKind::ConflictFolder)
        {
            return false;
        }
        match self.local.conflict_folder() {
            Some(folder) if folder != key => {
                tracing::debug!(remote = ?key, local = ?folder, "folding remote conflict folder");
                self.folded.insert(key, folder);
                true
            }
            _ => false,
        }
    }

    /// True if `parent` has no room for another child of `kind`.
    fn slot_taken(&self, parent: NodeKey, kind: NodeKind) -> bool {
        self.local
            .kind_of(parent)
            .is_some_and(|pk| pk.single_slot(kind))
            && !self.local.children_of_kind(parent, kind).is_empty()
    }

    // Payloads

    fn payloads(&mut self, remote_attached: &[NodeKey]) -> Result<()> {
        for &key in remote_attached {
            if !self.local_attached.contains(&key) {
                continue;
            }
            let (lv, rv) = (self.before(key), self.remote_version(key));
            let ordering = lv.partial_cmp(&rv);
            if matches!(ordering, Some(Ordering::Equal | Ordering::Greater)) {
                continue;
            }

            let remote_tree = self.remote;
            let remote = remote_tree.get(key)?;
            let local = self.local.get(key)?;
            let same = DataObjectBlob::same(Some(local.data_object()), Some(remote.data_object()));
            let mut conflicts = local.conflicts().merge_from(remote.conflicts());

            if ordering.is_some() {
                // remote dominates
                if !same {
                    if self.policy.can_update(self.local, key, remote.data_object()) {
                        tracing::debug!(?key, "taking remote payload");
                        self.local.set_data_object(key, remote.data_object().clone())?;
                        self.report.updated.push(key);
                    } else {
                        conflicts = conflicts
                            .with_conflict_note(ConflictNote::UpdatePermissionFail { node: key });
                        self.touched.insert(key);
                        self.report.conflicted.push(key);
                    }
                }
                self.local
                    .replace_client_data(key, remote.client_data.clone())?;
            } else if !same {
                tracing::debug!(?key, "concurrent payload edits");
                conflicts = conflicts
                    .with_data_object_conflict(DataObjectConflict::remote(remote.data_object().clone()));
                self.touched.insert(key);
                self.report.conflicted.push(key);
            }

            if !(conflicts.is_empty() && self.local.conflicts(key)?.is_empty()) {
                self.local.set_conflicts(key, conflicts)?;
            }
        }
        Ok(())
    }

    // Structure

    fn structure(&mut self, remote_attached: &[NodeKey]) -> Result<()> {
        for &key in remote_attached {
            let Some(parent) = self.remote.parent(key) else {
                continue;
            };
            if self.fold_conflict_folder(key) {
                continue;
            }
            let parent = self.local_parent(parent);
            if self.local_attached.contains(&key) {
                self.follow_move(key, parent)?;
            } else {
                self.materialize(key, parent)?;
            }
        }
        Ok(())
    }

    /// `key` is attached on both sides; place it where the remote has it.
    fn follow_move(&mut self, key: NodeKey, parent: NodeKey) -> Result<()> {
        let from = self.local.parent(key);
        if from == Some(parent) || !self.local.is_attached(parent) {
            return Ok(());
        }
        if let Some(from) = from {
            if self.local_newer(from) && self.local_newer(parent) {
                tracing::debug!(?key, "keeping local placement");
                return Ok(());
            }
        }
        if parent == key || self.local.ancestors(parent).any(|a| a == key) {
            return self.note(parent, ConflictNote::ConstraintViolation { node: parent });
        }
        let kind = self.local.get(key)?.kind();
        if self.slot_taken(parent, kind) {
            self.pending.push(Pending {
                node: key,
                parent,
                from,
            });
            return Ok(());
        }
        self.apply_move(key, parent, from)
    }

    fn apply_move(&mut self, key: NodeKey, parent: NodeKey, from: Option<NodeKey>) -> Result<()> {
        if let Some(from) = from {
            self.local.remove_child(from, key)?;
            self.note(from, ConflictNote::Moved { node: key, to: parent })?;
        }
        tracing::debug!(?key, ?parent, "following remote move");
        self.local.add_child(parent, key)?;
        self.report.moved.push(key);
        Ok(())
    }

    /// `key` is attached remotely only; create it, bring it back, or leave it deleted.
    fn materialize(&mut self, key: NodeKey, parent: NodeKey) -> Result<()> {
        let revived = self.revive.contains(&key);
        let seen = self.before.contains_key(&key);
        let resurrect = !revived && seen && self.remote_edited(key);
        if seen && !revived && !resurrect {
            tracing::debug!(?key, "staying deleted");
            return Ok(());
        }

        let remote_tree = self.remote;
        let remote = remote_tree.get(key)?;
        let target = if self.local.is_attached(parent) || self.materialized.contains(&parent) {
            parent
        } else if self.refused.contains(&parent) {
            if !NodeKind::ConflictFolder.accepts(remote.kind()) {
                self.refused.insert(key);
                return Ok(());
            }
            self.conflict_folder()?
        } else {
            return Ok(());
        };

        if !self.policy.can_create(self.local, target, remote) {
            self.refused.insert(key);
            return self.note(target, ConflictNote::CreatePermissionFail { node: target });
        }

        if self.local.contains(key) {
            // a stale copy of a local delete
            self.local.evict(key);
        }
        let mut node = Node::new(
            key,
            self.local.program_key(),
            self.factory.origin(),
            remote.component_type().clone(),
            remote.data_object().clone(),
        );
        node.conflicts = remote.conflicts().clone();
        node.client_data = remote.client_data.clone();
        self.local.insert_node(node, self.remote_version(key))?;
        self.materialized.insert(key);

        if resurrect {
            tracing::debug!(?key, "resurrecting local delete");
            self.revive.extend(self.remote.descendants(key));
            self.note(key, ConflictNote::ResurrectedLocalDelete { node: key })?;
            self.report.resurrected.push(key);
        } else if !revived {
            self.report.created.push(key);
        }

        if self.slot_taken(target, remote.kind()) {
            self.pending.push(Pending {
                node: key,
                parent: target,
                from: None,
            });
            return Ok(());
        }
        self.place(key, target)
    }

    /// Places a materialized node, or records why it cannot be placed.
    fn place(&mut self, key: NodeKey, parent: NodeKey) -> Result<()> {
        match self.local.add_child(parent, key) {
            Ok(()) => Ok(()),
            Err(
                TreeError::InvalidChild { .. }
                | TreeError::SlotOccupied { .. }
                | TreeError::WouldCycle { .. }
                | TreeError::NotLocal(_),
            ) => {
                tracing::debug!(?key, ?parent, "cannot place remote node");
                self.drop_materialized(key);
                self.note(parent, ConflictNote::ConstraintViolation { node: parent })
            }
            Err(err) => Err(err),
        }
    }

    // Local-only nodes

    fn local_only(&mut self, local_attached: &[NodeKey]) -> Result<()> {
        let mut handled = HashSet::new();
        let mut replace = Vec::new();
        for &key in local_attached {
            if handled.contains(&key)
                || self.remote_attached.contains(&key)
                || !self.remote.has_seen(key)
            {
                continue;
            }
            let Some(parent) = self.local.parent(key) else {
                continue;
            };
            handled.extend(self.local.subtree(key));

            if self.local_edited(key) {
                replace.push((key, parent));
            } else if self.policy.can_delete(self.local, key) {
                tracing::debug!(?key, "following remote delete");
                self.local.remove_child(parent, key)?;
                self.local.discard(key)?;
                self.report.removed.push(key);
            } else {
                self.note(key, ConflictNote::DeletePermissionFail { node: key })?;
            }
        }

        for (key, parent) in replace {
            let kind = self.local.get(key)?.kind();
            let index = self
                .local
                .children_of_kind(parent, kind)
                .iter()
                .position(|c| *c == key)
                .unwrap_or(usize::MAX);
            tracing::debug!(?key, "replacing remotely deleted subtree");
            let copy = self.factory.duplicate_subtree(self.local, key)?;
            self.local.remove_child(parent, key)?;
            self.local.discard(key)?;
            self.local.insert_child(parent, index, copy)?;
            self.note(copy, ConflictNote::ReplacedRemoteDelete { node: key })?;
            self.report.replaced.push((key, copy));
        }
        Ok(())
    }

    fn settle_pending(&mut self) -> Result<()> {
        for Pending { node, parent, from } in std::mem::take(&mut self.pending) {
            let kind = self.local.get(node)?.kind();
            if !self.slot_taken(parent, kind) {
                match from {
                    Some(_) => self.apply_move(node, parent, from)?,
                    None => self.place(node, parent)?,
                }
                continue;
            }
            if from.is_none() {
                self.drop_materialized(node);
            }
            self.note(parent, ConflictNote::ConstraintViolation { node: parent })?;
        }
        Ok(())
    }

    /// Adopts the remote child order where only the remote edited the parent.
    fn order_children(&mut self, remote_attached: &[NodeKey]) -> Result<()> {
        for &parent in remote_attached {
            if !self.local.is_attached(parent)
                || self.materialized.contains(&parent)
                || self.remote_version(parent).partial_cmp(&self.before(parent))
                    != Some(Ordering::Greater)
            {
                continue;
            }
            let mut kinds: Vec<_> = self
                .local
                .children(parent)
                .iter()
                .filter_map(|&c| self.local.kind_of(c))
                .collect();
            kinds.sort();
            kinds.dedup();
            for kind in kinds {
                let current = self.local.children_of_kind(parent, kind);
                let mut wanted: Vec<_> = self
                    .remote
                    .children_of_kind(parent, kind)
                    .into_iter()
                    .filter(|c| current.contains(c))
                    .collect();
                wanted.extend(current.iter().filter(|c| !wanted.contains(c)).copied().collect::<Vec<_>>());
                if wanted != current {
                    self.local.set_children(parent, kind, wanted)?;
                }
            }
        }
        Ok(())
    }

    /// Every node the remote knows ends up with the join of both histories. Nodes the merge had
    /// to edit on its own keep their new local edits on top. Remote nodes that did not make it in
    /// stay unseen, so a later merge offers them again.
    fn settle_versions(&mut self) {
        for (key, remote) in self.remote.versions() {
            if !self.local.contains(key) && !self.before.contains_key(&key) {
                continue;
            }
            let base = if self.touched.contains(&key) {
                self.local.version(key).cloned().unwrap_or_default()
            } else {
                self.before(key)
            };
            self.local.set_version(key, base.joined(remote));
        }
    }
}
