// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Program Trees
//!
//! A [`ProgramTree`] is an arena of [`Node`]s addressed by [`NodeKey`]. Parent/child links are
//! stored as keys, so whole trees can be copied, compared and reconciled without worrying about
//! aliasing or reference cycles.
//!
//! ## Invariants
//!
//! - The root is the program node; its key is the program key of every node in the arena.
//! - A node has at most one parent, and is listed exactly once among that parent's children.
//! - Child kinds follow [`NodeKind::accepts`](crate::NodeKind::accepts).
//! - Only nodes created by this tree's process ([`ProgramTree::is_local`]) can be placed.
//!
//! Nodes created by the [`Factory`](crate::Factory) start out detached. Removing a child detaches
//! its subtree, which may then be placed elsewhere or dropped with [`ProgramTree::discard`].
//!
//! ## Versions
//!
//! Every mutation of a node increments the node's [`VersionVector`] entry for the tree's
//! [`LifespanId`]. Structural edits count as mutations of the parent. The version of a removed
//! node is kept, so that reconciliation can tell a node deleted here from one never seen here.
//!
//! ## Locking
//!
//! The tree itself is an ordinary value: `&mut` access already rules out data races. The program
//! lock coordinates the logical program across threads and across the tree's same-key copies
//! (for example a staging copy that is edited on the side and swapped in when it validates). It
//! is always taken on the program key, never on a single node, because most invariants span the
//! whole tree. Locking is advisory; see [`crate::locks`].
use crate::{
    DataObject, create_map,
    conflicts::{ConflictNote, Conflicts, DataObjectConflict},
    error::{Result, TreeError},
    event::{
        CLIENT_DATA_PREFIX, CONFLICTS_PROP, ChangeListener, ChangeValue, ClientValue,
        DATA_OBJECT_PROP, EVENTS_ACTIVATED, ListenerId, Listeners, PropertyChange, Scope,
        TRANSIENT_CLIENT_DATA_PREFIX,
    },
    iter::ObservationIter,
    key::{LifespanId, NodeKey, ProcessId, ProgramId},
    locks::{NodeKeyLocks, ReadGuard, WriteGuard},
    node::{Node, NodeKind},
    version::VersionVector,
};
use std::{borrow::Cow, collections::HashMap, fmt, sync::Arc};

/// Client data name reserved for the payload.
const RESERVED_CLIENT_DATA: &str = "DataObject";

type Map<K, V> = HashMap<K, V, ahash::RandomState>;

/// A program and every node created for it.
pub struct ProgramTree<D> {
    root: NodeKey,
    lifespan_id: LifespanId,
    origin: ProcessId,
    nodes: Map<NodeKey, Node<D>>,
    versions: Map<NodeKey, VersionVector>,
    locks: Arc<NodeKeyLocks>,
    listeners: Map<NodeKey, Listeners<D>>,
    next_listener: u64,
    sending_events: bool,
}

impl<D: DataObject> fmt::Debug for ProgramTree<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes: Vec<_> = self
            .subtree(self.root)
            .into_iter()
            .filter_map(|k| self.nodes.get(&k))
            .collect();
        f.debug_struct("ProgramTree")
            .field("root", &self.root)
            .field("lifespan_id", &self.lifespan_id)
            .field("nodes", &nodes)
            .finish_non_exhaustive()
    }
}

impl<D: DataObject> ProgramTree<D> {
    pub(crate) fn new(root: Node<D>, lifespan_id: LifespanId, locks: Arc<NodeKeyLocks>) -> Self {
        let mut tree = Self {
            root: root.key,
            lifespan_id,
            origin: root.origin,
            nodes: create_map(),
            versions: create_map(),
            locks,
            listeners: create_map(),
            next_listener: 0,
            sending_events: true,
        };
        let key = root.key;
        tree.nodes.insert(key, root);
        tree.bump(key);
        tree
    }

    pub fn root(&self) -> NodeKey {
        self.root
    }

    /// Same as [`ProgramTree::root`]: a program is identified by its root's key.
    pub fn program_key(&self) -> NodeKey {
        self.root
    }

    pub fn program_id(&self) -> Option<&ProgramId> {
        self.nodes.get(&self.root).and_then(Node::program_id)
    }

    pub fn lifespan_id(&self) -> LifespanId {
        self.lifespan_id
    }

    /// The process this tree lives in.
    pub fn origin(&self) -> ProcessId {
        self.origin
    }

    pub fn node(&self, key: NodeKey) -> Option<&Node<D>> {
        self.nodes.get(&key)
    }

    pub fn get(&self, key: NodeKey) -> Result<&Node<D>> {
        self.nodes.get(&key).ok_or(TreeError::UnknownNode(key))
    }

    fn node_mut(&mut self, key: NodeKey) -> Result<&mut Node<D>> {
        self.nodes.get_mut(&key).ok_or(TreeError::UnknownNode(key))
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.nodes.contains_key(&key)
    }

    /// Number of nodes held, attached or not.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn parent(&self, key: NodeKey) -> Option<NodeKey> {
        self.nodes.get(&key).and_then(Node::parent)
    }

    pub fn children(&self, key: NodeKey) -> &[NodeKey] {
        self.nodes.get(&key).map(Node::children).unwrap_or_default()
    }

    pub fn children_of_kind(&self, key: NodeKey, kind: NodeKind) -> Vec<NodeKey> {
        self.children(key)
            .iter()
            .copied()
            .filter(|&c| self.kind_of(c) == Some(kind))
            .collect()
    }

    pub fn kind_of(&self, key: NodeKey) -> Option<NodeKind> {
        self.nodes.get(&key).map(Node::kind)
    }

    /// Parent, grandparent, and so on up to the root.
    pub fn ancestors(&self, key: NodeKey) -> impl Iterator<Item = NodeKey> + '_ {
        std::iter::successors(self.parent(key), move |&k| self.parent(k))
    }

    /// `key` followed by all of its descendants, depth first, children in order.
    pub fn subtree(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut out = Vec::new();
        let mut stack = vec![key];
        while let Some(k) = stack.pop() {
            let Some(node) = self.nodes.get(&k) else {
                continue;
            };
            out.push(k);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// All descendants of `key`, depth first, children in order.
    pub fn descendants(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut all = self.subtree(key);
        if !all.is_empty() {
            all.remove(0);
        }
        all
    }

    /// Returns true if `key` is reachable from the root.
    pub fn is_attached(&self, key: NodeKey) -> bool {
        self.contains(key) && (key == self.root || self.ancestors(key).any(|a| a == self.root))
    }

    /// Returns true if `key` was created in this tree's process.
    pub fn is_local(&self, key: NodeKey) -> bool {
        self.nodes.get(&key).is_some_and(|n| n.origin == self.origin)
    }

    pub fn version(&self, key: NodeKey) -> Option<&VersionVector> {
        self.versions.get(&key)
    }

    /// Returns true if this tree has ever held `key`, including nodes since removed.
    pub fn has_seen(&self, key: NodeKey) -> bool {
        self.versions.contains_key(&key)
    }

    /// Lazily walks every observation under `key`.
    pub fn observations(&self, key: NodeKey) -> ObservationIter<'_, D> {
        ObservationIter::new(self, key)
    }

    /// One line per attached node, indented by depth, for logs and snapshots.
    pub fn outline(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![(self.root, 0usize)];
        while let Some((k, depth)) = stack.pop() {
            let Some(node) = self.nodes.get(&k) else {
                continue;
            };
            out.push_str(&"  ".repeat(depth));
            out.push_str(&node.component_type.name);
            if node.has_conflicts() {
                out.push_str(" !");
            }
            out.push('\n');
            stack.extend(node.children.iter().rev().map(|&c| (c, depth + 1)));
        }
        out
    }

    fn bump(&mut self, key: NodeKey) {
        self.versions
            .entry(key)
            .or_default()
            .increment(self.lifespan_id);
    }

    // Structure

    fn check_local(&self, key: NodeKey) -> Result<&Node<D>> {
        let node = self.get(key)?;
        if node.origin != self.origin {
            return Err(TreeError::NotLocal(key));
        }
        Ok(node)
    }

    /// Validates placing `child` under `parent`. `child` may already sit under `parent`.
    fn check_placeable(&self, parent: NodeKey, child: NodeKey) -> Result<()> {
        let p = self.check_local(parent)?;
        let c = self.check_local(child)?;
        if c.is_root() || c.parent.is_some_and(|cp| cp != parent) {
            return Err(TreeError::AlreadyPlaced(child));
        }
        if !p.kind().accepts(c.kind()) {
            return Err(TreeError::InvalidChild {
                parent: p.kind(),
                child: c.kind(),
            });
        }
        if parent == child || self.ancestors(parent).any(|a| a == child) {
            return Err(TreeError::WouldCycle { parent, child });
        }
        Ok(())
    }

    /// Appends `child` to `parent`'s children.
    pub fn add_child(&mut self, parent: NodeKey, child: NodeKey) -> Result<()> {
        self.insert_child(parent, usize::MAX, child)
    }

    /// Places `child` under `parent` at `index` among the children of the same kind. Indices past
    /// the end append.
    pub fn insert_child(&mut self, parent: NodeKey, index: usize, child: NodeKey) -> Result<()> {
        self.check_local(parent)?;
        self.check_local(child)?;
        if self.parent(child).is_some() {
            // check_placeable tolerates re-placing under the same parent; adding does not
            return Err(TreeError::AlreadyPlaced(child));
        }
        self.check_placeable(parent, child)?;
        let kind = self.get(child)?.kind();
        let parent_kind = self.get(parent)?.kind();
        let old = self.children_of_kind(parent, kind);
        if parent_kind.single_slot(kind) && !old.is_empty() {
            return Err(TreeError::SlotOccupied {
                parent,
                child: kind,
            });
        }

        let children = self.children(parent);
        let position = match old.get(index) {
            Some(at) => children.iter().position(|c| c == at),
            None => old
                .last()
                .and_then(|last| children.iter().position(|c| c == last))
                .map(|p| p + 1),
        };
        let position = position.unwrap_or(children.len());
        self.node_mut(parent)?.children.insert(position, child);
        self.node_mut(child)?.parent = Some(parent);
        tracing::debug!(?parent, ?child, ?kind, "added child");
        self.structure_changed(parent, kind, old);
        Ok(())
    }

    /// Detaches `child` (and its subtree) from `parent`.
    pub fn remove_child(&mut self, parent: NodeKey, child: NodeKey) -> Result<()> {
        self.check_local(parent)?;
        if self.parent(child) != Some(parent) {
            return Err(TreeError::NotAChild { parent, child });
        }
        let kind = self.get(child)?.kind();
        let old = self.children_of_kind(parent, kind);
        self.node_mut(parent)?.children.retain(|c| *c != child);
        self.node_mut(child)?.parent = None;
        tracing::debug!(?parent, ?child, ?kind, "removed child");
        self.structure_changed(parent, kind, old);
        Ok(())
    }

    /// Replaces `parent`'s children of kind `kind` with `children`, in that order.
    ///
    /// Children of other kinds are untouched. Former children not in `children` are detached.
    /// Every key in `children` must be of kind `kind` and either detached or already a child of
    /// `parent`.
    pub fn set_children(
        &mut self,
        parent: NodeKey,
        kind: NodeKind,
        children: Vec<NodeKey>,
    ) -> Result<()> {
        let parent_kind = self.check_local(parent)?.kind();
        if !parent_kind.accepts(kind) {
            return Err(TreeError::InvalidChild {
                parent: parent_kind,
                child: kind,
            });
        }
        if parent_kind.single_slot(kind) && children.len() > 1 {
            return Err(TreeError::SlotOccupied {
                parent,
                child: kind,
            });
        }
        for (i, &child) in children.iter().enumerate() {
            self.check_placeable(parent, child)?;
            let child_kind = self.get(child)?.kind();
            if child_kind != kind {
                return Err(TreeError::InvalidChild {
                    parent: parent_kind,
                    child: child_kind,
                });
            }
            if children[..i].contains(&child) {
                return Err(TreeError::AlreadyPlaced(child));
            }
        }

        let old = self.children_of_kind(parent, kind);
        let node = self.node_mut(parent)?;
        let insert_at = node
            .children
            .iter()
            .position(|c| old.contains(c))
            .unwrap_or(node.children.len());
        node.children.retain(|c| !old.contains(c));
        node.children.insert_many(insert_at, children.iter().copied());
        for gone in old.iter().filter(|k| !children.contains(k)) {
            self.node_mut(*gone)?.parent = None;
        }
        for &child in &children {
            self.node_mut(child)?.parent = Some(parent);
        }
        tracing::debug!(?parent, ?kind, count = children.len(), "set children");
        self.structure_changed(parent, kind, old);
        Ok(())
    }

    /// Sets or clears an observation's sequence root.
    pub fn set_seq_component(&mut self, observation: NodeKey, seq: Option<NodeKey>) -> Result<()> {
        self.set_children(observation, NodeKind::SeqComponent, seq.into_iter().collect())
    }

    pub fn seq_component(&self, observation: NodeKey) -> Option<NodeKey> {
        self.children_of_kind(observation, NodeKind::SeqComponent)
            .first()
            .copied()
    }

    pub fn set_template_folder(&mut self, folder: Option<NodeKey>) -> Result<()> {
        self.set_children(self.root, NodeKind::TemplateFolder, folder.into_iter().collect())
    }

    pub fn template_folder(&self) -> Option<NodeKey> {
        self.children_of_kind(self.root, NodeKind::TemplateFolder)
            .first()
            .copied()
    }

    pub fn set_conflict_folder(&mut self, folder: Option<NodeKey>) -> Result<()> {
        self.set_children(self.root, NodeKind::ConflictFolder, folder.into_iter().collect())
    }

    pub fn conflict_folder(&self) -> Option<NodeKey> {
        self.children_of_kind(self.root, NodeKind::ConflictFolder)
            .first()
            .copied()
    }

    /// Drops a detached subtree from memory. Its versions are remembered.
    pub fn discard(&mut self, key: NodeKey) -> Result<()> {
        let node = self.get(key)?;
        if node.is_root() || node.parent.is_some() {
            return Err(TreeError::AlreadyPlaced(key));
        }
        for k in self.subtree(key) {
            self.nodes.remove(&k);
            self.listeners.remove(&k);
        }
        tracing::debug!(?key, "discarded subtree");
        Ok(())
    }

    fn structure_changed(&mut self, parent: NodeKey, kind: NodeKind, old: Vec<NodeKey>) {
        self.bump(parent);
        self.fire_with(|tree| {
            let parent_kind = tree.kind_of(parent).unwrap_or(NodeKind::Program);
            PropertyChange::structure(
                parent_kind.child_property(kind),
                parent,
                old,
                tree.children_of_kind(parent, kind),
            )
        });
    }

    // Payload and conflicts

    /// Replaces the payload of `key`, returning the previous one.
    pub fn set_data_object(&mut self, key: NodeKey, data: D) -> Result<D> {
        let old = std::mem::replace(&mut self.node_mut(key)?.data_object, data);
        self.bump(key);
        self.fire_with(|tree| {
            PropertyChange::new(
                DATA_OBJECT_PROP,
                key,
                ChangeValue::DataObject(old.clone()),
                ChangeValue::DataObject(tree.nodes[&key].data_object.clone()),
            )
        });
        Ok(old)
    }

    /// Replaces the payload of `key` and keeps the previous one as a local data-object conflict,
    /// for when an incoming version overrides a local edit that the user should still see.
    pub fn set_data_object_keeping_conflict(&mut self, key: NodeKey, data: D) -> Result<D> {
        let node = self.node_mut(key)?;
        let old_data = std::mem::replace(&mut node.data_object, data);
        let new_conflicts = node
            .conflicts
            .with_data_object_conflict(DataObjectConflict::local(old_data.clone()));
        let old_conflicts = std::mem::replace(&mut node.conflicts, new_conflicts);
        self.bump(key);
        self.fire_with(|tree| {
            PropertyChange::new(
                DATA_OBJECT_PROP,
                key,
                ChangeValue::DataObject(old_data.clone()),
                ChangeValue::DataObject(tree.nodes[&key].data_object.clone()),
            )
        });
        self.fire_with(|tree| {
            PropertyChange::new(
                CONFLICTS_PROP,
                key,
                ChangeValue::Conflicts(old_conflicts),
                ChangeValue::Conflicts(tree.nodes[&key].conflicts.clone()),
            )
        });
        Ok(old_data)
    }

    pub fn conflicts(&self, key: NodeKey) -> Result<&Conflicts<D>> {
        Ok(self.get(key)?.conflicts())
    }

    pub fn has_conflicts(&self, key: NodeKey) -> bool {
        self.nodes.get(&key).is_some_and(Node::has_conflicts)
    }

    /// Keys of attached nodes that carry conflicts, in tree order.
    pub fn conflicted_nodes(&self) -> Vec<NodeKey> {
        self.subtree(self.root)
            .into_iter()
            .filter(|&k| self.has_conflicts(k))
            .collect()
    }

    pub fn set_conflicts(&mut self, key: NodeKey, conflicts: Conflicts<D>) -> Result<Conflicts<D>> {
        let old = std::mem::replace(&mut self.node_mut(key)?.conflicts, conflicts);
        self.bump(key);
        self.fire_with(|tree| {
            PropertyChange::new(
                CONFLICTS_PROP,
                key,
                ChangeValue::Conflicts(old.clone()),
                ChangeValue::Conflicts(tree.nodes[&key].conflicts.clone()),
            )
        });
        Ok(old)
    }

    pub fn add_conflict_note(&mut self, key: NodeKey, note: ConflictNote) -> Result<()> {
        let current = self.conflicts(key)?;
        if current.notes().contains(&note) {
            return Ok(());
        }
        let updated = current.with_conflict_note(note);
        self.set_conflicts(key, updated).map(drop)
    }

    pub fn resolve_conflict_note(&mut self, key: NodeKey, note: &ConflictNote) -> Result<()> {
        let current = self.conflicts(key)?;
        if !current.notes().contains(note) {
            return Ok(());
        }
        let updated = current.resolve_conflict_note(note);
        self.set_conflicts(key, updated).map(drop)
    }

    pub fn resolve_data_object_conflict(&mut self, key: NodeKey) -> Result<()> {
        let current = self.conflicts(key)?;
        if current.data_object_conflict().is_none() {
            return Ok(());
        }
        let updated = current.resolve_data_object_conflict();
        self.set_conflicts(key, updated).map(drop)
    }

    /// Exchanges the live payload with the preserved conflicting one, so a reviewer can look at
    /// the other version and swap back. Returns false if there is nothing to swap.
    pub fn swap_data_object_conflict(&mut self, key: NodeKey) -> Result<bool> {
        let node = self.node_mut(key)?;
        let old_conflicts = node.conflicts.clone();
        let Node {
            data_object,
            conflicts,
            ..
        } = node;
        let Some(doc) = conflicts.data_object_conflict_mut() else {
            return Ok(false);
        };
        let live = data_object.clone();
        let preserved = doc.swap(live.clone());
        *data_object = preserved;
        self.bump(key);
        self.fire_with(|tree| {
            PropertyChange::new(
                DATA_OBJECT_PROP,
                key,
                ChangeValue::DataObject(live),
                ChangeValue::DataObject(tree.nodes[&key].data_object.clone()),
            )
        });
        self.fire_with(|tree| {
            PropertyChange::new(
                CONFLICTS_PROP,
                key,
                ChangeValue::Conflicts(old_conflicts),
                ChangeValue::Conflicts(tree.nodes[&key].conflicts.clone()),
            )
        });
        Ok(true)
    }

    // Client data

    /// Attaches persisted client data under `name`, fired as `ClientData:<name>`.
    pub fn put_client_data(
        &mut self,
        key: NodeKey,
        name: impl Into<String>,
        value: ClientValue,
    ) -> Result<Option<ClientValue>> {
        let name = name.into();
        if name == RESERVED_CLIENT_DATA {
            return Err(TreeError::ReservedClientDataName(name));
        }
        let old = self
            .node_mut(key)?
            .client_data
            .insert(name.clone(), Arc::clone(&value));
        self.bump(key);
        self.fire_client_data(key, CLIENT_DATA_PREFIX, &name, old.clone(), Some(value));
        Ok(old)
    }

    pub fn remove_client_data(&mut self, key: NodeKey, name: &str) -> Result<Option<ClientValue>> {
        let old = self.node_mut(key)?.client_data.remove(name);
        if old.is_some() {
            self.bump(key);
            self.fire_client_data(key, CLIENT_DATA_PREFIX, name, old.clone(), None);
        }
        Ok(old)
    }

    /// Attaches client data that is never persisted or copied, fired as
    /// `TransientClientData:<name>`. Does not count as an edit.
    pub fn put_transient_client_data(
        &mut self,
        key: NodeKey,
        name: impl Into<String>,
        value: ClientValue,
    ) -> Result<Option<ClientValue>> {
        let name = name.into();
        let old = self
            .node_mut(key)?
            .transient_client_data
            .insert(name.clone(), Arc::clone(&value));
        self.fire_client_data(
            key,
            TRANSIENT_CLIENT_DATA_PREFIX,
            &name,
            old.clone(),
            Some(value),
        );
        Ok(old)
    }

    /// Removes transient client data. Fires nothing.
    pub fn remove_transient_client_data(
        &mut self,
        key: NodeKey,
        name: &str,
    ) -> Result<Option<ClientValue>> {
        Ok(self.node_mut(key)?.transient_client_data.remove(name))
    }

    fn fire_client_data(
        &self,
        key: NodeKey,
        prefix: &str,
        name: &str,
        old: Option<ClientValue>,
        new: Option<ClientValue>,
    ) {
        let wrap = |v: Option<ClientValue>| v.map_or(ChangeValue::None, ChangeValue::ClientData);
        self.fire_with(|_| PropertyChange::new(format!("{prefix}{name}"), key, wrap(old), wrap(new)));
    }

    // Events

    fn register(
        &mut self,
        key: NodeKey,
        scope: Scope,
        listener: Arc<dyn ChangeListener<D>>,
    ) -> Result<ListenerId> {
        self.get(key)?;
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.entry(key).or_default().add(id, scope, listener);
        Ok(id)
    }

    /// Listens to changes of one property of `key`.
    pub fn add_property_listener(
        &mut self,
        key: NodeKey,
        property: impl Into<Cow<'static, str>>,
        listener: Arc<dyn ChangeListener<D>>,
    ) -> Result<ListenerId> {
        self.register(key, Scope::Property(property.into()), listener)
    }

    /// Listens to every property change of `key` itself.
    pub fn add_listener(
        &mut self,
        key: NodeKey,
        listener: Arc<dyn ChangeListener<D>>,
    ) -> Result<ListenerId> {
        self.register(key, Scope::Direct, listener)
    }

    /// Listens to every change in the subtree rooted at `key`.
    pub fn add_composite_listener(
        &mut self,
        key: NodeKey,
        listener: Arc<dyn ChangeListener<D>>,
    ) -> Result<ListenerId> {
        self.register(key, Scope::Composite, listener)
    }

    /// Listens to child-list changes in the subtree rooted at `key`.
    pub fn add_structure_listener(
        &mut self,
        key: NodeKey,
        listener: Arc<dyn ChangeListener<D>>,
    ) -> Result<ListenerId> {
        self.register(key, Scope::Structure, listener)
    }

    pub fn remove_listener(&mut self, key: NodeKey, id: ListenerId) -> bool {
        let Some(listeners) = self.listeners.get_mut(&key) else {
            return false;
        };
        let removed = listeners.remove(id);
        if listeners.is_empty() {
            self.listeners.remove(&key);
        }
        removed
    }

    pub fn is_sending_events(&self) -> bool {
        self.sending_events
    }

    /// Suspends or resumes event delivery.
    ///
    /// Changes made while suspended are not replayed. On resume, every composite listener gets one
    /// [`EVENTS_ACTIVATED`] event, sourced at the node it is registered on.
    pub fn set_sending_events(&mut self, sending: bool) {
        let resumed = sending && !self.sending_events;
        self.sending_events = sending;
        if !resumed {
            return;
        }
        tracing::debug!(program = ?self.root, "events activated");
        for (&key, listeners) in &self.listeners {
            let change = PropertyChange::new(EVENTS_ACTIVATED, key, ChangeValue::None, ChangeValue::None);
            for listener in listeners.composite() {
                listener.property_change(&change);
            }
        }
    }

    /// Builds the change with `make` and delivers it, unless nobody can be listening.
    fn fire_with(&self, make: impl FnOnce(&Self) -> PropertyChange<D>) {
        if !self.sending_events || self.listeners.is_empty() {
            return;
        }
        let change = make(self);
        let mut targets = Vec::new();
        if let Some(listeners) = self.listeners.get(&change.source) {
            listeners.collect_direct(&change, &mut targets);
        }
        for key in std::iter::once(change.source).chain(self.ancestors(change.source)) {
            if let Some(listeners) = self.listeners.get(&key) {
                listeners.collect_subtree(&change, &mut targets);
            }
        }
        for listener in targets {
            listener.property_change(&change);
        }
    }

    // Locking

    /// The lock registry of this program, shared with same-key copies of the tree.
    pub fn locks(&self) -> &Arc<NodeKeyLocks> {
        &self.locks
    }

    pub fn program_read_lock(&self) {
        self.locks.read_lock(self.root);
    }

    pub fn return_program_read_lock(&self) {
        self.locks.read_unlock(self.root);
    }

    pub fn program_write_lock(&self) {
        self.locks.write_lock(self.root);
    }

    pub fn return_program_write_lock(&self) {
        self.locks.write_unlock(self.root);
    }

    /// Returns true iff the calling thread holds the program write lock.
    pub fn have_program_write_lock(&self) -> bool {
        self.locks.is_write_lock_held(self.root)
    }

    pub fn program_read_guard(&self) -> ReadGuard {
        self.locks.read(self.root)
    }

    pub fn program_write_guard(&self) -> WriteGuard {
        self.locks.write(self.root)
    }

    // Foreign nodes

    /// Materializes the subtree at `key` of another process's tree as a detached subtree of this
    /// one, keeping keys, versions and origin.
    ///
    /// This is what a transport layer does for nodes that live elsewhere. Such nodes cannot be
    /// placed until they have been copied through a [`Factory`](crate::Factory) of this process.
    pub fn adopt_foreign(&mut self, from: &ProgramTree<D>, key: NodeKey) -> Result<NodeKey> {
        let keys = from.subtree(key);
        if keys.is_empty() {
            return Err(TreeError::UnknownNode(key));
        }
        if let Some(&dup) = keys.iter().find(|k| self.contains(**k)) {
            return Err(TreeError::DuplicateKey(dup));
        }
        for k in keys {
            let mut node = from.nodes[&k].clone();
            node.program_key = self.root;
            node.transient_client_data.clear();
            if k == key {
                node.parent = None;
                node.program_id = None;
            }
            self.nodes.insert(k, node);
            if let Some(vv) = from.versions.get(&k) {
                self.versions.insert(k, vv.clone());
            }
        }
        Ok(key)
    }

    // Crate-internal construction

    /// Inserts a detached node with the given version.
    pub(crate) fn insert_node(&mut self, node: Node<D>, version: VersionVector) -> Result<()> {
        if self.contains(node.key) {
            return Err(TreeError::DuplicateKey(node.key));
        }
        let key = node.key;
        self.nodes.insert(key, node);
        if version.is_empty() {
            self.bump(key);
        } else {
            self.versions.insert(key, version);
        }
        Ok(())
    }

    /// Drops an unattached subtree, unlinking it from its (equally unattached) parent. Fires
    /// nothing and keeps versions.
    pub(crate) fn evict(&mut self, key: NodeKey) {
        if let Some(parent) = self.parent(key) {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.retain(|c| *c != key);
            }
        }
        for k in self.subtree(key) {
            self.nodes.remove(&k);
            self.listeners.remove(&k);
        }
    }

    pub(crate) fn set_version(&mut self, key: NodeKey, version: VersionVector) {
        self.versions.insert(key, version);
    }

    pub(crate) fn forget_version(&mut self, key: NodeKey) {
        self.versions.remove(&key);
    }

    pub(crate) fn versions(&self) -> impl Iterator<Item = (NodeKey, &VersionVector)> + '_ {
        self.versions.iter().map(|(&k, vv)| (k, vv))
    }

    /// Replaces persisted client data wholesale, as reconciliation does when it adopts a remote
    /// node state. Fires nothing.
    pub(crate) fn replace_client_data(
        &mut self,
        key: NodeKey,
        client_data: std::collections::BTreeMap<String, ClientValue>,
    ) -> Result<()> {
        self.node_mut(key)?.client_data = client_data;
        Ok(())
    }
}
