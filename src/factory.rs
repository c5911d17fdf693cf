// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Creating and copying nodes
//!
//! The [`Factory`] is the only way to create nodes and to copy trees. It owns key generation, the
//! identity of the process nodes are created in, and the [`NodeInitializer`] registry that knows
//! how to build each [`ComponentType`].
//!
//! Nodes are always created detached: place them with
//! [`ProgramTree::add_child`](crate::ProgramTree::add_child) and friends.
//!
//! ## Copies
//!
//! | copy                                      | keys   | lifespan id | versions | lock registry |
//! |-------------------------------------------|--------|-------------|----------|---------------|
//! | [`Factory::copy_with_same_keys`]          | kept   | kept        | kept     | shared        |
//! | [`Factory::copy_with_new_lifespan_id`]    | kept   | fresh       | kept     | fresh         |
//! | [`Factory::copy_with_new_keys`]           | fresh  | fresh       | fresh    | fresh         |
//! | [`Factory::copy_subtree_with_new_keys`]   | fresh  | target's    | fresh    | target's      |
//!
//! Only nodes attached under the copied root are copied. Listeners and transient client data stay
//! behind. Copies made with fresh keys start without conflicts. Every copied node is local to the
//! copying factory's process and goes through its initializer's [`NodeInitializer::update`].
use crate::{
    DataObject,
    conflicts::Conflicts,
    error::{Result, TreeError},
    key::{LifespanId, NodeKey, ProcessId, ProgramId},
    locks::NodeKeyLocks,
    node::{ComponentType, Node, NodeKind},
    tree::ProgramTree,
    version::VersionVector,
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

/// Builds the nodes of one [`ComponentType`].
#[expect(unused_variables)]
pub trait NodeInitializer<D>: Send + Sync {
    fn component_type(&self) -> &ComponentType;

    /// The payload of a freshly created node.
    fn create_data_object(&self) -> D;

    /// Called once after a node has been created and inserted, detached, into `tree`. Creates
    /// whatever children the node cannot exist without.
    fn initialize(
        &self,
        factory: &Factory<D>,
        tree: &mut ProgramTree<D>,
        key: NodeKey,
    ) -> Result<()> {
        Ok(())
    }

    /// Called for every node of a copy, after the whole copy is in place.
    fn update(&self, tree: &mut ProgramTree<D>, key: NodeKey) -> Result<()> {
        Ok(())
    }
}

type MakeData<D> = Arc<dyn Fn(&ComponentType) -> D + Send + Sync>;

/// Initializer that only builds a payload.
pub struct DefaultInitializer<D> {
    component_type: ComponentType,
    make: MakeData<D>,
}

impl<D> DefaultInitializer<D> {
    pub fn new(
        component_type: ComponentType,
        make: impl Fn(&ComponentType) -> D + Send + Sync + 'static,
    ) -> Self {
        Self {
            component_type,
            make: Arc::new(make),
        }
    }
}

impl<D> NodeInitializer<D> for DefaultInitializer<D> {
    fn component_type(&self) -> &ComponentType {
        &self.component_type
    }

    fn create_data_object(&self) -> D {
        (self.make)(&self.component_type)
    }
}

/// Initializer for observations: every observation starts with an empty
/// [`SEQ_BASE`](ComponentType::SEQ_BASE) sequence root.
pub struct ObservationInitializer<D> {
    component_type: ComponentType,
    make: MakeData<D>,
}

impl<D> ObservationInitializer<D> {
    pub fn new(make: impl Fn(&ComponentType) -> D + Send + Sync + 'static) -> Self {
        Self {
            component_type: ComponentType::OBSERVATION,
            make: Arc::new(make),
        }
    }
}

impl<D: DataObject> NodeInitializer<D> for ObservationInitializer<D> {
    fn component_type(&self) -> &ComponentType {
        &self.component_type
    }

    fn create_data_object(&self) -> D {
        (self.make)(&self.component_type)
    }

    fn initialize(
        &self,
        factory: &Factory<D>,
        tree: &mut ProgramTree<D>,
        key: NodeKey,
    ) -> Result<()> {
        let seq = factory.create_seq_component(tree, ComponentType::SEQ_BASE, None)?;
        tree.set_seq_component(key, Some(seq))
    }
}

/// Creates nodes for the programs it knows.
///
/// A factory is typically shared by every tree loaded in a process. Creation only needs `&self`.
pub struct Factory<D> {
    origin: ProcessId,
    initializers: HashMap<ComponentType, Arc<dyn NodeInitializer<D>>, ahash::RandomState>,
    fallback: Option<MakeData<D>>,
    programs: Mutex<HashSet<NodeKey, ahash::RandomState>>,
}

impl<D> fmt::Debug for Factory<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.initializers.keys().collect();
        types.sort();
        f.debug_struct("Factory")
            .field("origin", &self.origin)
            .field("initializers", &types)
            .field("programs", &self.programs.lock().len())
            .finish_non_exhaustive()
    }
}

impl<D: DataObject> Default for Factory<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DataObject> Factory<D> {
    /// A factory for the current process, with no initializers.
    pub fn new() -> Self {
        Self {
            origin: ProcessId::current(),
            initializers: crate::create_map(),
            fallback: None,
            programs: Mutex::new(HashSet::default()),
        }
    }

    /// A factory that builds every payload with `make`.
    ///
    /// The structural types get the stock initializers ([`ObservationInitializer`] for
    /// observations, [`DefaultInitializer`] otherwise). Component types nobody registered are
    /// built like a [`DefaultInitializer`] would.
    pub fn with_defaults(make: impl Fn(&ComponentType) -> D + Send + Sync + 'static) -> Self {
        let make: MakeData<D> = Arc::new(make);
        let mut factory = Self::new();
        for ctype in [
            ComponentType::PROGRAM,
            ComponentType::GROUP,
            ComponentType::SEQ_BASE,
            ComponentType::TEMPLATE_FOLDER,
            ComponentType::TEMPLATE_GROUP,
            ComponentType::TEMPLATE_PARAMETERS,
            ComponentType::CONFLICT_FOLDER,
        ] {
            let make = Arc::clone(&make);
            factory.register(DefaultInitializer::new(ctype, move |c| make(c)));
        }
        let observation = Arc::clone(&make);
        factory.register(ObservationInitializer::new(move |c| observation(c)));
        factory.fallback = Some(make);
        factory
    }

    /// Creates nodes as if in process `origin`.
    pub fn with_origin(mut self, origin: ProcessId) -> Self {
        self.origin = origin;
        self
    }

    pub fn origin(&self) -> ProcessId {
        self.origin
    }

    /// Registers the initializer for its component type, returning the one it replaces.
    pub fn register(
        &mut self,
        initializer: impl NodeInitializer<D> + 'static,
    ) -> Option<Arc<dyn NodeInitializer<D>>> {
        let ctype = initializer.component_type().clone();
        self.initializers.insert(ctype, Arc::new(initializer))
    }

    fn initializer(&self, ctype: &ComponentType) -> Result<Arc<dyn NodeInitializer<D>>> {
        if let Some(init) = self.initializers.get(ctype) {
            return Ok(Arc::clone(init));
        }
        let Some(make) = &self.fallback else {
            return Err(TreeError::MissingInitializer(ctype.clone()));
        };
        let make = Arc::clone(make);
        Ok(if ctype.kind == NodeKind::Observation {
            Arc::new(ObservationInitializer::new(move |c| make(c)))
        } else {
            Arc::new(DefaultInitializer::new(ctype.clone(), move |c| make(c)))
        })
    }

    /// Returns true if this factory created or copied the program with root `key`.
    pub fn knows_program(&self, key: NodeKey) -> bool {
        self.programs.lock().contains(&key)
    }

    /// Forgets a program, typically when it is unloaded. Further creation in it fails.
    pub fn forget_program(&self, key: NodeKey) -> bool {
        self.programs.lock().remove(&key)
    }

    // Creation

    /// Creates a program with its own lock registry.
    pub fn create_program(
        &self,
        key: Option<NodeKey>,
        program_id: Option<ProgramId>,
    ) -> Result<ProgramTree<D>> {
        self.create_program_with_locks(key, program_id, Arc::new(NodeKeyLocks::new()))
    }

    /// Creates a program that locks through `locks`.
    pub fn create_program_with_locks(
        &self,
        key: Option<NodeKey>,
        program_id: Option<ProgramId>,
        locks: Arc<NodeKeyLocks>,
    ) -> Result<ProgramTree<D>> {
        let init = self.initializer(&ComponentType::PROGRAM)?;
        let key = key.unwrap_or_else(NodeKey::new);
        let mut root = Node::new(
            key,
            key,
            self.origin,
            ComponentType::PROGRAM,
            init.create_data_object(),
        );
        root.program_id = program_id;
        let mut tree = ProgramTree::new(root, LifespanId::new(), locks);
        self.programs.lock().insert(key);
        init.initialize(self, &mut tree, key)?;
        tracing::debug!(program = ?key, "created program");
        Ok(tree)
    }

    /// Creates a detached node of type `ctype` in `tree`.
    ///
    /// `key` echoes an existing identity, as when rebuilding a tree from storage; without it a
    /// fresh key is generated. `initializer` overrides the registered one.
    pub fn create_node(
        &self,
        tree: &mut ProgramTree<D>,
        ctype: ComponentType,
        key: Option<NodeKey>,
        initializer: Option<&dyn NodeInitializer<D>>,
    ) -> Result<NodeKey> {
        if !self.knows_program(tree.program_key()) {
            return Err(TreeError::UnknownProgram(tree.program_key()));
        }
        let registered;
        let init = match initializer {
            Some(init) => init,
            None => {
                registered = self.initializer(&ctype)?;
                registered.as_ref()
            }
        };
        let key = key.unwrap_or_else(NodeKey::new);
        let node = Node::new(
            key,
            tree.program_key(),
            self.origin,
            ctype,
            init.create_data_object(),
        );
        tree.insert_node(node, VersionVector::new())?;
        init.initialize(self, tree, key)?;
        Ok(key)
    }

    pub fn create_group(&self, tree: &mut ProgramTree<D>, key: Option<NodeKey>) -> Result<NodeKey> {
        self.create_node(tree, ComponentType::GROUP, key, None)
    }

    /// Creates an observation together with its sequence root.
    pub fn create_observation(
        &self,
        tree: &mut ProgramTree<D>,
        key: Option<NodeKey>,
    ) -> Result<NodeKey> {
        self.create_node(tree, ComponentType::OBSERVATION, key, None)
    }

    pub fn create_obs_component(
        &self,
        tree: &mut ProgramTree<D>,
        ctype: ComponentType,
        key: Option<NodeKey>,
    ) -> Result<NodeKey> {
        self.create_node(tree, ctype, key, None)
    }

    pub fn create_seq_component(
        &self,
        tree: &mut ProgramTree<D>,
        ctype: ComponentType,
        key: Option<NodeKey>,
    ) -> Result<NodeKey> {
        self.create_node(tree, ctype, key, None)
    }

    pub fn create_template_folder(
        &self,
        tree: &mut ProgramTree<D>,
        key: Option<NodeKey>,
    ) -> Result<NodeKey> {
        self.create_node(tree, ComponentType::TEMPLATE_FOLDER, key, None)
    }

    pub fn create_template_group(
        &self,
        tree: &mut ProgramTree<D>,
        key: Option<NodeKey>,
    ) -> Result<NodeKey> {
        self.create_node(tree, ComponentType::TEMPLATE_GROUP, key, None)
    }

    pub fn create_template_parameters(
        &self,
        tree: &mut ProgramTree<D>,
        key: Option<NodeKey>,
    ) -> Result<NodeKey> {
        self.create_node(tree, ComponentType::TEMPLATE_PARAMETERS, key, None)
    }

    pub fn create_conflict_folder(
        &self,
        tree: &mut ProgramTree<D>,
        key: Option<NodeKey>,
    ) -> Result<NodeKey> {
        self.create_node(tree, ComponentType::CONFLICT_FOLDER, key, None)
    }

    // Copies

    /// Deep copy keeping keys, lifespan id and versions, sharing the lock registry.
    ///
    /// Used to stage an edit off to the side: modify the copy, and swap it in for the live tree
    /// only if the edit validates.
    pub fn copy_with_same_keys(&self, src: &ProgramTree<D>) -> Result<ProgramTree<D>> {
        self.copy_program(src, src.lifespan_id(), Arc::clone(src.locks()), None)
    }

    /// Deep copy keeping keys and versions, with a fresh lifespan id and lock registry.
    ///
    /// Used when a tree moves to another database, whose edits must not be confused with the
    /// origin's edit history.
    pub fn copy_with_new_lifespan_id(&self, src: &ProgramTree<D>) -> Result<ProgramTree<D>> {
        self.copy_program(
            src,
            LifespanId::new(),
            Arc::new(NodeKeyLocks::new()),
            None,
        )
    }

    /// Duplicates a program: every node gets a fresh key and the root gets `program_id`.
    pub fn copy_with_new_keys(
        &self,
        src: &ProgramTree<D>,
        program_id: Option<ProgramId>,
    ) -> Result<ProgramTree<D>> {
        self.copy_program(
            src,
            LifespanId::new(),
            Arc::new(NodeKeyLocks::new()),
            Some(program_id),
        )
    }

    /// Clones the subtree at `node` of `src` into `dst` with fresh keys, detached. Returns the key
    /// of the clone.
    pub fn copy_subtree_with_new_keys(
        &self,
        src: &ProgramTree<D>,
        node: NodeKey,
        dst: &mut ProgramTree<D>,
    ) -> Result<NodeKey> {
        if !self.knows_program(dst.program_key()) {
            return Err(TreeError::UnknownProgram(dst.program_key()));
        }
        let clones = self.clone_subtree(src, node, dst.program_key())?;
        self.insert_clones(dst, clones)
    }

    /// Like [`Factory::copy_subtree_with_new_keys`] within a single tree.
    pub(crate) fn duplicate_subtree(
        &self,
        tree: &mut ProgramTree<D>,
        node: NodeKey,
    ) -> Result<NodeKey> {
        let clones = self.clone_subtree(tree, node, tree.program_key())?;
        self.insert_clones(tree, clones)
    }

    /// Clones of the subtree at `node`, top first.
    fn clone_subtree(
        &self,
        src: &ProgramTree<D>,
        node: NodeKey,
        program_key: NodeKey,
    ) -> Result<Vec<Node<D>>> {
        let keys = src.subtree(node);
        if keys.is_empty() {
            return Err(TreeError::UnknownNode(node));
        }
        let remap = fresh_keys(&keys);
        keys.iter()
            .map(|&k| {
                let mut copy = self.clone_node(src.get(k)?, program_key, &remap);
                copy.conflicts = Conflicts::EMPTY;
                if k == node {
                    copy.parent = None;
                    copy.program_id = None;
                }
                Ok(copy)
            })
            .collect()
    }

    fn insert_clones(&self, dst: &mut ProgramTree<D>, clones: Vec<Node<D>>) -> Result<NodeKey> {
        let keys: Vec<_> = clones.iter().map(Node::key).collect();
        let Some(&top) = keys.first() else {
            return Err(TreeError::UnknownNode(dst.program_key()));
        };
        for copy in clones {
            dst.insert_node(copy, VersionVector::new())?;
        }
        self.update_all(dst, &keys)?;
        tracing::debug!(copy = ?top, nodes = keys.len(), "copied subtree");
        Ok(top)
    }

    /// `new_keys` is `Some(program id)` for copies with fresh keys.
    fn copy_program(
        &self,
        src: &ProgramTree<D>,
        lifespan_id: LifespanId,
        locks: Arc<NodeKeyLocks>,
        new_keys: Option<Option<ProgramId>>,
    ) -> Result<ProgramTree<D>> {
        let keys = src.subtree(src.root());
        let remap = match new_keys {
            Some(_) => fresh_keys(&keys),
            None => keys.iter().map(|&k| (k, k)).collect(),
        };
        let root_key = remap[&src.root()];

        let mut root = self.clone_node(src.get(src.root())?, root_key, &remap);
        if let Some(program_id) = &new_keys {
            root.conflicts = Conflicts::EMPTY;
            root.program_id = program_id.clone();
        }
        let mut tree = ProgramTree::new(root, lifespan_id, locks);
        if new_keys.is_none() {
            for (k, vv) in src.versions() {
                tree.set_version(k, vv.clone());
            }
        }

        for &k in keys.iter().skip(1) {
            let mut copy = self.clone_node(src.get(k)?, root_key, &remap);
            let version = match new_keys {
                Some(_) => {
                    copy.conflicts = Conflicts::EMPTY;
                    VersionVector::new()
                }
                None => src.version(k).cloned().unwrap_or_default(),
            };
            tree.insert_node(copy, version)?;
        }

        self.programs.lock().insert(root_key);
        let copied: Vec<_> = keys.iter().map(|k| remap[k]).collect();
        self.update_all(&mut tree, &copied)?;
        tracing::debug!(
            from = ?src.root(),
            to = ?root_key,
            nodes = keys.len(),
            new_keys = new_keys.is_some(),
            "copied program"
        );
        Ok(tree)
    }

    fn clone_node(
        &self,
        node: &Node<D>,
        program_key: NodeKey,
        remap: &HashMap<NodeKey, NodeKey, ahash::RandomState>,
    ) -> Node<D> {
        let map = |k: NodeKey| remap.get(&k).copied().unwrap_or(k);
        let mut copy = node.clone();
        copy.key = map(node.key);
        copy.program_key = program_key;
        copy.origin = self.origin;
        copy.parent = node.parent.map(map);
        copy.children = node.children.iter().map(|&c| map(c)).collect();
        copy.transient_client_data.clear();
        copy
    }

    fn update_all(&self, tree: &mut ProgramTree<D>, keys: &[NodeKey]) -> Result<()> {
        for &key in keys {
            let ctype = tree.get(key)?.component_type().clone();
            self.initializer(&ctype)?.update(tree, key)?;
        }
        Ok(())
    }
}

fn fresh_keys(keys: &[NodeKey]) -> HashMap<NodeKey, NodeKey, ahash::RandomState> {
    keys.iter().map(|&k| (k, NodeKey::new())).collect()
}
