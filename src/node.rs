// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Tree nodes and the rules that say which node may sit under which.
use crate::{
    conflicts::Conflicts,
    event::ClientValue,
    key::{NodeKey, ProcessId, ProgramId},
};
use smallvec::SmallVec;
use std::{borrow::Cow, collections::BTreeMap, fmt};

/// Structural role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum NodeKind {
    Program,
    Group,
    Observation,
    ObsComponent,
    SeqComponent,
    TemplateFolder,
    TemplateGroup,
    TemplateParameters,
    ConflictFolder,
}

impl NodeKind {
    /// Returns true if a node of this kind may hold children of kind `child`.
    pub const fn accepts(self, child: NodeKind) -> bool {
        use NodeKind::*;
        matches!(
            (self, child),
            (
                Program,
                Observation | Group | ObsComponent | TemplateFolder | ConflictFolder
            ) | (Group, Observation | ObsComponent)
                | (Observation, ObsComponent | SeqComponent)
                | (SeqComponent, SeqComponent)
                | (TemplateFolder, TemplateGroup)
                | (
                    TemplateGroup,
                    TemplateParameters | Observation | ObsComponent
                )
                | (ConflictFolder, Observation | Group | ObsComponent)
        )
    }

    /// Returns true if a parent of this kind holds at most one child of kind `child`.
    pub const fn single_slot(self, child: NodeKind) -> bool {
        use NodeKind::*;
        matches!(
            (self, child),
            (Observation, SeqComponent) | (Program, TemplateFolder | ConflictFolder)
        )
    }

    /// Property name under which a parent of this kind reports changes to its `child` list.
    pub const fn child_property(self, child: NodeKind) -> &'static str {
        use NodeKind::*;
        match (self, child) {
            (Observation, SeqComponent) => "SeqComponent",
            (_, SeqComponent) => "SeqComponentList",
            (_, Observation) => "ObservationList",
            (_, Group) => "GroupList",
            (_, ObsComponent) => "ObsComponentList",
            (_, TemplateFolder) => "TemplateFolder",
            (_, TemplateGroup) => "TemplateGroupList",
            (_, TemplateParameters) => "TemplateParametersList",
            (_, ConflictFolder) => "ConflictFolder",
            (_, Program) => "Program",
        }
    }

    /// Kinds that may contain observations somewhere below them.
    pub const fn holds_observations(self) -> bool {
        use NodeKind::*;
        matches!(
            self,
            Program | Group | TemplateFolder | TemplateGroup | ConflictFolder
        )
    }
}

/// Identifies the concrete type of a node, and with it the initializer that builds it.
///
/// The structural types are provided as constants; collaborators define their own component
/// types, for example `ComponentType::new(NodeKind::ObsComponent, "Instrument:GMOS-N")`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct ComponentType {
    pub kind: NodeKind,
    pub name: Cow<'static, str>,
}

impl ComponentType {
    pub const PROGRAM: Self = Self::constant(NodeKind::Program, "Program");
    pub const GROUP: Self = Self::constant(NodeKind::Group, "Group");
    pub const OBSERVATION: Self = Self::constant(NodeKind::Observation, "Observation");
    /// The sequence root every observation starts with.
    pub const SEQ_BASE: Self = Self::constant(NodeKind::SeqComponent, "Base");
    pub const TEMPLATE_FOLDER: Self = Self::constant(NodeKind::TemplateFolder, "TemplateFolder");
    pub const TEMPLATE_GROUP: Self = Self::constant(NodeKind::TemplateGroup, "TemplateGroup");
    pub const TEMPLATE_PARAMETERS: Self =
        Self::constant(NodeKind::TemplateParameters, "TemplateParameters");
    pub const CONFLICT_FOLDER: Self = Self::constant(NodeKind::ConflictFolder, "ConflictFolder");

    const fn constant(kind: NodeKind, name: &'static str) -> Self {
        Self {
            kind,
            name: Cow::Borrowed(name),
        }
    }

    pub fn new(kind: NodeKind, name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Debug for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.name)
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

pub(crate) type Children = SmallVec<[NodeKey; 4]>;

/// A node of a program tree.
///
/// Nodes are created by the [`Factory`](crate::Factory) and only change through the
/// [`ProgramTree`](crate::ProgramTree) that owns them, which takes care of versions, events and
/// structural invariants.
#[derive(Clone)]
pub struct Node<D> {
    pub(crate) key: NodeKey,
    pub(crate) program_key: NodeKey,
    pub(crate) origin: ProcessId,
    pub(crate) component_type: ComponentType,
    pub(crate) parent: Option<NodeKey>,
    pub(crate) children: Children,
    pub(crate) data_object: D,
    pub(crate) conflicts: Conflicts<D>,
    pub(crate) client_data: BTreeMap<String, ClientValue>,
    pub(crate) transient_client_data: BTreeMap<String, ClientValue>,
    pub(crate) program_id: Option<ProgramId>,
}

impl<D: fmt::Debug> fmt::Debug for Node<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("type", &self.component_type)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("data_object", &self.data_object)
            .field("conflicts", &self.conflicts)
            .field("client_data", &self.client_data.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<D> Node<D> {
    pub(crate) fn new(
        key: NodeKey,
        program_key: NodeKey,
        origin: ProcessId,
        component_type: ComponentType,
        data_object: D,
    ) -> Self {
        Self {
            key,
            program_key,
            origin,
            component_type,
            parent: None,
            children: Children::new(),
            data_object,
            conflicts: Conflicts::EMPTY,
            client_data: BTreeMap::new(),
            transient_client_data: BTreeMap::new(),
            program_id: None,
        }
    }

    pub fn key(&self) -> NodeKey {
        self.key
    }

    /// Key of the program root this node belongs to.
    pub fn program_key(&self) -> NodeKey {
        self.program_key
    }

    pub fn is_root(&self) -> bool {
        self.key == self.program_key
    }

    /// The process whose object graph this node was created in.
    pub fn origin(&self) -> ProcessId {
        self.origin
    }

    pub fn kind(&self) -> NodeKind {
        self.component_type.kind
    }

    pub fn component_type(&self) -> &ComponentType {
        &self.component_type
    }

    pub fn parent(&self) -> Option<NodeKey> {
        self.parent
    }

    pub fn children(&self) -> &[NodeKey] {
        &self.children
    }

    pub fn data_object(&self) -> &D {
        &self.data_object
    }

    pub fn conflicts(&self) -> &Conflicts<D> {
        &self.conflicts
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn client_data(&self, name: &str) -> Option<&ClientValue> {
        self.client_data.get(name)
    }

    pub fn client_data_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.client_data.keys().map(String::as_str)
    }

    pub fn transient_client_data(&self, name: &str) -> Option<&ClientValue> {
        self.transient_client_data.get(name)
    }

    /// External id; only program roots carry one.
    pub fn program_id(&self) -> Option<&ProgramId> {
        self.program_id.as_ref()
    }
}
