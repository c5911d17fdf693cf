// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use crate::{
    key::NodeKey,
    node::{ComponentType, NodeKind},
};
use thiserror::Error;

/// Why a live edit of a program tree was rejected.
///
/// A rejected edit leaves the tree unchanged. Problems found while reconciling two copies are not
/// errors; they are recorded on the affected nodes as
/// [`ConflictNote`](crate::conflicts::ConflictNote)s.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("node {0} is not part of this program")]
    UnknownNode(NodeKey),

    /// The node was created by another process and must be copied in through the factory.
    #[error("node {0} was not created in this process")]
    NotLocal(NodeKey),

    #[error("node {0} already has a parent")]
    AlreadyPlaced(NodeKey),

    #[error("a {parent:?} cannot hold a {child:?}")]
    InvalidChild { parent: NodeKind, child: NodeKind },

    #[error("placing {child} under {parent} would make it its own ancestor")]
    WouldCycle { parent: NodeKey, child: NodeKey },

    #[error("{parent} already holds a {child:?}")]
    SlotOccupied { parent: NodeKey, child: NodeKind },

    #[error("{child} is not a child of {parent}")]
    NotAChild { parent: NodeKey, child: NodeKey },

    #[error("program {0} is unknown to this factory")]
    UnknownProgram(NodeKey),

    #[error("trees belong to different programs ({local} and {remote})")]
    ProgramMismatch { local: NodeKey, remote: NodeKey },

    #[error("no initializer registered for {0:?}")]
    MissingInitializer(ComponentType),

    #[error("key {0} is already in use")]
    DuplicateKey(NodeKey),

    #[error("client data name {0:?} is reserved")]
    ReservedClientDataName(String),
}

pub type Result<T, E = TreeError> = std::result::Result<T, E>;
