// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use crate::key::NodeKey;
use std::fmt;

/// Why a node could not be cleanly reconciled.
///
/// Every note concerns a single node. Two notes are equal if they are the same variant about the
/// same node (and, for [`ConflictNote::Moved`], the same destination).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum ConflictNote {
    /// The node was moved under `to` in the incoming copy while this copy kept it here. The
    /// incoming location wins; the note is left at the old parent.
    Moved { node: NodeKey, to: NodeKey },
    /// Deleted locally, modified remotely: the node was restored from the remote version.
    ResurrectedLocalDelete { node: NodeKey },
    /// Deleted remotely, modified locally: the deleted node cannot be revived once the delete is
    /// committed, so a new node was created from the local version. `node` is the deleted key.
    ReplacedRemoteDelete { node: NodeKey },
    CreatePermissionFail { node: NodeKey },
    UpdatePermissionFail { node: NodeKey },
    DeletePermissionFail { node: NodeKey },
    /// Applying the incoming change would break a structural rule.
    ConstraintViolation { node: NodeKey },
    /// Marks a folder collecting orphaned conflict artifacts.
    ConflictFolder { node: NodeKey },
}

/// The variant of a [`ConflictNote`] without its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConflictNoteKind {
    Moved,
    ResurrectedLocalDelete,
    ReplacedRemoteDelete,
    CreatePermissionFail,
    UpdatePermissionFail,
    DeletePermissionFail,
    ConstraintViolation,
    ConflictFolder,
}

impl ConflictNote {
    /// The node this note is about.
    pub const fn node_key(&self) -> NodeKey {
        match *self {
            ConflictNote::Moved { node, .. }
            | ConflictNote::ResurrectedLocalDelete { node }
            | ConflictNote::ReplacedRemoteDelete { node }
            | ConflictNote::CreatePermissionFail { node }
            | ConflictNote::UpdatePermissionFail { node }
            | ConflictNote::DeletePermissionFail { node }
            | ConflictNote::ConstraintViolation { node }
            | ConflictNote::ConflictFolder { node } => node,
        }
    }

    pub const fn kind(&self) -> ConflictNoteKind {
        match self {
            ConflictNote::Moved { .. } => ConflictNoteKind::Moved,
            ConflictNote::ResurrectedLocalDelete { .. } => ConflictNoteKind::ResurrectedLocalDelete,
            ConflictNote::ReplacedRemoteDelete { .. } => ConflictNoteKind::ReplacedRemoteDelete,
            ConflictNote::CreatePermissionFail { .. } => ConflictNoteKind::CreatePermissionFail,
            ConflictNote::UpdatePermissionFail { .. } => ConflictNoteKind::UpdatePermissionFail,
            ConflictNote::DeletePermissionFail { .. } => ConflictNoteKind::DeletePermissionFail,
            ConflictNote::ConstraintViolation { .. } => ConflictNoteKind::ConstraintViolation,
            ConflictNote::ConflictFolder { .. } => ConflictNoteKind::ConflictFolder,
        }
    }

    /// Short title suitable for a conflict browser.
    pub const fn title(&self) -> &'static str {
        match self.kind() {
            ConflictNoteKind::Moved => "Moved",
            ConflictNoteKind::ResurrectedLocalDelete => "Resurrected Local Delete",
            ConflictNoteKind::ReplacedRemoteDelete => "Replaced Remote Delete",
            ConflictNoteKind::CreatePermissionFail => "Create Permission Failure",
            ConflictNoteKind::UpdatePermissionFail => "Update Permission Failure",
            ConflictNoteKind::DeletePermissionFail => "Delete Permission Failure",
            ConflictNoteKind::ConstraintViolation => "Constraint Violation",
            ConflictNoteKind::ConflictFolder => "Conflict Folder",
        }
    }
}

impl fmt::Display for ConflictNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictNote::Moved { node, to } => {
                write!(f, "{node} was moved to {to} in the incoming version")
            }
            ConflictNote::ResurrectedLocalDelete { node } => write!(
                f,
                "{node} was deleted locally but modified remotely; it has been restored"
            ),
            ConflictNote::ReplacedRemoteDelete { node } => write!(
                f,
                "{node} was deleted remotely but modified locally; a copy with a new key replaces it"
            ),
            ConflictNote::CreatePermissionFail { node } => {
                write!(f, "not permitted to create {node}")
            }
            ConflictNote::UpdatePermissionFail { node } => {
                write!(f, "not permitted to update {node}")
            }
            ConflictNote::DeletePermissionFail { node } => {
                write!(f, "not permitted to delete {node}")
            }
            ConflictNote::ConstraintViolation { node } => {
                write!(f, "the incoming change to {node} breaks a structural rule")
            }
            ConflictNote::ConflictFolder { node } => {
                write!(f, "{node} collects orphaned conflict artifacts")
            }
        }
    }
}
