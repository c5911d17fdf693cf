// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # sptree: Versioned, Conflict-Aware Program Trees
//!
//! This crate provides the in-memory core of an observing-program database. A **program** is a
//! tree: groups of observations, each observation holding its instrument and target components
//! and a sequence of steps, plus template and conflict folders. Every node carries an opaque
//! payload (its *data object*), a version vector, and a record of the conflicts it picked up when
//! diverged copies of the program were reconciled.
//!
//! The crate is about the tree, not the payload. Payloads are any serializable type (see
//! [`DataObject`]); persistence and transport are left to collaborators.
//!
//! ## Core Concepts
//!
//! - [`NodeKey`]: the permanent, globally unique identity of a node. Copies of a program line up
//!   node by node through their keys.
//! - [`ProgramTree`]: an arena of [`Node`]s addressed by key. All edits go through it, so it can
//!   enforce structural rules, bump versions and notify listeners.
//! - [`Factory`]: the only way to create nodes and to copy trees. Per-type [`NodeInitializer`]s
//!   build default payloads and mandatory children.
//! - [`VersionVector`]: per-session edit counters that tell whether one copy of a node has seen
//!   every edit of another, or whether the two diverged.
//! - [`Conflicts`]: what reconciliation could not settle, recorded on the node: the losing
//!   payload ([`DataObjectConflict`]) and a list of [`ConflictNote`]s.
//! - [`NodeKeyLocks`]: reentrant read/write locks per key, used to lock whole programs.
//!
//! ## Errors versus Conflicts
//!
//! A live edit that would break the tree (placing a node twice, putting an observation inside an
//! observation, using a node of another process) is rejected with a [`TreeError`] and leaves the
//! tree unchanged. Problems found while reconciling two copies that were both valid on their own
//! are never errors: they are recorded as conflicts on the affected nodes, and the merged tree
//! stays fully usable until somebody resolves them.
//!
//! ## Getting Started
//!
//! ```rust
//! use serde_json::{json, Value};
//! use sptree::{merge_remote, AllowAll, Factory, Perspective};
//!
//! // Every node type gets a payload built by this closure.
//! let factory = Factory::<Value>::with_defaults(|ctype| json!({ "type": ctype.name }));
//!
//! // A program with one observation.
//! let mut tree = factory.create_program(None, Some("GS-2025A-Q-1".into()))?;
//! let obs = factory.create_observation(&mut tree, None)?;
//! tree.add_child(tree.root(), obs)?;
//!
//! // The program is copied to another database and edited there...
//! let mut offline = factory.copy_with_new_lifespan_id(&tree)?;
//! offline.set_data_object(obs, json!({ "title": "M31, offline" }))?;
//!
//! // ...while it is also edited here.
//! tree.set_data_object(obs, json!({ "title": "M31" }))?;
//!
//! // Reconciling keeps the local payload and preserves the other one for review.
//! let report = merge_remote(&factory, &mut tree, &offline, &AllowAll)?;
//! assert_eq!(report.conflicted, vec![obs]);
//! let doc = tree.conflicts(obs)?.data_object_conflict().unwrap();
//! assert_eq!(doc.perspective, Perspective::Remote);
//! assert_eq!(doc.data_object, json!({ "title": "M31, offline" }));
//!
//! // Resolving is a separate, explicit edit.
//! tree.resolve_data_object_conflict(obs)?;
//! assert!(!tree.has_conflicts(obs));
//! # Ok::<(), sptree::TreeError>(())
//! ```
//!
//! ## Concurrency
//!
//! Trees are plain values; `&mut` access already rules out data races on a single tree. The
//! program lock ([`ProgramTree::program_write_lock`] and friends) coordinates a program across
//! threads and across the same-key copies used to stage edits. Locks block and cannot be
//! cancelled. Listeners are called synchronously on the mutating thread.
//!
//! ## Features
//!
//! - `serde`: Provides `serde` support for keys, version vectors, notes and node kinds. This
//!   feature is enabled by default.
//! - `arbitrary`: Implements `quickcheck::Arbitrary` for keys, version vectors and conflict notes,
//!   useful for property-based testing.
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

use ahash::RandomState;
use serde::Serialize;
use std::{collections::HashMap, fmt};

#[cfg(any(test, feature = "arbitrary"))]
mod arbitrary;
pub mod blob;
pub use blob::DataObjectBlob;
pub mod conflicts;
pub use conflicts::{ConflictNote, ConflictNoteKind, Conflicts, DataObjectConflict, Perspective};
mod error;
pub use error::{Result, TreeError};
pub mod event;
pub use event::{ChangeListener, ChangeValue, ClientValue, ListenerId, PropertyChange};
pub mod factory;
pub use factory::{DefaultInitializer, Factory, NodeInitializer, ObservationInitializer};
mod iter;
pub use iter::ObservationIter;
pub mod key;
pub use key::{LifespanId, NodeKey, ProcessId, ProgramId};
pub mod locks;
pub use locks::{NodeKeyLocks, ReadGuard, ReentrantRwLock, WriteGuard};
pub mod merge;
pub use merge::{AllowAll, MergePolicy, MergeReport, merge_remote};
mod node;
pub use node::{ComponentType, Node, NodeKind};
mod tree;
pub use tree::ProgramTree;
mod version;
pub use version::VersionVector;

/// A payload that can be stored on a node.
///
/// Payloads are compared by their serialized form (see [`DataObjectBlob`]), so any cloneable,
/// serializable type qualifies. Implemented for all such types.
pub trait DataObject: Clone + fmt::Debug + Serialize + Send + Sync + 'static {}

impl<T> DataObject for T where T: Clone + fmt::Debug + Serialize + Send + Sync + 'static {}

fn create_map<K, V>() -> HashMap<K, V, RandomState> {
    HashMap::with_hasher(RandomState::new())
}
