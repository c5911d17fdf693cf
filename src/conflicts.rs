// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Conflict Records
//!
//! A node that could not be cleanly reconciled carries a [`Conflicts`] value: an optional
//! [`DataObjectConflict`] (the payload version that lost) and an ordered list of
//! [`ConflictNote`]s explaining what else happened to it.
//!
//! Conflicts are plain values. Every edit returns a new value and leaves the original alone, so
//! [`Conflicts::EMPTY`] can be handed out freely.
//!
//! Merging is directional: `existing.merge_from(&incoming)` applies `incoming` on top of
//! `existing`. The incoming data-object conflict wins if there is one, and for every node that
//! the incoming notes talk about, the incoming notes replace whatever `existing` said about that
//! node. Notes about other nodes keep their relative order.
use crate::key::NodeKey;
use std::collections::BTreeSet;

mod data_object;
mod note;

pub use data_object::{DataObjectConflict, Perspective};
pub use note::{ConflictNote, ConflictNoteKind};

/// The conflict state of a single node.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflicts<D> {
    data_object_conflict: Option<DataObjectConflict<D>>,
    notes: Vec<ConflictNote>,
}

impl<D> Default for Conflicts<D> {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl<D> Conflicts<D> {
    /// No conflicts at all.
    pub const EMPTY: Self = Self {
        data_object_conflict: None,
        notes: Vec::new(),
    };

    /// Builds a conflict record, dropping duplicate notes.
    pub fn new(
        data_object_conflict: Option<DataObjectConflict<D>>,
        notes: impl IntoIterator<Item = ConflictNote>,
    ) -> Self {
        let mut out = Self {
            data_object_conflict,
            notes: Vec::new(),
        };
        for note in notes {
            out.push_note(note);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.data_object_conflict.is_none() && self.notes.is_empty()
    }

    pub fn data_object_conflict(&self) -> Option<&DataObjectConflict<D>> {
        self.data_object_conflict.as_ref()
    }

    pub fn notes(&self) -> &[ConflictNote] {
        &self.notes
    }

    /// Notes concerning `key`, in order.
    pub fn notes_for(&self, key: NodeKey) -> impl Iterator<Item = &ConflictNote> + '_ {
        self.notes.iter().filter(move |n| n.node_key() == key)
    }

    fn push_note(&mut self, note: ConflictNote) {
        if !self.notes.contains(&note) {
            self.notes.push(note);
        }
    }

    pub(crate) fn data_object_conflict_mut(&mut self) -> Option<&mut DataObjectConflict<D>> {
        self.data_object_conflict.as_mut()
    }
}

impl<D: Clone> Conflicts<D> {
    /// Records `doc` as the alternate payload, keeping the notes.
    pub fn with_data_object_conflict(&self, doc: DataObjectConflict<D>) -> Self {
        Self {
            data_object_conflict: Some(doc),
            notes: self.notes.clone(),
        }
    }

    /// Adds `note` unless an equal note is already present.
    pub fn with_conflict_note(&self, note: ConflictNote) -> Self {
        let mut out = self.clone();
        out.push_note(note);
        out
    }

    /// Drops the alternate payload, keeping the notes.
    pub fn resolve_data_object_conflict(&self) -> Self {
        Self {
            data_object_conflict: None,
            notes: self.notes.clone(),
        }
    }

    /// Drops every note equal to `note`.
    pub fn resolve_conflict_note(&self, note: &ConflictNote) -> Self {
        Self {
            data_object_conflict: self.data_object_conflict.clone(),
            notes: self.notes.iter().filter(|n| *n != note).copied().collect(),
        }
    }

    /// Applies `that` on top of `self`.
    ///
    /// This is not symmetric: `that`'s data-object conflict and `that`'s notes about any given
    /// node win over `self`'s.
    pub fn merge_from(&self, that: &Conflicts<D>) -> Self {
        if that.is_empty() {
            return self.clone();
        }
        let replaced: BTreeSet<NodeKey> = that.notes.iter().map(ConflictNote::node_key).collect();
        let mut out = Self {
            data_object_conflict: that
                .data_object_conflict
                .clone()
                .or_else(|| self.data_object_conflict.clone()),
            notes: self
                .notes
                .iter()
                .filter(|n| !replaced.contains(&n.node_key()))
                .copied()
                .collect(),
        };
        for &note in &that.notes {
            out.push_note(note);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type C = Conflicts<&'static str>;

    #[test]
    fn empty_is_empty() {
        assert!(C::EMPTY.is_empty());
        assert!(C::default().is_empty());
        let k = NodeKey::new();
        assert!(!C::EMPTY.with_conflict_note(ConflictNote::ConflictFolder { node: k }).is_empty());
        assert!(!C::EMPTY
            .with_data_object_conflict(DataObjectConflict::local("x"))
            .is_empty());
    }

    #[test]
    fn edits_leave_the_original_alone() {
        let k = NodeKey::new();
        let base = C::EMPTY;
        let edited = base.with_conflict_note(ConflictNote::ConstraintViolation { node: k });
        assert!(base.is_empty());
        assert_eq!(edited.notes().len(), 1);
    }

    #[test]
    fn resolve_removes_only_the_matching_part() {
        let k = NodeKey::new();
        let note = ConflictNote::UpdatePermissionFail { node: k };
        let c = C::EMPTY
            .with_data_object_conflict(DataObjectConflict::remote("theirs"))
            .with_conflict_note(note)
            .with_conflict_note(ConflictNote::DeletePermissionFail { node: k });

        let no_doc = c.resolve_data_object_conflict();
        assert!(no_doc.data_object_conflict().is_none());
        assert_eq!(no_doc.notes().len(), 2);

        let no_note = c.resolve_conflict_note(&note);
        assert_eq!(
            no_note.data_object_conflict(),
            Some(&DataObjectConflict::remote("theirs"))
        );
        assert_eq!(
            no_note.notes(),
            &[ConflictNote::DeletePermissionFail { node: k }]
        );
    }

    #[test]
    fn merge_replaces_notes_per_key() {
        let (k1, k2) = (NodeKey::new(), NodeKey::new());
        let a = ConflictNote::UpdatePermissionFail { node: k1 };
        let b = ConflictNote::ConstraintViolation { node: k2 };
        let c = ConflictNote::ResurrectedLocalDelete { node: k1 };

        let c1 = C::new(None, [a, b]);
        let c2 = C::new(None, [c]);
        assert_eq!(c1.merge_from(&c2).notes(), &[b, c]);
    }

    #[test]
    fn merge_prefers_incoming_data_object_conflict() {
        let existing = C::EMPTY.with_data_object_conflict(DataObjectConflict::local("mine"));
        let incoming = C::EMPTY.with_data_object_conflict(DataObjectConflict::remote("theirs"));
        assert_eq!(
            existing.merge_from(&incoming).data_object_conflict(),
            Some(&DataObjectConflict::remote("theirs"))
        );

        let notes_only = C::EMPTY.with_conflict_note(ConflictNote::ConflictFolder {
            node: NodeKey::new(),
        });
        assert_eq!(
            existing.merge_from(&notes_only).data_object_conflict(),
            Some(&DataObjectConflict::local("mine"))
        );
    }

    #[test]
    fn merge_is_directional() {
        let k = NodeKey::new();
        let left = C::new(None, [ConflictNote::UpdatePermissionFail { node: k }]);
        let right = C::new(None, [ConflictNote::DeletePermissionFail { node: k }]);
        assert_ne!(left.merge_from(&right), right.merge_from(&left));
    }

    #[quickcheck]
    fn adding_a_note_twice_keeps_one(notes: Vec<ConflictNote>, note: ConflictNote) -> bool {
        let c = C::new(None, notes)
            .with_conflict_note(note)
            .with_conflict_note(note);
        c.notes().iter().filter(|n| **n == note).count() == 1
    }

    #[quickcheck]
    fn merging_with_empty_is_identity(notes: Vec<ConflictNote>) -> bool {
        let c = C::new(Some(DataObjectConflict::local("x")), notes);
        c.merge_from(&C::EMPTY) == c && C::EMPTY.merge_from(&c) == c
    }

    #[quickcheck]
    fn merged_notes_for_incoming_keys_come_from_incoming(
        existing: Vec<ConflictNote>,
        incoming: Vec<ConflictNote>,
    ) -> bool {
        let (existing, incoming) = (C::new(None, existing), C::new(None, incoming));
        let merged = existing.merge_from(&incoming);
        incoming.notes().iter().all(|n| {
            merged
                .notes_for(n.node_key())
                .eq(incoming.notes_for(n.node_key()))
        })
    }
}
