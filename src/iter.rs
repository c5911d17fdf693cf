// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use crate::{DataObject, key::NodeKey, node::NodeKind, tree::ProgramTree};
use std::{fmt, iter::FusedIterator};

/// Walks every observation below a node, depth first, children in stored order.
///
/// Containers (programs, groups, template folders and groups, conflict folders) are flattened.
/// An observation yields itself and is not descended into. Components yield nothing.
///
/// The iterator borrows the tree, so the tree cannot change while it is alive. Across threads,
/// hold the program read lock for as long as the iteration runs. Create a new iterator to walk
/// again.
pub struct ObservationIter<'a, D> {
    tree: &'a ProgramTree<D>,
    stack: Vec<NodeKey>,
}

impl<D> fmt::Debug for ObservationIter<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationIter")
            .field("pending", &self.stack)
            .finish_non_exhaustive()
    }
}

impl<'a, D: DataObject> ObservationIter<'a, D> {
    pub(crate) fn new(tree: &'a ProgramTree<D>, from: NodeKey) -> Self {
        Self {
            tree,
            stack: vec![from],
        }
    }
}

impl<D: DataObject> Iterator for ObservationIter<'_, D> {
    type Item = NodeKey;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(key) = self.stack.pop() {
            let Some(node) = self.tree.node(key) else {
                continue;
            };
            match node.kind() {
                NodeKind::Observation => return Some(key),
                kind if kind.holds_observations() => {
                    self.stack.extend(node.children().iter().rev().copied());
                }
                _ => {}
            }
        }
        None
    }
}

impl<D: DataObject> FusedIterator for ObservationIter<'_, D> {}
