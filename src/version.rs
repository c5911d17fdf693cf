// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Version Vectors
//!
//! Each node carries a [`VersionVector`]: a map from [`LifespanId`] (an editing session) to a
//! monotonically increasing counter. Every mutation of a node increments the entry of the session
//! that performed it. Comparing the vectors of two copies of the same node tells whether one copy
//! has seen every edit the other has (it dominates), whether they are identical, or whether both
//! sides edited independently (they are concurrent, and a merge is needed).
use crate::key::LifespanId;
use std::{cmp::Ordering, collections::BTreeMap, fmt};

/// Per-session edit counters of a single node.
///
/// Entries are never zero; a session that never edited the node is simply absent.
#[derive(Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct VersionVector {
    clocks: BTreeMap<LifespanId, u64>,
}

impl fmt::Debug for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VersionVector").field(&self.clocks).finish()
    }
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter recorded for `id`, zero if the session never edited the node.
    pub fn get(&self, id: LifespanId) -> u64 {
        self.clocks.get(&id).copied().unwrap_or(0)
    }

    /// Records one more edit by `id`, returning the new counter.
    pub fn increment(&mut self, id: LifespanId) -> u64 {
        let clock = self.clocks.entry(id).or_insert(0);
        *clock += 1;
        *clock
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LifespanId, u64)> + '_ {
        self.clocks.iter().map(|(&id, &clock)| (id, clock))
    }

    /// Takes the pointwise maximum of `self` and `other`.
    pub fn join(&mut self, other: &VersionVector) {
        for (&id, &clock) in &other.clocks {
            let ours = self.clocks.entry(id).or_insert(0);
            *ours = (*ours).max(clock);
        }
    }

    /// Like [`VersionVector::join`], but leaves `self` untouched.
    pub fn joined(&self, other: &VersionVector) -> VersionVector {
        let mut out = self.clone();
        out.join(other);
        out
    }

    /// Returns true if `self` has seen every edit `other` has, and at least one more.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        self.partial_cmp(other) == Some(Ordering::Greater)
    }

    /// Returns true if `self` has seen every edit `other` has.
    pub fn covers(&self, other: &VersionVector) -> bool {
        matches!(
            self.partial_cmp(other),
            Some(Ordering::Greater | Ordering::Equal)
        )
    }

    /// Returns true if both sides have edits the other has not seen.
    pub fn concurrent_with(&self, other: &VersionVector) -> bool {
        self.partial_cmp(other).is_none()
    }
}

impl PartialOrd for VersionVector {
    /// - `Some(Ordering::Equal)` if both recorded exactly the same edits
    /// - `Some(Ordering::Less)` if `other` dominates `self`
    /// - `Some(Ordering::Greater)` if `self` dominates `other`
    /// - `None` if the two are concurrent
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let mut ours = self.clocks.iter().peekable();
        let mut theirs = other.clocks.iter().peekable();
        let (mut o_ahead, mut t_ahead) = (false, false);
        loop {
            if o_ahead && t_ahead {
                return None;
            }
            match (ours.peek(), theirs.peek()) {
                (None, None) => break,
                (None, Some(_)) => {
                    t_ahead = true;
                    break;
                }
                (Some(_), None) => {
                    o_ahead = true;
                    break;
                }
                (Some((o_id, o_clock)), Some((t_id, t_clock))) => match o_id.cmp(t_id) {
                    Ordering::Equal => {
                        match o_clock.cmp(t_clock) {
                            Ordering::Equal => (),
                            Ordering::Less => t_ahead = true,
                            Ordering::Greater => o_ahead = true,
                        }
                        ours.next();
                        theirs.next();
                    }
                    // we have a session they have never seen
                    Ordering::Less => {
                        o_ahead = true;
                        ours.next();
                    }
                    Ordering::Greater => {
                        t_ahead = true;
                        theirs.next();
                    }
                },
            }
        }
        match (o_ahead, t_ahead) {
            (true, true) => None,
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => Some(Ordering::Equal),
        }
    }
}

impl FromIterator<(LifespanId, u64)> for VersionVector {
    fn from_iter<T: IntoIterator<Item = (LifespanId, u64)>>(iter: T) -> Self {
        let mut vv = VersionVector::new();
        for (id, clock) in iter {
            if clock > 0 {
                let ours = vv.clocks.entry(id).or_insert(0);
                *ours = (*ours).max(clock);
            }
        }
        vv
    }
}
