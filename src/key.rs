// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Identifiers
//!
//! Every node in a program tree is addressed by a [`NodeKey`]. Two nodes are the same logical
//! node iff their keys are equal, independent of their content, which is what allows two
//! diverged copies of a program to be lined up and reconciled later.
//!
//! - **[`NodeKey`]**: a 128-bit [ULID](https://github.com/ulid/spec), drawn fresh for every node
//!   and echoed verbatim when a tree is rebuilt from a serialized form.
//! - **[`LifespanId`]**: names one editing-session axis of a
//!   [`VersionVector`](crate::VersionVector).
//! - **[`ProcessId`]**: names the live object graph a node was created in. Structural edits are
//!   only allowed on nodes that are local to the tree's process.
//! - **[`ProgramId`]**: the external, human-facing id carried by a program root.
use std::{fmt, str::FromStr, sync::OnceLock};
use ulid::Ulid;

/// Globally unique, totally ordered identity of a tree node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[repr(transparent)]
pub struct NodeKey(Ulid);

impl NodeKey {
    /// Draws a fresh key.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Reconstructs a key from its raw bits, for example when deserializing a tree.
    pub const fn from_u128(bits: u128) -> Self {
        Self(Ulid(bits))
    }

    pub const fn as_u128(&self) -> u128 {
        self.0.0
    }
}

impl Default for NodeKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for NodeKey {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Scopes the session axis of a version vector.
///
/// Each process instance editing a program does so under its own lifespan id, so that edits made
/// by different instances land in different entries of the node's version vector.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct LifespanId(Ulid);

impl LifespanId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub const fn from_u128(bits: u128) -> Self {
        Self(Ulid(bits))
    }
}

impl Default for LifespanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LifespanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "~{}", self.0)
    }
}

/// Identifies the live object graph (process) that created a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(Ulid);

impl ProcessId {
    /// Mints an id for some other process, for example one a tree was received from.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// The id of the current process. Stable for the process lifetime.
    pub fn current() -> Self {
        static CURRENT: OnceLock<ProcessId> = OnceLock::new();
        *CURRENT.get_or_init(ProcessId::new)
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// External id of a program, such as `GS-2024A-Q-1`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ProgramId(String);

impl ProgramId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProgramId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn fresh_keys_are_distinct() {
        let keys: HashSet<NodeKey> = (0..10_000).map(|_| NodeKey::new()).collect();
        assert_eq!(keys.len(), 10_000);
    }

    #[quickcheck]
    fn raw_bits_round_trip(bits: u128) -> bool {
        NodeKey::from_u128(bits).as_u128() == bits
    }

    #[quickcheck]
    fn display_parses_back(key: NodeKey) -> bool {
        key.to_string().parse::<NodeKey>().ok() == Some(key)
    }

    #[quickcheck]
    fn ordering_follows_bits(a: u128, b: u128) -> bool {
        NodeKey::from_u128(a).cmp(&NodeKey::from_u128(b)) == a.cmp(&b)
    }

    #[test]
    fn current_process_is_stable() {
        assert_eq!(ProcessId::current(), ProcessId::current());
        assert_ne!(ProcessId::current(), ProcessId::new());
    }
}
