// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Implementation of the quickcheck::Arbitrary trait for keys, versions and conflict notes.

use crate::{
    conflicts::{ConflictNote, Perspective},
    key::{LifespanId, NodeKey},
    version::VersionVector,
};
use quickcheck::{Arbitrary, Gen};

impl Arbitrary for NodeKey {
    fn arbitrary(g: &mut Gen) -> Self {
        // Skew the distribution towards a handful of keys. Notes about the same node are where
        // conflict merging gets interesting.
        let choices = [1, 1, 1, 2, 2, 3, 4, u128::arbitrary(g).saturating_add(5)];
        Self::from_u128(*g.choose(&choices).unwrap())
    }
}

impl Arbitrary for LifespanId {
    fn arbitrary(g: &mut Gen) -> Self {
        // Few sessions, so that vectors overlap and compare in all possible ways.
        let choices = [1, 1, 2, 2, 3, u128::arbitrary(g).saturating_add(4)];
        Self::from_u128(*g.choose(&choices).unwrap())
    }
}

impl Arbitrary for VersionVector {
    fn arbitrary(g: &mut Gen) -> Self {
        let len = usize::arbitrary(g) % 4;
        (0..len)
            .map(|_| {
                let clock_choices = [0, 1, 1, 2, 3, u64::from(u8::arbitrary(g))];
                (LifespanId::arbitrary(g), *g.choose(&clock_choices).unwrap())
            })
            .collect()
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let clocks: Vec<_> = self.iter().collect();
        Box::new(clocks.shrink().map(|c| c.into_iter().collect()))
    }
}

impl Arbitrary for Perspective {
    fn arbitrary(g: &mut Gen) -> Self {
        *g.choose(&[Perspective::Local, Perspective::Remote]).unwrap()
    }
}

impl Arbitrary for ConflictNote {
    fn arbitrary(g: &mut Gen) -> Self {
        let node = NodeKey::arbitrary(g);
        match *g
            .choose(&[
                "moved",
                "resurrected",
                "replaced",
                "create",
                "update",
                "delete",
                "constraint",
                "folder",
            ])
            .unwrap()
        {
            "moved" => ConflictNote::Moved {
                node,
                to: NodeKey::arbitrary(g),
            },
            "resurrected" => ConflictNote::ResurrectedLocalDelete { node },
            "replaced" => ConflictNote::ReplacedRemoteDelete { node },
            "create" => ConflictNote::CreatePermissionFail { node },
            "update" => ConflictNote::UpdatePermissionFail { node },
            "delete" => ConflictNote::DeletePermissionFail { node },
            "constraint" => ConflictNote::ConstraintViolation { node },
            "folder" => ConflictNote::ConflictFolder { node },
            _ => unreachable!(),
        }
    }
}
