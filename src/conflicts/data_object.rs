// (c) Copyright 2025 Helsing GmbH. All rights reserved.

/// Which side of a reconciliation a preserved payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum Perspective {
    Local,
    Remote,
}

impl Perspective {
    pub const fn opposite(self) -> Self {
        match self {
            Perspective::Local => Perspective::Remote,
            Perspective::Remote => Perspective::Local,
        }
    }
}

/// The payload version that lost during reconciliation, kept for inspection and undo.
#[derive(Debug, Clone, PartialEq)]
pub struct DataObjectConflict<D> {
    pub perspective: Perspective,
    pub data_object: D,
}

impl<D> DataObjectConflict<D> {
    pub fn new(perspective: Perspective, data_object: D) -> Self {
        Self {
            perspective,
            data_object,
        }
    }

    pub fn local(data_object: D) -> Self {
        Self::new(Perspective::Local, data_object)
    }

    pub fn remote(data_object: D) -> Self {
        Self::new(Perspective::Remote, data_object)
    }

    /// The same payload seen from the other side.
    pub fn opposite(self) -> Self {
        Self {
            perspective: self.perspective.opposite(),
            data_object: self.data_object,
        }
    }

    /// Swaps the preserved payload for `live`, flipping the perspective, and returns the payload
    /// that was preserved.
    pub(crate) fn swap(&mut self, live: D) -> D {
        self.perspective = self.perspective.opposite();
        std::mem::replace(&mut self.data_object, live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposite_flips_perspective_only() {
        let doc = DataObjectConflict::local("v1");
        let flipped = doc.clone().opposite();
        assert_eq!(flipped.perspective, Perspective::Remote);
        assert_eq!(flipped.data_object, "v1");
        assert_eq!(flipped.opposite(), doc);
    }

    #[test]
    fn swap_exchanges_payloads() {
        let mut doc = DataObjectConflict::remote("theirs");
        let out = doc.swap("ours");
        assert_eq!(out, "theirs");
        assert_eq!(doc, DataObjectConflict::local("ours"));
    }
}
