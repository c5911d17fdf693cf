// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Exact structural equality of opaque payloads.
//!
//! Node payloads ("data objects") are opaque to the tree. When two diverged copies of a node
//! carry payloads that happen to be equal, reporting a conflict would only bother the user, so
//! reconciliation asks [`DataObjectBlob::same`] first.
//!
//! The comparison serializes both sides into a canonical byte form and compares the bytes. The
//! value is lowered to a [`serde_json::Value`] before it is written, and object keys in a
//! `serde_json::Value` are kept sorted, so payloads holding hash maps compare equal regardless of
//! iteration order. Non-finite floats, which JSON cannot express, are written as tagged bit
//! patterns so that NaN and the infinities stay distinct. Sequences keep their order: a payload that stores a logical set in a `Vec`
//! with unstable ordering will still compare as different. Payloads that have a meaningful
//! [`PartialEq`] should be compared with it instead.
//!
//! This is `O(payload size)` and allocates a buffer per side, so callers should only reach for it
//! once a cheaper version check has flagged a divergence.
use serde::Serialize;

mod floats;

/// Canonical serialized form of a payload.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DataObjectBlob {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for DataObjectBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataObjectBlob({} bytes)", self.bytes.len())
    }
}

impl DataObjectBlob {
    /// The blob of a payload that could not be serialized.
    ///
    /// Every successfully serialized payload is at least one byte long, so this never equals the
    /// blob of a real payload.
    pub const EMPTY: Self = Self { bytes: Vec::new() };

    /// Serializes `obj` into its canonical form, or [`DataObjectBlob::EMPTY`] on failure.
    pub fn new<T>(obj: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        match canonical_bytes(obj) {
            Ok(bytes) => Self { bytes },
            Err(err) => {
                tracing::warn!(
                    payload = std::any::type_name::<T>(),
                    %err,
                    "data object is not serializable; comparing it as empty"
                );
                Self::EMPTY
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Compares against the blob of `obj` without keeping the latter around.
    pub fn same_as<T>(&self, obj: &T) -> bool
    where
        T: Serialize + ?Sized,
    {
        *self == DataObjectBlob::new(obj)
    }

    /// Returns true if `a` and `b` are content-identical.
    ///
    /// The same reference (or both absent) is trivially identical; exactly one absent never is.
    pub fn same<T>(a: Option<&T>, b: Option<&T>) -> bool
    where
        T: Serialize + ?Sized,
    {
        match (a, b) {
            (None, None) => true,
            (Some(_), None) | (None, Some(_)) => false,
            (Some(a), Some(b)) if std::ptr::eq(a, b) => true,
            (Some(a), Some(b)) => DataObjectBlob::new(a) == DataObjectBlob::new(b),
        }
    }
}

fn canonical_bytes<T>(obj: &T) -> serde_json::Result<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(floats::Tagged(obj))?;
    serde_json::to_vec(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    #[derive(Serialize)]
    struct Target {
        name: String,
        magnitude: f64,
        tags: HashMap<String, u32>,
    }

    fn target(order: &[(&str, u32)]) -> Target {
        Target {
            name: "M31".to_string(),
            magnitude: 3.44,
            tags: order.iter().map(|&(k, v)| (k.to_string(), v)).collect(),
        }
    }

    #[test]
    fn identical_reference_is_same() {
        let t = target(&[("a", 1)]);
        assert!(DataObjectBlob::same(Some(&t), Some(&t)));
    }

    #[test]
    fn absent_side_is_never_same() {
        let t = target(&[]);
        assert!(!DataObjectBlob::same(Some(&t), None));
        assert!(!DataObjectBlob::same(None, Some(&t)));
        assert!(DataObjectBlob::same::<Target>(None, None));
    }

    #[test]
    fn independently_built_payloads_are_same() {
        let pairs: Vec<_> = (0..64).map(|i| (format!("k{i}"), i)).collect();
        let forward: Vec<_> = pairs.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        let backward: Vec<_> = forward.iter().rev().copied().collect();
        assert!(DataObjectBlob::same(
            Some(&target(&forward)),
            Some(&target(&backward))
        ));
    }

    #[test]
    fn field_difference_is_detected() {
        let a = target(&[("a", 1)]);
        let b = target(&[("a", 2)]);
        assert!(!DataObjectBlob::same(Some(&a), Some(&b)));
    }

    #[test]
    fn unserializable_payload_is_empty() {
        // JSON object keys must be strings.
        let mut bad = BTreeMap::new();
        bad.insert((1, 2), "x");
        let blob = DataObjectBlob::new(&bad);
        assert_eq!(blob, DataObjectBlob::EMPTY);
        assert!(blob.is_empty());

        assert!(!DataObjectBlob::new(&()).is_empty());
        assert!(!DataObjectBlob::same(Some(&bad), Some(&BTreeMap::new())));
    }

    fn with_magnitude(magnitude: f64) -> Target {
        Target {
            magnitude,
            ..target(&[])
        }
    }

    #[test]
    fn non_finite_floats_stay_distinct() {
        let values = [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 0.0];
        for (i, a) in values.iter().enumerate() {
            for (j, b) in values.iter().enumerate() {
                assert_eq!(
                    DataObjectBlob::same(Some(&with_magnitude(*a)), Some(&with_magnitude(*b))),
                    i == j,
                    "{a} vs {b}"
                );
            }
        }
        let nan = DataObjectBlob::new(&with_magnitude(f64::NAN));
        assert!(!nan.is_empty());
        assert!(!nan.same_as(&Target {
            name: "M31".to_string(),
            magnitude: 0.0,
            tags: HashMap::new(),
        }));
    }

    #[test]
    fn non_finite_floats_inside_collections() {
        let a = vec![Some(1.5_f32), Some(f32::INFINITY)];
        let b = vec![Some(1.5_f32), Some(f32::NEG_INFINITY)];
        let c = vec![Some(1.5_f32), None];
        assert!(!DataObjectBlob::same(Some(&a), Some(&b)));
        assert!(!DataObjectBlob::same(Some(&a), Some(&c)));
        assert!(DataObjectBlob::same(Some(&a), Some(&a.clone())));

        let keyed: BTreeMap<&str, f64> = [("flux", f64::NAN)].into();
        let nulled: BTreeMap<&str, Option<f64>> = [("flux", None)].into();
        assert!(!DataObjectBlob::same_as(&DataObjectBlob::new(&keyed), &nulled));
    }

    #[test]
    fn cached_blob_compares() {
        let blob = DataObjectBlob::new(&target(&[("x", 9)]));
        assert!(blob.same_as(&target(&[("x", 9)])));
        assert!(!blob.same_as(&target(&[("x", 8)])));
    }
}
