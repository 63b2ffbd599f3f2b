//! Structural patches over configuration documents.
//!
//! A [`Patch`] maps field paths to replacement values. Merging two patches is
//! a deep merge: non-overlapping branches combine and a later path overrides
//! any branch it overlaps. Applying a patch sets every path in ancestor-first
//! order, so applying the same patch twice never changes the document again.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::path::FieldPath;

/// Path to value mapping applied to a configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch {
    entries: BTreeMap<FieldPath, Value>,
}

impl Patch {
    /// Create an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// A patch setting a single path.
    pub fn single(path: FieldPath, value: Value) -> Self {
        let mut patch = Self::new();
        patch.insert(path, value);
        patch
    }

    /// Add `path = value`, overriding any overlapping branch already present.
    pub fn insert(&mut self, path: FieldPath, value: Value) {
        let ancestor = self
            .entries
            .keys()
            .find(|existing| existing.is_prefix_of(&path) && **existing != path)
            .cloned();

        if let Some(ancestor) = ancestor {
            let relative = FieldPath::from_segments(
                path.segments()
                    .get(ancestor.segments().len()..)
                    .map(<[_]>::to_vec)
                    .unwrap_or_default(),
            );
            let nested = self
                .entries
                .get_mut(&ancestor)
                .map(|branch| relative.set(branch, value.clone()));
            if matches!(nested, Some(Ok(_))) {
                return;
            }
            self.entries.remove(&ancestor);
        }

        self.entries
            .retain(|existing, _| !(path.is_prefix_of(existing) && *existing != path));
        self.entries.insert(path, value);
    }

    /// Deep-merge `other` into this patch; `other` wins on overlap.
    pub fn merge(&mut self, other: Self) {
        for (path, value) in other.entries {
            self.insert(path, value);
        }
    }

    /// Entries in ancestor-first order.
    pub fn entries(&self) -> impl Iterator<Item = (&FieldPath, &Value)> {
        self.entries.iter()
    }

    /// Patched paths.
    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.entries.keys()
    }

    /// Value set at `path`, if any.
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        self.entries.get(path)
    }

    /// Number of patched paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the patch sets nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keep only the entries whose path satisfies `keep`.
    #[must_use]
    pub fn filtered(&self, mut keep: impl FnMut(&FieldPath) -> bool) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(path, _)| keep(path))
                .map(|(path, value)| (path.clone(), value.clone()))
                .collect(),
        }
    }

    /// Apply in place. Returns whether the document changed.
    ///
    /// # Errors
    ///
    /// Returns an error when a path cannot be created inside the document.
    pub fn apply(&self, document: &mut Value) -> Result<bool> {
        self.entries
            .iter()
            .try_fold(false, |changed, (path, value)| {
                path.set(document, value.clone()).map(|set| changed || set)
            })
    }

    /// Apply to a copy of `document`.
    ///
    /// # Errors
    ///
    /// Returns an error when a path cannot be created inside the document.
    pub fn applied_to(&self, document: &Value) -> Result<Value> {
        let mut patched = document.clone();
        self.apply(&mut patched)?;
        Ok(patched)
    }

    /// Whether applying the patch would leave `document` untouched.
    pub fn is_satisfied_by(&self, document: &Value) -> bool {
        self.entries
            .iter()
            .all(|(path, value)| path.get(document) == Some(value))
    }

    /// The minimal nested document this patch represents.
    pub fn to_document(&self) -> Value {
        self.entries
            .iter()
            .fold(Value::Null, |mut document, (path, value)| {
                deep_merge(&mut document, path.nest(value.clone()));
                document
            })
    }
}

impl FromIterator<(FieldPath, Value)> for Patch {
    fn from_iter<I: IntoIterator<Item = (FieldPath, Value)>>(iter: I) -> Self {
        let mut patch = Self::new();
        for (path, value) in iter {
            patch.insert(path, value);
        }
        patch
    }
}

/// Deep-merge `overlay` into `target`.
///
/// Objects merge key by key. Arrays merge positionally, where a `null`
/// element in the overlay leaves the target element untouched. Any other
/// value replaces the target.
pub fn deep_merge(target: &mut Value, overlay: Value) {
    match (target, overlay) {
        (Value::Object(target), Value::Object(overlay)) => {
            for (key, value) in overlay {
                deep_merge(target.entry(key).or_insert(Value::Null), value);
            }
        }
        (Value::Array(target), Value::Array(overlay)) => {
            for (index, value) in overlay.into_iter().enumerate() {
                match target.get_mut(index) {
                    Some(slot) if !value.is_null() => deep_merge(slot, value),
                    Some(_) => {}
                    None => target.push(value),
                }
            }
        }
        (target, overlay) => *target = overlay,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;

    use super::*;

    fn path(raw: &str) -> FieldPath {
        FieldPath::parse(raw).unwrap()
    }

    #[test]
    fn test_apply_is_idempotent() {
        let patch = Patch::single(path("spec.replicas"), json!(3));
        let mut doc = json!({"spec": {"replicas": 5}});

        assert!(patch.apply(&mut doc).unwrap());
        let once = doc.clone();
        assert!(!patch.apply(&mut doc).unwrap());
        assert_eq!(doc, once);
    }

    #[test]
    fn test_merge_combines_disjoint_branches() {
        let mut patch = Patch::single(path("data.log_level"), json!("info"));
        patch.merge(Patch::single(path("data.timeout"), json!("30s")));

        assert_eq!(patch.len(), 2);
        assert_eq!(
            patch.to_document(),
            json!({"data": {"log_level": "info", "timeout": "30s"}})
        );
    }

    #[test]
    fn test_later_ancestor_overrides_branch() {
        let mut patch = Patch::single(path("data.log_level"), json!("debug"));
        patch.merge(Patch::single(path("data"), json!({"log_level": "info"})));

        assert_eq!(patch.len(), 1);
        assert_eq!(patch.get(&path("data")), Some(&json!({"log_level": "info"})));
    }

    #[test]
    fn test_later_descendant_lands_inside_ancestor() {
        let mut patch = Patch::single(path("data"), json!({"a": "1"}));
        patch.insert(path("data.b"), json!("2"));

        assert_eq!(patch.len(), 1);
        assert_eq!(patch.get(&path("data")), Some(&json!({"a": "1", "b": "2"})));
    }

    #[test]
    fn test_to_document_positions_array_elements() {
        let patch = Patch::single(path("spec.containers.0.image"), json!("nginx:1.25"));
        assert_eq!(
            patch.to_document(),
            json!({"spec": {"containers": [{"image": "nginx:1.25"}]}})
        );
    }

    #[test]
    fn test_deep_merge_keeps_untouched_array_elements() {
        let mut target = json!({"containers": [{"image": "a", "name": "x"}, {"image": "b"}]});
        deep_merge(&mut target, json!({"containers": [null, {"image": "c"}]}));
        assert_eq!(
            target,
            json!({"containers": [{"image": "a", "name": "x"}, {"image": "c"}]})
        );
    }

    #[test]
    fn test_is_satisfied_by() {
        let patch = Patch::single(path("spec.replicas"), json!(3));
        assert!(patch.is_satisfied_by(&json!({"spec": {"replicas": 3}})));
        assert!(!patch.is_satisfied_by(&json!({"spec": {}})));
    }

    #[test]
    fn test_serializes_as_path_map() {
        let patch = Patch::single(path("spec.replicas"), json!(3));
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({"spec.replicas": 3})
        );
    }
}
