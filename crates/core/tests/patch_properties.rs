//! Property-based tests for structural patches.
//!
//! Properties verified:
//! 1. Applying a patch twice equals applying it once
//! 2. A patched document satisfies the patch
//! 3. Formatting a path and parsing it back yields the same path

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::collections::BTreeMap;

use driftwatch_core::{FieldPath, Patch};
use proptest::prelude::*;
use serde_json::{Value, json};

/// Documents whose keys never collide with patched keys.
fn document_strategy() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-m]{1,4}", "[a-z0-9]{0,6}", 0..6)
        .prop_map(|spec: BTreeMap<String, String>| json!({"kind": "ConfigMap", "spec": spec}))
}

fn patch_strategy() -> impl Strategy<Value = Patch> {
    prop::collection::vec(
        (
            prop::collection::vec("[n-z]{1,4}", 1..3),
            prop_oneof![
                any::<i32>().prop_map(|n| json!(n)),
                "[a-z]{0,6}".prop_map(|s| json!(s)),
            ],
        ),
        1..5,
    )
    .prop_map(|entries| {
        entries
            .into_iter()
            .filter_map(|(keys, value)| {
                FieldPath::parse(&format!("spec.{}", keys.join(".")))
                    .ok()
                    .map(|path| (path, value))
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_apply_is_idempotent(document in document_strategy(), patch in patch_strategy()) {
        let once = patch.applied_to(&document).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let twice = patch.applied_to(&once).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_patched_document_satisfies_patch(document in document_strategy(), patch in patch_strategy()) {
        let patched = patch.applied_to(&document).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert!(patch.is_satisfied_by(&patched));
        prop_assert_eq!(patched.get("kind"), document.get("kind"));
    }

    #[test]
    fn prop_path_display_parses_back(keys in prop::collection::vec("[a-z][a-z_]{0,6}", 1..5)) {
        let raw = keys.join(".");
        let path = FieldPath::parse(&raw).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(path.to_string(), raw.clone());
        let reparsed = FieldPath::parse(&path.to_string()).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(reparsed, path);
    }
}
