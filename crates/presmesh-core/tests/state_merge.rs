//! Shallow patch-merge semantics.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use presmesh_core::state::{merge_patch, state_changed, StateMap};
use serde_json::json;

fn obj(v: serde_json::Value) -> StateMap {
    match v {
        serde_json::Value::Object(m) => m,
        _ => panic!("vector must be an object"),
    }
}

#[test]
fn patch_replaces_only_named_keys() {
    let base = obj(json!({"mic": true, "camera": false}));
    let patch = obj(json!({"camera": true}));
    let merged = merge_patch(&base, &patch);
    assert_eq!(merged, obj(json!({"mic": true, "camera": true})));
    assert!(state_changed(&base, &merged));
}

#[test]
fn empty_patch_is_identity() {
    let base = obj(json!({"mic": true}));
    let merged = merge_patch(&base, &StateMap::new());
    assert_eq!(merged, base);
    assert!(!state_changed(&base, &merged));
}

#[test]
fn null_deletes_the_key() {
    let base = obj(json!({"mic": true, "hand": "raised"}));
    let merged = merge_patch(&base, &obj(json!({"hand": null})));
    assert_eq!(merged, obj(json!({"mic": true})));
}

#[test]
fn null_for_absent_key_is_a_noop() {
    let base = obj(json!({"mic": true}));
    let merged = merge_patch(&base, &obj(json!({"hand": null})));
    assert_eq!(merged, base);
    assert!(!state_changed(&base, &merged));
}

#[test]
fn nested_values_replace_wholesale() {
    // Shallow merge: nested objects are values, not merge targets.
    let base = obj(json!({"av": {"mic": true, "camera": true}}));
    let patch = obj(json!({"av": {"mic": false}}));
    let merged = merge_patch(&base, &patch);
    assert_eq!(merged, obj(json!({"av": {"mic": false}})));
}

#[test]
fn repeated_patch_reports_unchanged() {
    let base = obj(json!({"mic": true, "camera": false}));
    let patch = obj(json!({"camera": true}));
    let once = merge_patch(&base, &patch);
    let twice = merge_patch(&once, &patch);
    assert!(state_changed(&base, &once));
    assert!(!state_changed(&once, &twice));
}
