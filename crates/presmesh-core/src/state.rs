//! Per-connection advertised state and shallow patch merging.

use serde_json::Value;

/// A connection's advertised state: an arbitrary JSON object.
pub type StateMap = serde_json::Map<String, Value>;

/// Shallow-merge `patch` over `base`.
///
/// Each key in `patch` replaces its counterpart in `base`. A patch value of
/// JSON `null` deletes the key: `null` is the only sentinel a JSON wire can
/// carry losslessly, so it gets the single useful meaning. An empty patch
/// returns `base` unchanged.
pub fn merge_patch(base: &StateMap, patch: &StateMap) -> StateMap {
    let mut merged = base.clone();
    for (k, v) in patch {
        if v.is_null() {
            merged.remove(k);
        } else {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Deep value inequality between two states.
///
/// `serde_json::Map` equality is structural, which is exactly the "changed"
/// notion heartbeats report.
pub fn state_changed(before: &StateMap, after: &StateMap) -> bool {
    before != after
}
