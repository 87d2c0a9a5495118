//! JSON diff and patch (RFC 6902) plus the delta wire record

use json_patch::Patch;
use mbus_core::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Patch operations turning `source` into `target`
#[must_use]
pub fn json_diff(source: &Value, target: &Value) -> Patch {
    json_patch::diff(source, target)
}

/// Apply `patch` to a copy of `source`
///
/// # Errors
/// Returns error if an operation does not fit the document
pub fn json_apply_patch(source: &Value, patch: &Patch) -> Result<Value, json_patch::PatchError> {
    let mut document = source.clone();
    json_patch::patch(&mut document, &patch.0)?;
    Ok(document)
}

/// Patch plus the timestamps it is ordered by
///
/// `current_timestamp` is the baseline: the timestamp of the snapshot the
/// patch was computed against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonDelta {
    pub operations: Patch,
    pub timestamp: Timestamp,
    #[serde(rename = "current timestamp")]
    pub current_timestamp: Timestamp,
}

impl JsonDelta {
    /// Delta from `source` to `target` against `baseline`
    #[must_use]
    pub fn between(source: &Value, target: &Value, timestamp: Timestamp, baseline: Timestamp) -> Self {
        Self {
            operations: json_diff(source, target),
            timestamp,
            current_timestamp: baseline,
        }
    }

    /// Whether the patch changes nothing
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn diff_then_patch_restores_target() {
        let a = json!({"name": "A", "tags": ["x"], "size": 1});
        let b = json!({"name": "B", "tags": ["x", "y"]});
        let patch = json_diff(&a, &b);
        assert_eq!(json_apply_patch(&a, &patch).unwrap(), b);
    }

    #[test]
    fn identical_documents_diff_to_nothing() {
        let a = json!({"name": "A"});
        assert!(json_diff(&a, &a).0.is_empty());
    }

    #[test]
    fn patch_on_wrong_document_fails() {
        let patch: Patch = serde_json::from_value(json!([
            {"op": "remove", "path": "/missing"}
        ]))
        .unwrap();
        assert!(json_apply_patch(&json!({}), &patch).is_err());
    }

    #[test]
    fn delta_wire_names() {
        let delta = JsonDelta::between(
            &json!({"name": "A"}),
            &json!({"name": "B"}),
            "2025-11-27-10-00-01-00".parse().unwrap(),
            "2025-11-27-10-00-00-00".parse().unwrap(),
        );
        let wire = serde_json::to_value(&delta).unwrap();
        assert_eq!(wire["timestamp"], "2025-11-27-10-00-01-00");
        assert_eq!(wire["current timestamp"], "2025-11-27-10-00-00-00");
        assert_eq!(
            wire["operations"],
            json!([{"op": "replace", "path": "/name", "value": "B"}])
        );
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i32>().prop_map(Value::from),
            "[a-z~/]{0,6}".prop_map(Value::from),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z~/]{1,4}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn patch_of_diff_is_identity(a in arb_json(), b in arb_json()) {
            let patch = json_diff(&a, &b);
            prop_assert_eq!(json_apply_patch(&a, &patch).unwrap(), b);
        }
    }
}
