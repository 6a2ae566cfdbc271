//! Two-way JSON merge patches
//!
//! Writes against live objects are expressed as RFC 7386 merge patches
//! computed from the object as the caller observed it and the object as the
//! caller wants it. The observed `resourceVersion` is pinned into the patch,
//! which turns it into a conditional update: the API server answers 409 if
//! the object changed in between.

use crate::error::Result;
use serde::Serialize;
use serde_json::{Map, Value};

/// Compute the merge patch that turns `original` into `updated`
pub fn diff(original: &Value, updated: &Value) -> Value {
    match (original, updated) {
        (Value::Object(from), Value::Object(to)) => {
            let mut patch = Map::new();

            for key in from.keys() {
                if !to.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }

            for (key, new_value) in to {
                match from.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value) if old_value.is_object() && new_value.is_object() => {
                        let nested = diff(old_value, new_value);
                        if nested.as_object().map_or(true, |m| !m.is_empty()) {
                            patch.insert(key.clone(), nested);
                        }
                    }
                    _ => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }

            Value::Object(patch)
        }
        (_, to) => to.clone(),
    }
}

/// Apply a merge patch in place
pub fn apply(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }

    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                let slot = target_map.entry(key.clone()).or_insert(Value::Null);
                apply(slot, value);
            }
        }
    }
}

/// Build a conditional merge patch between two versions of a resource.
///
/// Returns `None` when the two versions serialize identically.
pub fn conditional<K: Serialize>(original: &K, updated: &K) -> Result<Option<Value>> {
    let from = serde_json::to_value(original)?;
    let to = serde_json::to_value(updated)?;

    let mut patch = diff(&from, &to);
    if patch.as_object().map_or(false, |m| m.is_empty()) {
        return Ok(None);
    }

    let resource_version = from
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .map(str::to_string);

    if let (Some(rv), Value::Object(map)) = (resource_version, &mut patch) {
        let metadata = map
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(meta) = metadata {
            meta.insert("resourceVersion".into(), Value::String(rv));
        }
    }

    Ok(Some(patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PersistentVolume;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    #[test]
    fn test_diff_removes_and_changes() {
        let original = json!({
            "metadata": {"annotations": {"keep": "1", "drop": "2"}, "name": "pv1"},
            "spec": {"x": 1}
        });
        let updated = json!({
            "metadata": {"annotations": {"keep": "1"}, "name": "pv1"},
            "spec": {"x": 2}
        });

        assert_eq!(
            diff(&original, &updated),
            json!({"metadata": {"annotations": {"drop": null}}, "spec": {"x": 2}})
        );
    }

    #[test]
    fn test_apply_reverses_diff() {
        let original = json!({
            "metadata": {"finalizers": ["kubernetes.io/pv-protection"], "labels": {"a": "b"}},
            "status": {"phase": "Bound"}
        });
        let updated = json!({
            "metadata": {"finalizers": [], "labels": {"a": "b"}},
            "status": {"phase": "Bound"}
        });

        let patch = diff(&original, &updated);
        let mut target = original.clone();
        apply(&mut target, &patch);
        assert_eq!(target, updated);
    }

    #[test]
    fn test_conditional_pins_resource_version() {
        let original = PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pv1".into()),
                resource_version: Some("42".into()),
                finalizers: Some(vec!["kubernetes.io/pv-protection".into()]),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut updated = original.clone();
        updated.metadata.finalizers = Some(vec![]);

        let patch = conditional(&original, &updated).unwrap().unwrap();
        assert_eq!(
            patch,
            json!({"metadata": {"finalizers": [], "resourceVersion": "42"}})
        );

        assert!(conditional(&original, &original).unwrap().is_none());
    }
}
