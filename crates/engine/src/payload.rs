use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::ObjectMeta;
use reflector_kubehub::WatchedResource;
use serde::Serialize;
use serde_json::{Map, Value};

/// Kind-specific payload of a mirrored object: what gets copied, and how a reflection is updated.
pub trait ReflectedPayload: WatchedResource + Serialize {
    /// Fresh object holding only the payload; metadata is filled in by the engine.
    fn clone_payload(&self) -> Self;

    /// Replace `target`'s payload with this object's.
    fn configure_patch(&self, target: &Self, patch: &mut PatchBuilder);
}

impl ReflectedPayload for ConfigMap {
    fn clone_payload(&self) -> Self {
        ConfigMap {
            metadata: ObjectMeta::default(),
            data: self.data.clone(),
            binary_data: self.binary_data.clone(),
            ..Default::default()
        }
    }

    fn configure_patch(&self, target: &Self, patch: &mut PatchBuilder) {
        patch.replace_map("data", self.data.as_ref(), target.data.as_ref());
        patch.replace_map("binaryData", self.binary_data.as_ref(), target.binary_data.as_ref());
    }
}

impl ReflectedPayload for Secret {
    // Type is immutable on the server, so it is copied at creation only.
    fn clone_payload(&self) -> Self {
        Secret {
            metadata: ObjectMeta::default(),
            type_: self.type_.clone(),
            data: self.data.clone(),
            ..Default::default()
        }
    }

    fn configure_patch(&self, target: &Self, patch: &mut PatchBuilder) {
        patch.replace_map("data", self.data.as_ref(), target.data.as_ref());
    }
}

/// Accumulates a JSON merge patch for one reflection.
///
/// Merge patches only add or overwrite keys, so replacing a map means sending `null`
/// for every key the target has and the source lacks.
#[derive(Debug, Default, Clone)]
pub struct PatchBuilder {
    annotations: BTreeMap<String, String>,
    fields: Map<String, Value>,
}

impl PatchBuilder {
    pub fn merge_annotations(&mut self, annotations: BTreeMap<String, String>) {
        self.annotations.extend(annotations);
    }

    pub fn replace_map<V: Serialize>(
        &mut self,
        field: &str,
        source: Option<&BTreeMap<String, V>>,
        target: Option<&BTreeMap<String, V>>,
    ) {
        let Some(source) = source else {
            self.fields.insert(field.to_string(), Value::Null);
            return;
        };
        let mut entries = Map::new();
        for (k, v) in source {
            if let Ok(v) = serde_json::to_value(v) {
                entries.insert(k.clone(), v);
            }
        }
        for k in target.into_iter().flat_map(|t| t.keys()) {
            if !source.contains_key(k) {
                entries.insert(k.clone(), Value::Null);
            }
        }
        self.fields.insert(field.to_string(), Value::Object(entries));
    }

    pub fn build(&self) -> Value {
        let mut root = self.fields.clone();
        if !self.annotations.is_empty() {
            let annotations: Map<String, Value> =
                self.annotations.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect();
            root.insert("metadata".into(), serde_json::json!({ "annotations": annotations }));
        }
        Value::Object(root)
    }
}
