//! # Kubernetes Store
//!
//! [`ObjectStore`] backed by the API server.
//!
//! Status writes are sent as a JSON merge patch against the status
//! subresource. The patch carries only the changed status fields plus the
//! object's resourceVersion, so a stale write is rejected with 409 instead
//! of overwriting a concurrent update.

use super::{selector_string, Labels, ObjectStore, StoreError};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use serde_json::{json, Map, Value};
use tracing::debug;

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Cluster-scoped kinds are addressed with an empty namespace
    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, resource)
        }
    }
}

fn name_of(object: &DynamicObject) -> &str {
    object
        .metadata
        .name
        .as_deref()
        .or(object.metadata.generate_name.as_deref())
        .unwrap_or_default()
}

fn namespace_of(object: &DynamicObject) -> &str {
    object.metadata.namespace.as_deref().unwrap_or_default()
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, StoreError> {
        self.api(resource, namespace)
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(e, &resource.kind, name, false))
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        labels: &Labels,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let params = ListParams::default().labels(&selector_string(labels));
        let list = self
            .api(resource, namespace)
            .list(&params)
            .await
            .map_err(|e| StoreError::from_kube(e, &resource.kind, "", false))?;
        Ok(list.items)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let name = name_of(object);
        self.api(resource, namespace_of(object))
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| StoreError::from_kube(e, &resource.kind, name, true))
    }

    async fn update(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let name = name_of(object);
        self.api(resource, namespace_of(object))
            .replace(name, &PostParams::default(), object)
            .await
            .map_err(|e| StoreError::from_kube(e, &resource.kind, name, false))
    }

    async fn update_status(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<Option<DynamicObject>, StoreError> {
        let name = name_of(object);
        let api = self.api(resource, namespace_of(object));
        let current = api
            .get_status(name)
            .await
            .map_err(|e| StoreError::from_kube(e, &resource.kind, name, false))?;

        let empty = Value::Object(Map::new());
        let before = current.data.get("status").unwrap_or(&empty);
        let after = object.data.get("status").unwrap_or(&empty);
        let diff = merge_patch_diff(before, after);
        if diff.as_object().is_some_and(Map::is_empty) {
            debug!(resource.kind = %resource.kind, resource.name = name, "Status already current on server");
            return Ok(None);
        }

        let patch = json!({
            "metadata": { "resourceVersion": object.metadata.resource_version },
            "status": diff,
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(Some)
            .map_err(|e| StoreError::from_kube(e, &resource.kind, name, false))
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        self.api(resource, namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(e, &resource.kind, name, false))
    }
}

/// RFC 7386 merge patch turning `from` into `to`
///
/// Removed keys become `null`. Arrays and scalars are replaced whole. An
/// empty object means nothing changed.
#[must_use]
pub fn merge_patch_diff(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(before), Value::Object(after)) => {
            let mut patch = Map::new();
            for (key, value) in after {
                match before.get(key) {
                    Some(old) if old == value => {}
                    Some(old @ Value::Object(_)) if value.is_object() => {
                        patch.insert(key.clone(), merge_patch_diff(old, value));
                    }
                    _ => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in before.keys() {
                if !after.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => to.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_status_gives_empty_patch() {
        let status = json!({"observedGeneration": 2, "conditions": [{"type": "Ready", "status": "True"}]});
        assert_eq!(merge_patch_diff(&status, &status), json!({}));
    }

    #[test]
    fn test_changed_and_removed_fields() {
        let before = json!({
            "observedGeneration": 1,
            "latestImage": "registry.example.com/square@sha256:1",
            "buildCacheRef": {"kind": "PersistentVolumeClaim", "name": "square-build-cache"}
        });
        let after = json!({
            "observedGeneration": 2,
            "buildCacheRef": {"kind": "PersistentVolumeClaim", "name": "square-build-cache"},
            "targetImage": "registry.example.com/square"
        });
        assert_eq!(
            merge_patch_diff(&before, &after),
            json!({
                "observedGeneration": 2,
                "latestImage": null,
                "targetImage": "registry.example.com/square"
            })
        );
    }

    #[test]
    fn test_nested_objects_are_diffed_and_arrays_replaced() {
        let before = json!({"address": {"url": "http://a"}, "conditions": [{"type": "A"}]});
        let after = json!({"address": {"url": "http://b"}, "conditions": [{"type": "A"}, {"type": "B"}]});
        assert_eq!(
            merge_patch_diff(&before, &after),
            json!({"address": {"url": "http://b"}, "conditions": [{"type": "A"}, {"type": "B"}]})
        );
    }
}
