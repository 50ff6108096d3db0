//! # Client
//!
//! Typed facade over an [`ObjectStore`]. Objects are converted to and from
//! [`DynamicObject`] through serde so one store implementation serves every
//! kind.

use crate::controller::store::{KubeStore, Labels, ObjectStore, StoreError};
use kube::core::{ApiResource, DynamicObject, TypeMeta};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// A Kubernetes object the client can read and write
pub trait Object: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync {}

impl<K> Object for K where K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync {}

#[derive(Clone, Debug)]
pub struct Client {
    store: Arc<dyn ObjectStore>,
}

impl Client {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Client talking to the API server
    #[must_use]
    pub fn kube(client: kube::Client) -> Self {
        Self::new(Arc::new(KubeStore::new(client)))
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        let object = self.store.get(&resource::<K>(), namespace, name).await?;
        from_dynamic(object)
    }

    /// Like [`Client::get`], with not-found mapped to `None`
    pub async fn get_opt<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        match self.get(namespace, name).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list<K: Object>(&self, namespace: &str, labels: &Labels) -> Result<Vec<K>, StoreError> {
        self.store
            .list(&resource::<K>(), namespace, labels)
            .await?
            .into_iter()
            .map(from_dynamic)
            .collect()
    }

    pub async fn create<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        let created = self.store.create(&resource::<K>(), &to_dynamic(object)?).await?;
        from_dynamic(created)
    }

    pub async fn update<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        let updated = self.store.update(&resource::<K>(), &to_dynamic(object)?).await?;
        from_dynamic(updated)
    }

    /// Write status; `None` when the stored status already matched
    pub async fn update_status<K: Object>(&self, object: &K) -> Result<Option<K>, StoreError> {
        self.store
            .update_status(&resource::<K>(), &to_dynamic(object)?)
            .await?
            .map(from_dynamic)
            .transpose()
    }

    pub async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.store.delete(&resource::<K>(), namespace, name).await
    }
}

/// Type information for kind `K`
#[must_use]
pub fn resource<K: Resource<DynamicType = ()>>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

/// Untype an object, filling in apiVersion and kind
pub fn to_dynamic<K: Object>(object: &K) -> Result<DynamicObject, StoreError> {
    let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(object)?)?;
    if dynamic.types.is_none() {
        dynamic.types = Some(TypeMeta {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
        });
    }
    Ok(dynamic)
}

pub fn from_dynamic<K: Object>(object: DynamicObject) -> Result<K, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::store::MemoryStore;
    use crate::crd::{Function, FunctionSpec};
    use k8s_openapi::api::core::v1::ConfigMap;

    #[tokio::test]
    async fn test_typed_round_trip_through_store() {
        let client = Client::new(Arc::new(MemoryStore::new()));
        let mut function = Function::new(
            "square",
            FunctionSpec {
                image: "_".to_string(),
                ..FunctionSpec::default()
            },
        );
        function.metadata.namespace = Some("default".to_string());

        let created = client.create(&function).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_eq!(created.spec, function.spec);

        let fetched: Function = client.get("default", "square").await.unwrap();
        assert_eq!(fetched.metadata.uid, created.metadata.uid);
    }

    #[tokio::test]
    async fn test_get_opt_maps_not_found() {
        let client = Client::new(Arc::new(MemoryStore::new()));
        let missing: Option<ConfigMap> = client.get_opt("default", "riff-build").await.unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_to_dynamic_sets_type_meta() {
        let config_map = ConfigMap::default();
        let dynamic = to_dynamic(&config_map).unwrap();
        let types = dynamic.types.unwrap();
        assert_eq!(types.kind, "ConfigMap");
        assert_eq!(types.api_version, "v1");
    }
}
