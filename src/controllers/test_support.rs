//! Shared fixtures for reconciler unit tests

use crate::config::ControllerConfig;
use crate::controller::client::{from_dynamic, resource, to_dynamic, Client, Object};
use crate::controller::events::{EventRecorder, MemoryRecorder};
use crate::controller::reconciler::Context;
use crate::controller::store::{MemoryStore, ObjectStore};
use crate::controller::tracker::Tracker;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const NAMESPACE: &str = "default";

#[derive(Debug)]
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub recorder: Arc<MemoryRecorder>,
    pub tracker: Arc<Tracker>,
    pub ctx: Context,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(MemoryRecorder::new());
        let tracker = Arc::new(Tracker::new());
        let dyn_store: Arc<dyn ObjectStore> = Arc::<MemoryStore>::clone(&store);
        let ctx = Context::new(
            Client::new(dyn_store),
            Arc::clone(&tracker),
            Arc::clone(&recorder) as Arc<dyn EventRecorder>,
            ControllerConfig::default(),
        );
        Self {
            store,
            recorder,
            tracker,
            ctx,
        }
    }

    pub fn seed<K: Object>(&self, object: &K) {
        self.store.seed(&resource::<K>(), to_dynamic(object).unwrap());
    }

    pub fn get<K: Object>(&self, name: &str) -> Option<K> {
        self.store
            .object(&resource::<K>(), NAMESPACE, name)
            .map(|o| from_dynamic(o).unwrap())
    }

    pub fn all<K: Object>(&self) -> Vec<K> {
        self.store
            .objects(&resource::<K>())
            .into_iter()
            .map(|o| from_dynamic(o).unwrap())
            .collect()
    }

    /// Seed the `riff-build` ConfigMap with a default image prefix
    pub fn seed_image_prefix(&self, prefix: &str) {
        self.seed(&ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.ctx.config.build_config_map_name.clone()),
                namespace: Some(NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([(
                crate::constants::DEFAULT_IMAGE_PREFIX_KEY.to_string(),
                prefix.to_string(),
            )])),
            ..ConfigMap::default()
        });
    }
}

/// Metadata for a parent in the test namespace
pub fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        ..ObjectMeta::default()
    }
}
