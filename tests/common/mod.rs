//! Shared fixtures for the reconciliation scenario tests
//!
//! Every scenario runs the real reconcilers against an in-memory object
//! store; cluster-side controllers (the volume binder, kpack, the
//! Deployment controller) are played by the test editing stored status.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use riff_system::config::ControllerConfig;
use riff_system::controller::client::{from_dynamic, resource, to_dynamic, Client, Object};
use riff_system::controller::events::{EventRecorder, MemoryRecorder};
use riff_system::controller::reconciler::Context;
use riff_system::controller::store::{MemoryStore, ObjectStore};
use riff_system::controller::tracker::{Clock, ManualClock, Tracker};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const NAMESPACE: &str = "default";
pub const IMAGE_PREFIX: &str = "registry.example.com/riff";

#[derive(Debug)]
pub struct Cluster {
    pub store: Arc<MemoryStore>,
    pub recorder: Arc<MemoryRecorder>,
    pub clock: Arc<ManualClock>,
    pub tracker: Arc<Tracker>,
    pub ctx: Context,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(MemoryRecorder::new());
        let clock = Arc::new(ManualClock::new());
        let dyn_clock: Arc<dyn Clock> = Arc::<ManualClock>::clone(&clock);
        let tracker = Arc::new(Tracker::with_clock(dyn_clock));
        let dyn_store: Arc<dyn ObjectStore> = Arc::<MemoryStore>::clone(&store);
        let ctx = Context::new(
            Client::new(dyn_store),
            Arc::clone(&tracker),
            Arc::clone(&recorder) as Arc<dyn EventRecorder>,
            config,
        );
        Self {
            store,
            recorder,
            clock,
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

    /// The single stored object of a kind
    pub fn only<K: Object>(&self) -> K {
        let mut all = self.all::<K>();
        assert_eq!(all.len(), 1, "expected exactly one {}", K::kind(&()));
        all.remove(0)
    }

    /// Edit a stored object in place, as another controller would
    pub fn edit<K: Object>(&self, mut object: K, edit: impl FnOnce(&mut K)) {
        edit(&mut object);
        self.seed(&object);
    }

    pub fn seed_image_prefix(&self) {
        self.seed(&ConfigMap {
            metadata: meta(&self.ctx.config.build_config_map_name),
            data: Some(BTreeMap::from([(
                "default-image-prefix".to_string(),
                IMAGE_PREFIX.to_string(),
            )])),
            ..ConfigMap::default()
        });
    }
}

pub fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        ..ObjectMeta::default()
    }
}
