//! # Build Cache
//!
//! A PersistentVolumeClaim that keeps build layers between on-cluster
//! builds. Only resources with a source get one.

use crate::controller::ownership::not_owned_message;
use crate::controller::reconciler::{
    labels_match, merge_labels, ChildManager, ChildOutcome, Context, Parent, ReconcilerError,
};
use crate::controller::stash::BUILD_CACHE_NAME;
use crate::crd::{BuildResource, ConditionSeverity, TypedLocalObjectReference, CONDITION_BUILD_CACHE_READY};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::Resource;
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// Name of the build cache claim for a resource
pub fn build_cache_name(parent_name: &str) -> String {
    format!("{parent_name}-build-cache")
}

/// Manages the build cache claim of a [`BuildResource`]
#[derive(Debug)]
pub struct BuildCacheManager<T> {
    _parent: PhantomData<fn() -> T>,
}

impl<T> BuildCacheManager<T> {
    pub fn new() -> Self {
        Self { _parent: PhantomData }
    }
}

impl<T> Default for BuildCacheManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: BuildResource> ChildManager for BuildCacheManager<T> {
    type Parent = T;
    type Child = PersistentVolumeClaim;

    fn label_key(&self) -> &'static str {
        T::LABEL_KEY
    }

    async fn desired_child(
        &self,
        ctx: &Context,
        parent: &Parent<'_, T>,
    ) -> Result<Option<PersistentVolumeClaim>, ReconcilerError> {
        let resource = parent.resource();
        if resource.source().is_none() {
            return Ok(None);
        }
        let name = build_cache_name(parent.name());
        let size = resource
            .cache_size()
            .unwrap_or(ctx.config.default_build_cache_size.as_str())
            .to_string();
        Ok(Some(PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name),
                labels: resource.meta().labels.clone(),
                ..ObjectMeta::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size))])),
                    ..VolumeResourceRequirements::default()
                }),
                ..PersistentVolumeClaimSpec::default()
            }),
            status: None,
        }))
    }

    fn reflect_child_status(&self, parent: &mut Parent<'_, T>, child: &ChildOutcome<PersistentVolumeClaim>) {
        match child {
            ChildOutcome::Present(pvc) => {
                parent.status_mut().build_cache_ref = TypedLocalObjectReference::for_object(pvc);
                let phase = pvc.status.as_ref().and_then(|s| s.phase.as_deref());
                let mut conditions = parent.conditions();
                match phase {
                    Some("Bound") => conditions.mark_true(CONDITION_BUILD_CACHE_READY),
                    Some("Lost") => conditions.mark_false(
                        CONDITION_BUILD_CACHE_READY,
                        "BuildCacheLost",
                        "the build cache volume was lost",
                    ),
                    _ => conditions.mark_unknown(
                        CONDITION_BUILD_CACHE_READY,
                        "BuildCachePending",
                        "waiting for the build cache volume to be bound",
                    ),
                }
            }
            ChildOutcome::Absent => {
                parent.status_mut().build_cache_ref = None;
                parent.conditions().mark_true(CONDITION_BUILD_CACHE_READY);
            }
            ChildOutcome::NotOwned { name } => {
                parent.status_mut().build_cache_ref = None;
                let message = not_owned_message("PersistentVolumeClaim", name, &parent.kind());
                parent.conditions().mark_false_with_severity(
                    CONDITION_BUILD_CACHE_READY,
                    ConditionSeverity::Warning,
                    "NotOwned",
                    &message,
                );
            }
        }
    }

    /// Only a claim this resource owns is handed to the build
    fn stash_child(&self, ctx: &Context, child: &ChildOutcome<PersistentVolumeClaim>) -> Result<(), ReconcilerError> {
        if let ChildOutcome::Present(pvc) = child {
            if let Some(name) = pvc.metadata.name.clone() {
                ctx.stash_value(&BUILD_CACHE_NAME, name)?;
            }
        }
        Ok(())
    }

    fn semantic_equals(&self, desired: &PersistentVolumeClaim, actual: &PersistentVolumeClaim) -> bool {
        desired.spec == actual.spec && labels_match(desired, actual)
    }

    /// Only the requested size may change on a bound claim
    fn merge_before_update(&self, current: &mut PersistentVolumeClaim, desired: &PersistentVolumeClaim) {
        merge_labels(current, desired);
        let resources = desired.spec.as_ref().and_then(|s| s.resources.clone());
        current.spec.get_or_insert_with(PersistentVolumeClaimSpec::default).resources = resources;
    }

    fn harmonize_immutable_fields(&self, current: &PersistentVolumeClaim, desired: &mut PersistentVolumeClaim) {
        let resources = desired.spec.as_ref().and_then(|s| s.resources.clone());
        let mut spec = current.spec.clone().unwrap_or_default();
        spec.resources = resources;
        desired.spec = Some(spec);
    }
}
