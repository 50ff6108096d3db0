//! # Build
//!
//! Delegates on-cluster builds to a kpack Image and reflects its progress
//! as the BuildSucceeded condition and `status.latestImage`.
//!
//! A resource without a source is not built; its target image is used as
//! the latest image directly.

use crate::controller::conditions::{ConditionSet, ConditionSetError};
use crate::controller::ownership::not_owned_message;
use crate::controller::reconciler::{
    labels_match, merge_labels, ChildManager, ChildOutcome, ChildReconciler, Context, Parent,
    ParentReconciler, ReconcilerError, SubReconciler,
};
use crate::controller::stash::{BUILD_CACHE_NAME, TARGET_IMAGE};
use crate::crd::{
    BuildResource, ConditionSeverity, ConditionStatus, ImageBuild, ImageBuilder, ImageStatus, KpackImage,
    KpackImageSpec, ResourceStatus, TypedLocalObjectReference, CONDITION_BUILD_CACHE_READY,
    CONDITION_BUILD_SUCCEEDED, CONDITION_IMAGE_RESOLVED,
};
use crate::controllers::build_cache::BuildCacheManager;
use crate::controllers::target_image::TargetImageReconciler;
use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::Resource;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Annotation on the kpack Image naming the build cache claim of its parent
pub const BUILD_CACHE_ANNOTATION: &str = "build.projectriff.io/build-cache";

/// Conditions shared by Function and Application
pub fn build_conditions() -> Result<ConditionSet, ConditionSetError> {
    ConditionSet::living([
        CONDITION_BUILD_CACHE_READY,
        CONDITION_BUILD_SUCCEEDED,
        CONDITION_IMAGE_RESOLVED,
    ])
}

/// TargetImage, then the build cache claim, then the kpack Image
pub fn build_reconciler<T: BuildResource>() -> Result<ParentReconciler<T>, ConditionSetError> {
    let subs: Vec<Box<dyn SubReconciler<T>>> = vec![
        Box::new(TargetImageReconciler),
        Box::new(ChildReconciler::new("ChildBuildCache", BuildCacheManager::<T>::new())),
        Box::new(ChildReconciler::new("ChildImage", KpackImageManager::<T>::new())),
    ];
    Ok(ParentReconciler::new(Arc::new(build_conditions()?), subs))
}

/// Manages the kpack Image of a [`BuildResource`]
#[derive(Debug)]
pub struct KpackImageManager<T> {
    _parent: PhantomData<fn() -> T>,
}

impl<T> KpackImageManager<T> {
    pub fn new() -> Self {
        Self { _parent: PhantomData }
    }
}

impl<T> Default for KpackImageManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: BuildResource> ChildManager for KpackImageManager<T> {
    type Parent = T;
    type Child = KpackImage;

    fn label_key(&self) -> &'static str {
        T::LABEL_KEY
    }

    async fn desired_child(
        &self,
        ctx: &Context,
        parent: &Parent<'_, T>,
    ) -> Result<Option<KpackImage>, ReconcilerError> {
        let resource = parent.resource();
        let Some(source) = resource.source() else {
            return Ok(None);
        };
        let tag = match ctx.retrieve_value(&TARGET_IMAGE)? {
            Some(image) => image,
            None => parent.status().target_image().unwrap_or_default().to_string(),
        };

        let extra_env = resource.build_env();
        let mut build = resource.image_build().cloned();
        if !extra_env.is_empty() {
            build
                .get_or_insert_with(ImageBuild::default)
                .env
                .extend(extra_env);
        }

        let annotations = ctx
            .retrieve_value(&BUILD_CACHE_NAME)?
            .map(|name| BTreeMap::from([(BUILD_CACHE_ANNOTATION.to_string(), name)]));

        let kind = T::kind(&()).to_lowercase();
        let mut image = KpackImage::new(
            "",
            KpackImageSpec {
                tag,
                builder: ImageBuilder {
                    kind: "ClusterBuilder".to_string(),
                    name: T::BUILDER.to_string(),
                },
                service_account: ctx.config.build_service_account.clone(),
                source: source.clone(),
                cache_size: resource.cache_size().map(ToString::to_string),
                failed_build_history_limit: resource.failed_build_history_limit(),
                success_build_history_limit: resource.success_build_history_limit(),
                image_tagging_strategy: resource.image_tagging_strategy(),
                build,
            },
        );
        image.metadata = ObjectMeta {
            generate_name: Some(format!("{}-{kind}-", parent.name())),
            labels: resource.meta().labels.clone(),
            annotations,
            ..ObjectMeta::default()
        };
        Ok(Some(image))
    }

    fn reflect_child_status(&self, parent: &mut Parent<'_, T>, child: &ChildOutcome<KpackImage>) {
        match child {
            ChildOutcome::Absent => {
                let target = parent.status().target_image().map(ToString::to_string);
                let status = parent.status_mut();
                status.kpack_image_ref = None;
                status.set_latest_image(target);
                parent.conditions().mark_true(CONDITION_BUILD_SUCCEEDED);
            }
            ChildOutcome::Present(image) => {
                let status = parent.status_mut();
                status.kpack_image_ref = TypedLocalObjectReference::for_object(image);
                let latest = image
                    .status
                    .as_ref()
                    .map(|s| s.latest_image.clone())
                    .filter(|latest| !latest.is_empty());
                if latest.is_some() {
                    status.set_latest_image(latest);
                }
                propagate_image_status(parent, image);
            }
            ChildOutcome::NotOwned { name } => {
                parent.status_mut().kpack_image_ref = None;
                let message = not_owned_message("Image", name, &parent.kind());
                parent.conditions().mark_false_with_severity(
                    CONDITION_BUILD_SUCCEEDED,
                    ConditionSeverity::Warning,
                    "NotOwned",
                    &message,
                );
            }
        }
    }

    fn semantic_equals(&self, desired: &KpackImage, actual: &KpackImage) -> bool {
        desired.spec == actual.spec && labels_match(desired, actual)
    }

    fn merge_before_update(&self, current: &mut KpackImage, desired: &KpackImage) {
        merge_labels(current, desired);
        current.spec = desired.spec.clone();
    }
}

/// Map the Image's Ready condition onto BuildSucceeded
///
/// A status the kpack controller has not caught up with is reported as
/// still building.
fn propagate_image_status<T: BuildResource>(parent: &mut Parent<'_, T>, image: &KpackImage) {
    let status = image.status.as_ref();
    let observed = status.and_then(ResourceStatus::observed_generation);
    let current = observed.is_some() && observed == image.meta().generation;
    let ready = status.and_then(|s| s.ready_condition()).filter(|_| current);
    let mut conditions = parent.conditions();
    match ready {
        Some(c) if c.status == ConditionStatus::True => conditions.mark_true(CONDITION_BUILD_SUCCEEDED),
        Some(c) if c.status == ConditionStatus::False => conditions.mark_false(
            CONDITION_BUILD_SUCCEEDED,
            c.reason.as_deref().unwrap_or("BuildFailed"),
            c.message.as_deref().unwrap_or_default(),
        ),
        Some(c) => conditions.mark_unknown(
            CONDITION_BUILD_SUCCEEDED,
            c.reason.as_deref().unwrap_or("Building"),
            c.message.as_deref().unwrap_or_default(),
        ),
        None => conditions.mark_unknown(
            CONDITION_BUILD_SUCCEEDED,
            "Building",
            "waiting for the build to report status",
        ),
    }
}
