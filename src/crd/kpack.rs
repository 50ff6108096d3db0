//! # kpack
//!
//! Data shapes of the third-party build objects (`build.pivotal.io/v1alpha1`).
//! Function and Application builds are delegated to an `Image`; the
//! cluster-scoped `ClusterBuilder`s riff installs are published for clients.
//! Only the fields riff reads or writes are modelled.

use crate::crd::status::Status;
use crate::crd::{preserve_unknown_fields, preserve_unknown_items, Condition, ResourceStatus};
use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "build.pivotal.io",
    version = "v1alpha1",
    kind = "Image",
    root = "KpackImage",
    namespaced,
    status = "KpackImageStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct KpackImageSpec {
    /// Image repository the build pushes to
    pub tag: String,
    pub builder: ImageBuilder,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account: String,
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_build_history_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_build_history_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tagging_strategy: Option<ImageTaggingStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<ImageBuild>,
}

/// Builder used to run the build
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuilder {
    /// Builder kind, e.g. `ClusterBuilder`
    pub kind: String,
    pub name: String,
}

/// Build source location
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    pub url: String,
    pub revision: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ImageTaggingStrategy {
    None,
    BuildNumber,
}

/// Build-time environment and resources
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuild {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_items")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub resources: Option<ResourceRequirements>,
}

/// A builder image available to every namespace
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "build.pivotal.io",
    version = "v1alpha1",
    kind = "ClusterBuilder",
    status = "ClusterBuilderStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBuilderSpec {
    /// Builder image the latest image is resolved from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBuilderStatus {
    #[serde(flatten)]
    pub common: Status,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub latest_image: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KpackImageStatus {
    #[serde(flatten)]
    pub common: Status,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub latest_image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub build_cache_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub latest_build_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub build_counter: String,
}

impl ResourceStatus for KpackImageStatus {
    fn common(&self) -> &Status {
        &self.common
    }

    fn common_mut(&mut self) -> &mut Status {
        &mut self.common
    }
}

impl KpackImageStatus {
    /// The build's own Ready condition, if reported
    #[must_use]
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.get_condition(crate::crd::CONDITION_READY)
    }
}
