//! # KEDA ScaledObject
//!
//! Data shape of the autoscaler object (`keda.k8s.io/v1alpha1`, kind
//! `ScaledObject`) that scales a Processor's Deployment on the lag of its
//! input streams. Only the fields riff writes are modelled.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[kube(group = "keda.k8s.io", version = "v1alpha1", kind = "ScaledObject", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ScaledObjectSpec {
    pub scale_target_ref: ScaleTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_interval: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_period: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replica_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replica_count: Option<i32>,
    #[serde(default)]
    pub triggers: Vec<ScaledObjectTrigger>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTarget {
    pub deployment_name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScaledObjectTrigger {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}
