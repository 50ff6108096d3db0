//! # Deployer
//!
//! Runs the latest image of a build resource (or a literal image) as a
//! Deployment fronted by a Service.

use crate::crd::preserve_unknown_fields;
use crate::crd::reference::TypedLocalObjectReference;
use crate::crd::status::{Reconcilable, ResourceStatus, Status};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const CORE_GROUP: &str = "core.projectriff.io";

/// Label placed on children of a Deployer
pub const DEPLOYER_LABEL_KEY: &str = "core.projectriff.io/deployer";

pub const CONDITION_DEPLOYMENT_READY: &str = "DeploymentReady";
pub const CONDITION_SERVICE_READY: &str = "ServiceReady";

/// Default name of the serving container
pub const DEFAULT_CONTAINER_NAME: &str = "handler";

/// Default port the serving container listens on
pub const DEFAULT_CONTAINER_PORT: i32 = 8080;

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.projectriff.io",
    version = "v1alpha1",
    kind = "Deployer",
    namespaced,
    status = "DeployerStatus",
    shortname = "deploy",
    printcolumn = r#"{"name":"Latest Image", "type":"string", "jsonPath":".status.latestImage"}, {"name":"URL", "type":"string", "jsonPath":".status.address.url"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeployerSpec {
    /// Build resource supplying the image; mutually exclusive with an image
    /// in the template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<DeployerBuild>,
    /// Pod template for the workload
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub template: PodTemplateSpec,
}

/// Reference to exactly one build resource in the same namespace
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeployerBuild {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_ref: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeployerStatus {
    #[serde(flatten)]
    pub common: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_ref: Option<TypedLocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_ref: Option<TypedLocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Addressable>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Addressable {
    pub url: String,
}

impl ResourceStatus for DeployerStatus {
    fn common(&self) -> &Status {
        &self.common
    }

    fn common_mut(&mut self) -> &mut Status {
        &mut self.common
    }
}

impl Reconcilable for Deployer {
    type Status = DeployerStatus;

    fn status(&self) -> Option<&DeployerStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut DeployerStatus {
        self.status.get_or_insert_with(DeployerStatus::default)
    }

    /// Guarantees one named container exposing one port
    fn apply_defaults(&mut self) {
        let pod = self.spec.template.spec.get_or_insert_with(PodSpec::default);
        if pod.containers.is_empty() {
            pod.containers.push(Container::default());
        }
        let container = &mut pod.containers[0];
        if container.name.is_empty() {
            container.name = DEFAULT_CONTAINER_NAME.to_string();
        }
        let ports = container.ports.get_or_insert_with(Vec::new);
        if ports.is_empty() {
            ports.push(ContainerPort {
                name: Some("http".to_string()),
                container_port: DEFAULT_CONTAINER_PORT,
                protocol: Some("TCP".to_string()),
                ..ContainerPort::default()
            });
        }
    }
}

impl Deployer {
    /// First container of the (defaulted) template
    #[must_use]
    pub fn serving_container(&self) -> Option<&Container> {
        self.spec
            .template
            .spec
            .as_ref()
            .and_then(|pod| pod.containers.first())
    }

    /// First declared port of the serving container
    #[must_use]
    pub fn serving_port(&self) -> Option<&ContainerPort> {
        self.serving_container()
            .and_then(|c| c.ports.as_ref())
            .and_then(|ports| ports.first())
    }
}
