//! # Build Resources
//!
//! Function, Application and Container resources in the
//! `build.projectriff.io` group.

use crate::crd::kpack::{ImageBuild, ImageTaggingStrategy, Source};
use crate::crd::reference::TypedLocalObjectReference;
use crate::crd::status::{Reconcilable, ResourceStatus, Status};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const BUILD_GROUP: &str = "build.projectriff.io";

/// Label placed on children of a Function
pub const FUNCTION_LABEL_KEY: &str = "build.projectriff.io/function";

/// Label placed on children of an Application
pub const APPLICATION_LABEL_KEY: &str = "build.projectriff.io/application";

/// Label placed on children of a Container
pub const CONTAINER_LABEL_KEY: &str = "build.projectriff.io/container";

/// Marks a Secret as a registry credential for builds in its namespace
pub const CREDENTIAL_LABEL_KEY: &str = "build.projectriff.io/credential";

/// Comma separated credential Secrets bound to the build ServiceAccount
pub const CREDENTIALS_ANNOTATION_KEY: &str = "build.projectriff.io/credentials";

pub const CONDITION_BUILD_CACHE_READY: &str = "BuildCacheReady";
pub const CONDITION_BUILD_SUCCEEDED: &str = "BuildSucceeded";
pub const CONDITION_IMAGE_RESOLVED: &str = "ImageResolved";

/// A function built from source into a container image
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "build.projectriff.io",
    version = "v1alpha1",
    kind = "Function",
    namespaced,
    status = "BuildStatus",
    shortname = "fn",
    printcolumn = r#"{"name":"Latest Image", "type":"string", "jsonPath":".status.latestImage"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}, {"name":"Reason", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    /// Image repository to push built images to
    ///
    /// A leading underscore applies the namespace's default image prefix;
    /// `_` alone combines the prefix with the resource name.
    pub image: String,
    /// Size of the build cache volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<String>,
    /// Source location. Required for on-cluster builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_build_history_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_build_history_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tagging_strategy: Option<ImageTaggingStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<ImageBuild>,
    /// Artifact file containing the function within the build workspace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub artifact: String,
    /// Method or class to invoke
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub handler: String,
    /// Invoker language runtime name. Detected by default.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub invoker: String,
}

/// An application built from source into a container image
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "build.projectriff.io",
    version = "v1alpha1",
    kind = "Application",
    namespaced,
    status = "BuildStatus",
    shortname = "app",
    printcolumn = r#"{"name":"Latest Image", "type":"string", "jsonPath":".status.latestImage"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_build_history_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_build_history_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tagging_strategy: Option<ImageTaggingStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<ImageBuild>,
}

/// A pre-built container image tracked by reference
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "build.projectriff.io",
    version = "v1alpha1",
    kind = "Container",
    namespaced,
    status = "ContainerStatus",
    printcolumn = r#"{"name":"Latest Image", "type":"string", "jsonPath":".status.latestImage"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: String,
}

/// Status of Function and Application resources
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    #[serde(flatten)]
    pub common: Status,
    /// Resolved image repository builds are pushed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_image: Option<String>,
    /// Most recently built image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_cache_ref: Option<TypedLocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpack_image_ref: Option<TypedLocalObjectReference>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    #[serde(flatten)]
    pub common: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_image: Option<String>,
}

impl ResourceStatus for BuildStatus {
    fn common(&self) -> &Status {
        &self.common
    }

    fn common_mut(&mut self) -> &mut Status {
        &mut self.common
    }
}

impl ResourceStatus for ContainerStatus {
    fn common(&self) -> &Status {
        &self.common
    }

    fn common_mut(&mut self) -> &mut Status {
        &mut self.common
    }
}

/// Status that records a resolved target image
pub trait ImageStatus: ResourceStatus {
    fn target_image(&self) -> Option<&str>;
    fn set_target_image(&mut self, image: Option<String>);
    fn latest_image(&self) -> Option<&str>;
    fn set_latest_image(&mut self, image: Option<String>);
}

impl ImageStatus for BuildStatus {
    fn target_image(&self) -> Option<&str> {
        self.target_image.as_deref()
    }

    fn set_target_image(&mut self, image: Option<String>) {
        self.target_image = image;
    }

    fn latest_image(&self) -> Option<&str> {
        self.latest_image.as_deref()
    }

    fn set_latest_image(&mut self, image: Option<String>) {
        self.latest_image = image;
    }
}

impl ImageStatus for ContainerStatus {
    fn target_image(&self) -> Option<&str> {
        self.target_image.as_deref()
    }

    fn set_target_image(&mut self, image: Option<String>) {
        self.target_image = image;
    }

    fn latest_image(&self) -> Option<&str> {
        self.latest_image.as_deref()
    }

    fn set_latest_image(&mut self, image: Option<String>) {
        self.latest_image = image;
    }
}

/// A resource whose spec names the image it produces or consumes
pub trait ImageResource: Reconcilable {
    fn image(&self) -> &str;
}

/// A resource built on cluster by a kpack Image
pub trait BuildResource: ImageResource + Reconcilable<Status = BuildStatus> {
    /// Label placed on every child of this kind
    const LABEL_KEY: &'static str;

    /// ClusterBuilder used for on-cluster builds
    const BUILDER: &'static str;

    fn source(&self) -> Option<&Source>;

    fn cache_size(&self) -> Option<&str>;

    fn failed_build_history_limit(&self) -> Option<i64>;

    fn success_build_history_limit(&self) -> Option<i64>;

    fn image_tagging_strategy(&self) -> Option<ImageTaggingStrategy>;

    fn image_build(&self) -> Option<&ImageBuild>;

    /// Environment injected into the build in addition to `build.env`
    fn build_env(&self) -> Vec<k8s_openapi::api::core::v1::EnvVar> {
        Vec::new()
    }
}

impl Reconcilable for Function {
    type Status = BuildStatus;

    fn status(&self) -> Option<&BuildStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut BuildStatus {
        self.status.get_or_insert_with(BuildStatus::default)
    }
}

impl ImageResource for Function {
    fn image(&self) -> &str {
        &self.spec.image
    }
}

impl BuildResource for Function {
    const LABEL_KEY: &'static str = FUNCTION_LABEL_KEY;
    const BUILDER: &'static str = "riff-function";

    fn source(&self) -> Option<&Source> {
        self.spec.source.as_ref()
    }

    fn cache_size(&self) -> Option<&str> {
        self.spec.cache_size.as_deref()
    }

    fn failed_build_history_limit(&self) -> Option<i64> {
        self.spec.failed_build_history_limit
    }

    fn success_build_history_limit(&self) -> Option<i64> {
        self.spec.success_build_history_limit
    }

    fn image_tagging_strategy(&self) -> Option<ImageTaggingStrategy> {
        self.spec.image_tagging_strategy
    }

    fn image_build(&self) -> Option<&ImageBuild> {
        self.spec.build.as_ref()
    }

    fn build_env(&self) -> Vec<k8s_openapi::api::core::v1::EnvVar> {
        use k8s_openapi::api::core::v1::EnvVar;
        let env = |name: &str, value: &str| EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        };
        vec![
            env("RIFF", "true"),
            env("RIFF_ARTIFACT", &self.spec.artifact),
            env("RIFF_HANDLER", &self.spec.handler),
            env("RIFF_OVERRIDE", &self.spec.invoker),
        ]
    }
}

impl Reconcilable for Application {
    type Status = BuildStatus;

    fn status(&self) -> Option<&BuildStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut BuildStatus {
        self.status.get_or_insert_with(BuildStatus::default)
    }
}

impl ImageResource for Application {
    fn image(&self) -> &str {
        &self.spec.image
    }
}

impl BuildResource for Application {
    const LABEL_KEY: &'static str = APPLICATION_LABEL_KEY;
    const BUILDER: &'static str = "riff-application";

    fn source(&self) -> Option<&Source> {
        self.spec.source.as_ref()
    }

    fn cache_size(&self) -> Option<&str> {
        self.spec.cache_size.as_deref()
    }

    fn failed_build_history_limit(&self) -> Option<i64> {
        self.spec.failed_build_history_limit
    }

    fn success_build_history_limit(&self) -> Option<i64> {
        self.spec.success_build_history_limit
    }

    fn image_tagging_strategy(&self) -> Option<ImageTaggingStrategy> {
        self.spec.image_tagging_strategy
    }

    fn image_build(&self) -> Option<&ImageBuild> {
        self.spec.build.as_ref()
    }
}

impl Reconcilable for Container {
    type Status = ContainerStatus;

    fn status(&self) -> Option<&ContainerStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut ContainerStatus {
        self.status.get_or_insert_with(ContainerStatus::default)
    }
}

impl ImageResource for Container {
    fn image(&self) -> &str {
        &self.spec.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_env_carries_invoker_settings() {
        let function = Function::new(
            "square",
            FunctionSpec {
                image: "_".to_string(),
                artifact: "square.js".to_string(),
                handler: "square".to_string(),
                invoker: "node".to_string(),
                ..FunctionSpec::default()
            },
        );
        let env = function.build_env();
        let names: Vec<_> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["RIFF", "RIFF_ARTIFACT", "RIFF_HANDLER", "RIFF_OVERRIDE"]
        );
        assert_eq!(env[1].value.as_deref(), Some("square.js"));
        assert_eq!(env[3].value.as_deref(), Some("node"));
    }

    #[test]
    fn test_application_has_no_extra_env() {
        let application = Application::new("petclinic", ApplicationSpec::default());
        assert!(application.build_env().is_empty());
    }

    #[test]
    fn test_build_status_flattens_common_fields() {
        let mut status = BuildStatus::default();
        status.common.observed_generation = Some(3);
        status.latest_image = Some("registry.example.com/square@sha256:abc".to_string());
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["observedGeneration"], 3);
        assert_eq!(value["latestImage"], "registry.example.com/square@sha256:abc");
        assert!(value.get("common").is_none());

        let parsed: BuildStatus = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, status);
    }

    #[test]
    fn test_status_mut_creates_missing_status() {
        let mut container = Container::new("base", ContainerSpec::default());
        assert!(container.status.is_none());
        container.status_mut().target_image = Some("example.com/base".to_string());
        assert!(container.status.is_some());
    }
}
