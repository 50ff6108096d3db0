//! # Streaming
//!
//! Streams of messages held by a Gateway, and Processors that run a
//! function over input streams and publish to output streams.
//!
//! Gateways are provisioned outside riff; their status is only read.

use crate::crd::deployer::Addressable;
use crate::crd::preserve_unknown_fields;
use crate::crd::reference::TypedLocalObjectReference;
use crate::crd::status::{Reconcilable, ResourceStatus, Status};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const STREAMING_GROUP: &str = "streaming.projectriff.io";

/// Label placed on children of a Stream
pub const STREAM_LABEL_KEY: &str = "streaming.projectriff.io/stream";

/// Label placed on children of a Processor
pub const PROCESSOR_LABEL_KEY: &str = "streaming.projectriff.io/processor";

/// Name given to the function container of a template without containers
pub const DEFAULT_FUNCTION_CONTAINER_NAME: &str = "function";

pub const CONDITION_RESOURCE_AVAILABLE: &str = "ResourceAvailable";
pub const CONDITION_BINDING_READY: &str = "BindingReady";
pub const CONDITION_STREAMS_READY: &str = "StreamsReady";
pub const CONDITION_SCALED_OBJECT_READY: &str = "ScaledObjectReady";

/// Reference to an object in the same namespace, by name
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LocalObjectReference {
    pub name: String,
}

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "streaming.projectriff.io",
    version = "v1alpha1",
    kind = "Gateway",
    namespaced,
    status = "GatewayStatus",
    printcolumn = r#"{"name":"Address", "type":"string", "jsonPath":".status.address.url"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// Ports the gateway exposes, as the gateway implementation defines them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub ports: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    #[serde(flatten)]
    pub common: Status,
    /// Where the gateway's provisioner listens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Addressable>,
}

impl ResourceStatus for GatewayStatus {
    fn common(&self) -> &Status {
        &self.common
    }

    fn common_mut(&mut self) -> &mut Status {
        &mut self.common
    }
}

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "streaming.projectriff.io",
    version = "v1alpha1",
    kind = "Stream",
    namespaced,
    status = "StreamStatus",
    printcolumn = r#"{"name":"Content Type", "type":"string", "jsonPath":".spec.contentType"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StreamSpec {
    pub gateway: LocalObjectReference,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    #[serde(flatten)]
    pub common: Status,
    #[serde(default)]
    pub binding: StreamBinding,
}

/// ConfigMap and Secret a client mounts to reach the stream
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_ref: Option<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,
}

impl ResourceStatus for StreamStatus {
    fn common(&self) -> &Status {
        &self.common
    }

    fn common_mut(&mut self) -> &mut Status {
        &mut self.common
    }
}

impl Reconcilable for Stream {
    type Status = StreamStatus;

    fn status(&self) -> Option<&StreamStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut StreamStatus {
        self.status.get_or_insert_with(StreamStatus::default)
    }
}

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "streaming.projectriff.io",
    version = "v1alpha1",
    kind = "Processor",
    namespaced,
    status = "ProcessorStatus",
    printcolumn = r#"{"name":"Latest Image", "type":"string", "jsonPath":".status.latestImage"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorSpec {
    /// Build resource supplying the function image; without one the image
    /// of the template's first container is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<ProcessorBuild>,
    #[serde(default)]
    pub inputs: Vec<InputStreamBinding>,
    #[serde(default)]
    pub outputs: Vec<OutputStreamBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub template: Option<PodTemplateSpec>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorBuild {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_ref: Option<String>,
}

/// Where a new consumer group starts reading
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    Earliest,
    #[default]
    Latest,
}

impl StartOffset {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InputStreamBinding {
    pub stream: String,
    /// Name the function knows the stream by; defaults to the stream name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    #[serde(default)]
    pub start_offset: StartOffset,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutputStreamBinding {
    pub stream: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorStatus {
    #[serde(flatten)]
    pub common: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_ref: Option<TypedLocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaled_object_ref: Option<TypedLocalObjectReference>,
}

impl ResourceStatus for ProcessorStatus {
    fn common(&self) -> &Status {
        &self.common
    }

    fn common_mut(&mut self) -> &mut Status {
        &mut self.common
    }
}

impl Processor {
    /// Image of the template's first container
    #[must_use]
    pub fn template_image(&self) -> Option<&str> {
        self.spec
            .template
            .as_ref()
            .and_then(|t| t.spec.as_ref())
            .and_then(|pod| pod.containers.first())
            .and_then(|c| c.image.as_deref())
            .filter(|image| !image.is_empty())
    }
}

impl Reconcilable for Processor {
    type Status = ProcessorStatus;

    fn status(&self) -> Option<&ProcessorStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut ProcessorStatus {
        self.status.get_or_insert_with(ProcessorStatus::default)
    }

    /// Aliases default to the stream name; the template gets a function
    /// container when it has none
    fn apply_defaults(&mut self) {
        let pod = self
            .spec
            .template
            .get_or_insert_with(PodTemplateSpec::default)
            .spec
            .get_or_insert_with(PodSpec::default);
        if pod.containers.is_empty() {
            pod.containers.push(Container {
                name: DEFAULT_FUNCTION_CONTAINER_NAME.to_string(),
                ..Container::default()
            });
        }
        for input in &mut self.spec.inputs {
            if input.alias.is_empty() {
                input.alias.clone_from(&input.stream);
            }
        }
        for output in &mut self.spec.outputs {
            if output.alias.is_empty() {
                output.alias.clone_from(&output.stream);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_offset_defaults_to_latest() {
        let input: InputStreamBinding = serde_json::from_value(serde_json::json!({"stream": "letters"})).unwrap();
        assert_eq!(input.start_offset, StartOffset::Latest);

        let input: InputStreamBinding =
            serde_json::from_value(serde_json::json!({"stream": "letters", "startOffset": "earliest"})).unwrap();
        assert_eq!(input.start_offset.as_str(), "earliest");
    }

    #[test]
    fn test_aliases_default_to_stream_name() {
        let mut processor = Processor::new(
            "upper",
            ProcessorSpec {
                inputs: vec![InputStreamBinding {
                    stream: "letters".to_string(),
                    ..InputStreamBinding::default()
                }],
                outputs: vec![OutputStreamBinding {
                    stream: "upper-letters".to_string(),
                    alias: "out".to_string(),
                }],
                ..ProcessorSpec::default()
            },
        );
        processor.apply_defaults();
        assert_eq!(processor.spec.inputs[0].alias, "letters");
        assert_eq!(processor.spec.outputs[0].alias, "out");
        let pod = processor.spec.template.unwrap().spec.unwrap();
        assert_eq!(pod.containers[0].name, "function");
    }

    #[test]
    fn test_stream_status_serializes_binding_refs() {
        let status = StreamStatus {
            binding: StreamBinding {
                metadata_ref: Some(LocalObjectReference {
                    name: "letters-stream-binding-metadata".to_string(),
                }),
                secret_ref: None,
            },
            ..StreamStatus::default()
        };
        let value = serde_json::to_value(status).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"binding": {"metadataRef": {"name": "letters-stream-binding-metadata"}}})
        );
    }
}
