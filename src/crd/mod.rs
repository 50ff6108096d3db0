//! # Custom Resource Definitions
//!
//! Resource kinds reconciled by riff, plus the third-party objects they
//! delegate to.
//!
//! - `build`: Function, Application, Container
//! - `deployer`: Deployer
//! - `streaming`: Gateway, Stream, Processor
//! - `kpack`: the kpack Image and ClusterBuilder builds are delegated to
//! - `keda`: the KEDA ScaledObject that scales a Processor
//! - `condition` / `status` / `reference`: shared status building blocks

pub mod build;
pub mod condition;
pub mod deployer;
pub mod keda;
pub mod kpack;
pub mod reference;
pub mod status;
pub mod streaming;

pub use build::*;
pub use condition::{Condition, ConditionSeverity, ConditionStatus, CONDITION_READY};
pub use deployer::*;
pub use keda::{ScaleTarget, ScaledObject, ScaledObjectSpec, ScaledObjectTrigger};
pub use kpack::{ClusterBuilder, ClusterBuilderSpec, ClusterBuilderStatus, GitSource, ImageBuild, ImageBuilder, ImageTaggingStrategy, KpackImage, KpackImageSpec, KpackImageStatus, Source};
pub use reference::TypedLocalObjectReference;
pub use status::{Reconcilable, ResourceStatus, Status};
pub use streaming::*;

use schemars::{json_schema, Schema, SchemaGenerator};

/// Schema for fields holding Kubernetes core types
///
/// k8s-openapi types carry no JSON schema of their own, so the API server is
/// told to keep whatever it receives. Validation happens in the reconciler.
pub(crate) fn preserve_unknown_fields(_gen: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

/// Schema for lists of Kubernetes core types
pub(crate) fn preserve_unknown_items(_gen: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "array",
        "items": {
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true
        }
    })
}
