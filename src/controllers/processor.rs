//! # Processor Reconciler
//!
//! Runs a function over input streams, publishing to output streams. The
//! function image comes from a build resource or the template; a sidecar
//! bridges the function to the streams' gateways through the stream
//! bindings mounted into the pod. KEDA scales the Deployment on the lag of
//! the input streams.

use crate::constants::PROCESSOR_IMAGE_KEY;
use crate::controller::conditions::{ConditionSet, ConditionSetError};
use crate::controller::ownership::not_owned_message;
use crate::controller::reconciler::{
    labels_match, merge_labels, ChildManager, ChildOutcome, ChildReconciler, Context, Parent,
    ParentReconciler, ReconcileResult, ReconcilerError, SubReconciler,
};
use crate::controller::stash::{INPUT_STREAMS, OUTPUT_STREAMS, PROCESSOR_IMAGE};
use crate::controller::tracker::TrackedKey;
use crate::controllers::deployer::{latest_image_of, mark_deployment_readiness, template_matches, REASON_BUILD_INVALID};
use crate::crd::{
    ConditionSeverity, Container, Function, Processor, ResourceStatus, ScaleTarget, ScaledObject,
    ScaledObjectSpec, ScaledObjectTrigger, Stream, TypedLocalObjectReference, CONDITION_DEPLOYMENT_READY,
    CONDITION_READY, CONDITION_SCALED_OBJECT_READY, CONDITION_STREAMS_READY, PROCESSOR_LABEL_KEY,
};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container as PodContainer, ContainerPort, EnvVar, PodSpec, Secret,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub const REASON_STREAM_NOT_READY: &str = "StreamNotReady";
pub const REASON_PROCESSOR_IMAGE_MISSING: &str = "ProcessorImageMissing";

/// Where stream bindings are mounted in the sidecar
pub const BINDINGS_ROOT: &str = "/var/riff/bindings";

/// Port the function container serves on inside the pod
pub const FUNCTION_PORT: i32 = 8081;

const PROCESSOR_CONTAINER_NAME: &str = "processor";
const SCALER_TYPE: &str = "liiklus";
const MAX_REPLICAS: i32 = 30;

pub fn conditions() -> Result<ConditionSet, ConditionSetError> {
    ConditionSet::living([
        CONDITION_STREAMS_READY,
        CONDITION_DEPLOYMENT_READY,
        CONDITION_SCALED_OBJECT_READY,
    ])
}

pub fn reconciler() -> Result<ParentReconciler<Processor>, ConditionSetError> {
    let subs: Vec<Box<dyn SubReconciler<Processor>>> = vec![
        Box::new(ProcessorImageReconciler),
        Box::new(BuildRefReconciler),
        Box::new(ResolveStreamsReconciler),
        Box::new(ChildReconciler::new("ChildDeployment", DeploymentManager)),
        Box::new(ChildReconciler::new("ChildScaledObject", ScaledObjectManager)),
    ];
    Ok(ParentReconciler::new(Arc::new(conditions()?), subs))
}

/// Reads the sidecar image from the system namespace
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessorImageReconciler;

#[async_trait]
impl SubReconciler<Processor> for ProcessorImageReconciler {
    fn name(&self) -> &'static str {
        "ProcessorImage"
    }

    async fn reconcile(&self, ctx: &Context, parent: &mut Parent<'_, Processor>) -> Result<ReconcileResult, ReconcilerError> {
        let namespace = &ctx.config.system_namespace;
        let name = &ctx.config.processor_config_map_name;
        ctx.track(&TrackedKey::new::<ConfigMap>(namespace, name), &parent.key());

        let image = ctx
            .client
            .get_opt::<ConfigMap>(namespace, name)
            .await?
            .and_then(|config| config.data)
            .and_then(|mut data| data.remove(PROCESSOR_IMAGE_KEY))
            .filter(|image| !image.is_empty());
        let Some(image) = image else {
            let message = format!("ConfigMap {namespace}/{name} does not name a {PROCESSOR_IMAGE_KEY}");
            parent
                .conditions()
                .mark_false(CONDITION_DEPLOYMENT_READY, REASON_PROCESSOR_IMAGE_MISSING, &message);
            return Err(ReconcilerError::invalid(REASON_PROCESSOR_IMAGE_MISSING, message));
        };
        ctx.stash_value(&PROCESSOR_IMAGE, image)?;
        Ok(ReconcileResult::done())
    }
}

/// Resolves `status.latestImage` from the referenced build, or from the
/// template when no build is referenced
#[derive(Debug, Default, Clone, Copy)]
pub struct BuildRefReconciler;

#[async_trait]
impl SubReconciler<Processor> for BuildRefReconciler {
    fn name(&self) -> &'static str {
        "BuildRef"
    }

    async fn reconcile(&self, ctx: &Context, parent: &mut Parent<'_, Processor>) -> Result<ReconcileResult, ReconcilerError> {
        let Some(build) = parent.resource().spec.build.clone() else {
            let image = parent.resource().template_image().map(ToString::to_string);
            parent.status_mut().latest_image = image;
            return Ok(ReconcileResult::done());
        };

        let latest = if let Some(name) = &build.container_ref {
            latest_image_of::<Container, _>(ctx, parent, name).await?
        } else if let Some(name) = &build.function_ref {
            latest_image_of::<Function, _>(ctx, parent, name).await?
        } else {
            let message = "invalid build: one of containerRef or functionRef is required";
            parent
                .conditions()
                .mark_false(CONDITION_DEPLOYMENT_READY, REASON_BUILD_INVALID, message);
            return Err(ReconcilerError::invalid(REASON_BUILD_INVALID, message));
        };
        if latest.is_some() {
            parent.status_mut().latest_image = latest;
        }
        Ok(ReconcileResult::done())
    }
}

/// Fetches every input and output stream and reports whether all are ready
///
/// Skipped until there is an image to run. A stream that does not exist
/// stops the chain so the running Deployment is left alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResolveStreamsReconciler;

impl ResolveStreamsReconciler {
    async fn resolve(
        &self,
        ctx: &Context,
        parent: &mut Parent<'_, Processor>,
        names: &[String],
    ) -> Result<Vec<Stream>, ReconcilerError> {
        let mut streams = Vec::with_capacity(names.len());
        for name in names {
            ctx.track(&TrackedKey::new::<Stream>(parent.namespace(), name), &parent.key());
            let Some(stream) = ctx.client.get_opt::<Stream>(parent.namespace(), name).await? else {
                let message = format!("stream {name:?} not found");
                parent
                    .conditions()
                    .mark_false(CONDITION_STREAMS_READY, REASON_STREAM_NOT_READY, &message);
                return Err(ReconcilerError::invalid(REASON_STREAM_NOT_READY, message));
            };
            streams.push(stream);
        }
        Ok(streams)
    }
}

#[async_trait]
impl SubReconciler<Processor> for ResolveStreamsReconciler {
    fn name(&self) -> &'static str {
        "ResolveStreams"
    }

    async fn reconcile(&self, ctx: &Context, parent: &mut Parent<'_, Processor>) -> Result<ReconcileResult, ReconcilerError> {
        if parent.status().latest_image.is_none() {
            return Ok(ReconcileResult::done());
        }
        let spec = &parent.resource().spec;
        let input_names: Vec<String> = spec.inputs.iter().map(|b| b.stream.clone()).collect();
        let output_names: Vec<String> = spec.outputs.iter().map(|b| b.stream.clone()).collect();

        let inputs = self.resolve(ctx, parent, &input_names).await?;
        let outputs = self.resolve(ctx, parent, &output_names).await?;

        let not_ready = inputs.iter().chain(&outputs).find_map(|stream| {
            let ready = stream.status.as_ref().and_then(|s| s.get_condition(CONDITION_READY));
            match ready {
                Some(c) if c.is_true() => None,
                Some(c) => Some(format!(
                    "stream {} is not ready: {}",
                    stream.name_any(),
                    c.message.as_deref().unwrap_or_default()
                )),
                None => Some(format!("stream {} is not ready: stream has no ready condition", stream.name_any())),
            }
        });
        match not_ready {
            None => parent.conditions().mark_true(CONDITION_STREAMS_READY),
            Some(message) => {
                debug!(message = %message, "Waiting on streams");
                parent
                    .conditions()
                    .mark_false(CONDITION_STREAMS_READY, REASON_STREAM_NOT_READY, &message);
            }
        }

        ctx.stash_value(&INPUT_STREAMS, inputs)?;
        ctx.stash_value(&OUTPUT_STREAMS, outputs)?;
        Ok(ReconcileResult::done())
    }
}

fn child_labels(parent: &Parent<'_, Processor>) -> BTreeMap<String, String> {
    let mut labels = parent.resource().meta().labels.clone().unwrap_or_default();
    labels.insert(PROCESSOR_LABEL_KEY.to_string(), parent.name().to_string());
    labels
}

fn stream_volume_name(stream: &Stream, part: &str) -> String {
    format!("stream-{}-{part}", stream.metadata.uid.as_deref().unwrap_or_default())
}

/// One volume per bound stream half, sorted by name
fn binding_volumes(inputs: &[Stream], outputs: &[Stream]) -> Vec<Volume> {
    let unique: BTreeMap<String, &Stream> = inputs
        .iter()
        .chain(outputs)
        .map(|stream| (stream.name_any(), stream))
        .collect();
    let mut volumes = Vec::new();
    for stream in unique.values() {
        let binding = stream.status.as_ref().map(|s| &s.binding);
        if let Some(metadata) = binding.and_then(|b| b.metadata_ref.as_ref()) {
            volumes.push(Volume {
                name: stream_volume_name(stream, "metadata"),
                config_map: Some(ConfigMapVolumeSource {
                    name: metadata.name.clone(),
                    ..ConfigMapVolumeSource::default()
                }),
                ..Volume::default()
            });
        }
        if let Some(secret) = binding.and_then(|b| b.secret_ref.as_ref()) {
            volumes.push(Volume {
                name: stream_volume_name(stream, "secret"),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.name.clone()),
                    ..SecretVolumeSource::default()
                }),
                ..Volume::default()
            });
        }
    }
    volumes.sort_by(|a, b| a.name.cmp(&b.name));
    volumes
}

/// Mounts for each binding, numbered by position within inputs or outputs
fn binding_mounts(direction: &str, streams: &[Stream]) -> Vec<VolumeMount> {
    let mut mounts = Vec::new();
    for (i, stream) in streams.iter().enumerate() {
        let binding = stream.status.as_ref().map(|s| &s.binding);
        let halves = [
            ("metadata", binding.is_some_and(|b| b.metadata_ref.is_some())),
            ("secret", binding.is_some_and(|b| b.secret_ref.is_some())),
        ];
        for (part, bound) in halves {
            if bound {
                mounts.push(VolumeMount {
                    name: stream_volume_name(stream, part),
                    mount_path: format!("{BINDINGS_ROOT}/{direction}_{i:03}/{part}"),
                    read_only: Some(true),
                    ..VolumeMount::default()
                });
            }
        }
    }
    mounts
}

fn sidecar_env(processor: &Processor) -> Vec<EnvVar> {
    let spec = &processor.spec;
    let join = |values: Vec<&str>| values.join(",");
    let vars = [
        ("CNB_BINDINGS", BINDINGS_ROOT.to_string()),
        (
            "INPUT_START_OFFSETS",
            join(spec.inputs.iter().map(|b| b.start_offset.as_str()).collect()),
        ),
        ("INPUT_NAMES", join(spec.inputs.iter().map(|b| b.alias.as_str()).collect())),
        ("OUTPUT_NAMES", join(spec.outputs.iter().map(|b| b.alias.as_str()).collect())),
        ("GROUP", processor.name_any()),
        ("FUNCTION", format!("localhost:{FUNCTION_PORT}")),
    ];
    vars.into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value),
            value_from: None,
        })
        .collect()
}

/// Manages the Processor's Deployment: the function plus the stream sidecar
#[derive(Debug, Default, Clone, Copy)]
pub struct DeploymentManager;

#[async_trait]
impl ChildManager for DeploymentManager {
    type Parent = Processor;
    type Child = Deployment;

    fn label_key(&self) -> &'static str {
        PROCESSOR_LABEL_KEY
    }

    async fn desired_child(&self, ctx: &Context, parent: &Parent<'_, Processor>) -> Result<Option<Deployment>, ReconcilerError> {
        let Some(latest_image) = parent.status().latest_image.clone() else {
            return Ok(None);
        };
        let (Some(inputs), Some(outputs), Some(processor_image)) = (
            ctx.retrieve_value(&INPUT_STREAMS)?,
            ctx.retrieve_value(&OUTPUT_STREAMS)?,
            ctx.retrieve_value(&PROCESSOR_IMAGE)?,
        ) else {
            return Ok(None);
        };
        let processor = parent.resource();
        let labels = child_labels(parent);

        let mut mounts = binding_mounts("input", &inputs);
        mounts.extend(binding_mounts("output", &outputs));

        let mut template = processor.spec.template.clone().unwrap_or_default();
        template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
        let pod = template.spec.get_or_insert_with(PodSpec::default);
        if pod.containers.is_empty() {
            pod.containers.push(PodContainer::default());
        }
        pod.containers[0].image = Some(latest_image);
        pod.containers[0].ports = Some(vec![ContainerPort {
            container_port: FUNCTION_PORT,
            ..ContainerPort::default()
        }]);
        pod.containers.push(PodContainer {
            name: PROCESSOR_CONTAINER_NAME.to_string(),
            image: Some(processor_image),
            env: Some(sidecar_env(processor)),
            volume_mounts: Some(mounts),
            ..PodContainer::default()
        });
        pod.volumes
            .get_or_insert_with(Vec::new)
            .extend(binding_volumes(&inputs, &outputs));

        Ok(Some(Deployment {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-processor-", parent.name())),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        PROCESSOR_LABEL_KEY.to_string(),
                        parent.name().to_string(),
                    )])),
                    match_expressions: None,
                },
                template,
                ..DeploymentSpec::default()
            }),
            status: None,
        }))
    }

    fn reflect_child_status(&self, parent: &mut Parent<'_, Processor>, child: &ChildOutcome<Deployment>) {
        match child {
            ChildOutcome::Present(deployment) => {
                parent.status_mut().deployment_ref = TypedLocalObjectReference::for_object(deployment);
                mark_deployment_readiness(&mut parent.conditions(), deployment);
            }
            ChildOutcome::Absent => parent.status_mut().deployment_ref = None,
            ChildOutcome::NotOwned { name } => {
                parent.status_mut().deployment_ref = None;
                let message = not_owned_message("Deployment", name, &parent.kind());
                parent.conditions().mark_false_with_severity(
                    CONDITION_DEPLOYMENT_READY,
                    ConditionSeverity::Warning,
                    "NotOwned",
                    &message,
                );
            }
        }
    }

    fn semantic_equals(&self, desired: &Deployment, actual: &Deployment) -> bool {
        let (Some(want), Some(have)) = (desired.spec.as_ref(), actual.spec.as_ref()) else {
            return false;
        };
        labels_match(desired, actual)
            && want.replicas == have.replicas
            && want.selector == have.selector
            && template_matches(&want.template, &have.template)
    }

    fn merge_before_update(&self, current: &mut Deployment, desired: &Deployment) {
        merge_labels(current, desired);
        current.spec = desired.spec.clone();
    }

    /// Replicas belong to the autoscaler once the Deployment exists
    fn harmonize_immutable_fields(&self, current: &Deployment, desired: &mut Deployment) {
        let (Some(current), Some(desired)) = (current.spec.as_ref(), desired.spec.as_mut()) else {
            return;
        };
        if current.replicas.is_some() {
            desired.replicas = current.replicas;
        }
        desired.strategy = desired.strategy.take().or_else(|| current.strategy.clone());
        desired.revision_history_limit = desired.revision_history_limit.or(current.revision_history_limit);
        desired.progress_deadline_seconds = desired.progress_deadline_seconds.or(current.progress_deadline_seconds);
    }
}

/// Manages the KEDA ScaledObject scaling the Deployment on input lag
#[derive(Debug, Default, Clone, Copy)]
pub struct ScaledObjectManager;

impl ScaledObjectManager {
    /// Gateway and topic of every input, from the stream binding secrets
    ///
    /// `None` while any binding is missing or incomplete.
    async fn input_addresses(
        &self,
        ctx: &Context,
        parent: &Parent<'_, Processor>,
        inputs: &[Stream],
    ) -> Result<Option<Vec<(String, String)>>, ReconcilerError> {
        let mut addresses = Vec::with_capacity(inputs.len());
        for stream in inputs {
            let Some(secret_name) = stream
                .status
                .as_ref()
                .and_then(|s| s.binding.secret_ref.as_ref())
                .map(|r| r.name.clone())
            else {
                return Ok(None);
            };
            ctx.track(&TrackedKey::new::<Secret>(parent.namespace(), &secret_name), &parent.key());
            let Some(secret) = ctx.client.get_opt::<Secret>(parent.namespace(), &secret_name).await? else {
                debug!(secret = %secret_name, "Binding secret not found");
                return Ok(None);
            };
            let data = secret.data.unwrap_or_default();
            let value = |key: &str| data.get(key).map(|v| String::from_utf8_lossy(&v.0).into_owned());
            let (Some(gateway), Some(topic)) = (value("gateway"), value("topic")) else {
                debug!(secret = %secret_name, "Binding secret is missing gateway or topic");
                return Ok(None);
            };
            addresses.push((gateway, topic));
        }
        Ok(Some(addresses))
    }
}

#[async_trait]
impl ChildManager for ScaledObjectManager {
    type Parent = Processor;
    type Child = ScaledObject;

    fn label_key(&self) -> &'static str {
        PROCESSOR_LABEL_KEY
    }

    async fn desired_child(&self, ctx: &Context, parent: &Parent<'_, Processor>) -> Result<Option<ScaledObject>, ReconcilerError> {
        let Some(deployment) = parent.status().deployment_ref.clone() else {
            return Ok(None);
        };
        let Some(inputs) = ctx.retrieve_value(&INPUT_STREAMS)? else {
            return Ok(None);
        };
        let Some(addresses) = self.input_addresses(ctx, parent, &inputs).await? else {
            return Ok(None);
        };

        // Scale to zero while a stream is not ready
        let streams_ready = parent.status().get_condition(CONDITION_STREAMS_READY);
        let max_replicas = if streams_ready.is_some_and(|c| c.is_false()) {
            0
        } else {
            MAX_REPLICAS
        };
        let triggers = addresses
            .into_iter()
            .map(|(gateway, topic)| ScaledObjectTrigger {
                type_: SCALER_TYPE.to_string(),
                metadata: BTreeMap::from([
                    ("address".to_string(), gateway),
                    ("group".to_string(), parent.name().to_string()),
                    ("topic".to_string(), topic),
                ]),
            })
            .collect();

        let mut scaled_object = ScaledObject::new(
            "",
            ScaledObjectSpec {
                scale_target_ref: ScaleTarget {
                    deployment_name: deployment.name,
                },
                polling_interval: Some(1),
                cooldown_period: Some(30),
                min_replica_count: Some(1),
                max_replica_count: Some(max_replicas),
                triggers,
            },
        );
        scaled_object.metadata = ObjectMeta {
            generate_name: Some(format!("{}-processor-", parent.name())),
            labels: Some(child_labels(parent)),
            ..ObjectMeta::default()
        };
        Ok(Some(scaled_object))
    }

    fn reflect_child_status(&self, parent: &mut Parent<'_, Processor>, child: &ChildOutcome<ScaledObject>) {
        match child {
            ChildOutcome::Present(scaled_object) => {
                parent.status_mut().scaled_object_ref = TypedLocalObjectReference::for_object(scaled_object);
                parent.conditions().mark_true(CONDITION_SCALED_OBJECT_READY);
            }
            ChildOutcome::Absent => parent.status_mut().scaled_object_ref = None,
            ChildOutcome::NotOwned { name } => {
                parent.status_mut().scaled_object_ref = None;
                let message = not_owned_message("ScaledObject", name, &parent.kind());
                parent.conditions().mark_false_with_severity(
                    CONDITION_SCALED_OBJECT_READY,
                    ConditionSeverity::Warning,
                    "NotOwned",
                    &message,
                );
            }
        }
    }

    fn semantic_equals(&self, desired: &ScaledObject, actual: &ScaledObject) -> bool {
        desired.spec == actual.spec && labels_match(desired, actual)
    }

    fn merge_before_update(&self, current: &mut ScaledObject, desired: &ScaledObject) {
        merge_labels(current, desired);
        current.spec = desired.spec.clone();
    }
}
