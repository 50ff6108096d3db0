//! # Deployer Reconciler
//!
//! Runs the latest image of a build resource as a Deployment behind a
//! ClusterIP Service.
//!
//! Chain: BuildRef → ChildDeployment → ChildService. The Service is only
//! wanted once a Deployment exists, and the Deployment only once a latest
//! image is known.

use crate::controller::conditions::{ConditionManager, ConditionSet, ConditionSetError};
use crate::controller::ownership::not_owned_message;
use crate::controller::reconciler::{
    labels_match, merge_labels, ChildManager, ChildOutcome, ChildReconciler, Context, Parent,
    ParentReconciler, ReconcileResult, ReconcilerError, SubReconciler,
};
use crate::controller::tracker::TrackedKey;
use crate::crd::{
    Addressable, Application, Condition, ConditionSeverity, ConditionStatus, Container, Deployer, Function,
    ImageStatus, Reconcilable, TypedLocalObjectReference, CONDITION_DEPLOYMENT_READY, CONDITION_SERVICE_READY,
    DEPLOYER_LABEL_KEY,
};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container as PodContainer, EnvVar, PodTemplateSpec, Probe, Service, ServicePort, ServiceSpec, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub const REASON_BUILD_INVALID: &str = "BuildInvalid";

/// Port the Service exposes in front of the serving container
pub const SERVICE_PORT: i32 = 80;

pub fn conditions() -> Result<ConditionSet, ConditionSetError> {
    ConditionSet::living([CONDITION_DEPLOYMENT_READY, CONDITION_SERVICE_READY])
}

pub fn reconciler() -> Result<ParentReconciler<Deployer>, ConditionSetError> {
    let subs: Vec<Box<dyn SubReconciler<Deployer>>> = vec![
        Box::new(BuildRefReconciler),
        Box::new(ChildReconciler::new("ChildDeployment", DeploymentManager)),
        Box::new(ChildReconciler::new("ChildService", ServiceManager)),
    ];
    Ok(ParentReconciler::new(Arc::new(conditions()?), subs))
}

/// Latest image of build resource `name`, tracking it for `parent`
///
/// A missing build resource yields `None`; it is picked up once created.
pub(crate) async fn latest_image_of<K, P>(
    ctx: &Context,
    parent: &Parent<'_, P>,
    name: &str,
) -> Result<Option<String>, ReconcilerError>
where
    K: Reconcilable,
    K::Status: ImageStatus,
    P: Reconcilable,
{
    ctx.track(&TrackedKey::new::<K>(parent.namespace(), name), &parent.key());
    let Some(build) = ctx.client.get_opt::<K>(parent.namespace(), name).await? else {
        debug!(build.kind = %K::kind(&()), build.name = %name, "Referenced build not found");
        return Ok(None);
    };
    Ok(build
        .status()
        .and_then(ImageStatus::latest_image)
        .filter(|image| !image.is_empty())
        .map(ToString::to_string))
}

/// Resolves `status.latestImage` from the referenced build resource, or
/// from the template when no build is referenced
#[derive(Debug, Default, Clone, Copy)]
pub struct BuildRefReconciler;

#[async_trait]
impl SubReconciler<Deployer> for BuildRefReconciler {
    fn name(&self) -> &'static str {
        "BuildRef"
    }

    async fn reconcile(
        &self,
        ctx: &Context,
        parent: &mut Parent<'_, Deployer>,
    ) -> Result<ReconcileResult, ReconcilerError> {
        let Some(build) = parent.resource().spec.build.clone() else {
            let image = parent
                .resource()
                .serving_container()
                .and_then(|c| c.image.clone())
                .filter(|image| !image.is_empty());
            parent.status_mut().latest_image = image;
            return Ok(ReconcileResult::done());
        };

        let latest = if let Some(name) = &build.application_ref {
            latest_image_of::<Application, _>(ctx, parent, name).await?
        } else if let Some(name) = &build.container_ref {
            latest_image_of::<Container, _>(ctx, parent, name).await?
        } else if let Some(name) = &build.function_ref {
            latest_image_of::<Function, _>(ctx, parent, name).await?
        } else {
            let message = "invalid build: one of applicationRef, containerRef or functionRef is required";
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

fn child_labels(parent: &Parent<'_, Deployer>) -> BTreeMap<String, String> {
    let mut labels = parent.resource().meta().labels.clone().unwrap_or_default();
    labels.insert(DEPLOYER_LABEL_KEY.to_string(), parent.name().to_string());
    labels
}

/// Manages the Deployer's Deployment
#[derive(Debug, Default, Clone, Copy)]
pub struct DeploymentManager;

#[async_trait]
impl ChildManager for DeploymentManager {
    type Parent = Deployer;
    type Child = Deployment;

    fn label_key(&self) -> &'static str {
        DEPLOYER_LABEL_KEY
    }

    async fn desired_child(
        &self,
        _ctx: &Context,
        parent: &Parent<'_, Deployer>,
    ) -> Result<Option<Deployment>, ReconcilerError> {
        let Some(latest_image) = parent.status().latest_image.clone() else {
            return Ok(None);
        };
        let labels = child_labels(parent);
        let port = parent.resource().serving_port().map(|p| p.container_port);

        let mut template = parent.resource().spec.template.clone();
        template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
        if let Some(container) = template.spec.as_mut().and_then(|pod| pod.containers.first_mut()) {
            if container.image.as_deref().unwrap_or_default().is_empty() {
                container.image = Some(latest_image);
            }
            if let Some(port) = port {
                let env = container.env.get_or_insert_with(Vec::new);
                if !env.iter().any(|e| e.name == "PORT") {
                    env.push(EnvVar {
                        name: "PORT".to_string(),
                        value: Some(port.to_string()),
                        value_from: None,
                    });
                }
                container.readiness_probe.get_or_insert_with(|| Probe {
                    tcp_socket: Some(TCPSocketAction {
                        host: None,
                        port: IntOrString::Int(port),
                    }),
                    ..Probe::default()
                });
            }
        }

        Ok(Some(Deployment {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-deployer-", parent.name())),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        DEPLOYER_LABEL_KEY.to_string(),
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

    fn reflect_child_status(&self, parent: &mut Parent<'_, Deployer>, child: &ChildOutcome<Deployment>) {
        match child {
            ChildOutcome::Present(deployment) => {
                parent.status_mut().deployment_ref = TypedLocalObjectReference::for_object(deployment);
                mark_deployment_readiness(&mut parent.conditions(), deployment);
            }
            ChildOutcome::Absent => {
                parent.status_mut().deployment_ref = None;
                parent.conditions().mark_unknown(
                    CONDITION_DEPLOYMENT_READY,
                    "LatestImageMissing",
                    "waiting for a latest image to deploy",
                );
            }
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

    /// Compares only what the Deployer sets; fields the API server defaults
    /// on the pod template never count as drift
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

    /// Replicas may be scaled by others; server defaults are kept as found
    fn harmonize_immutable_fields(&self, current: &Deployment, desired: &mut Deployment) {
        let (Some(current), Some(desired)) = (current.spec.as_ref(), desired.spec.as_mut()) else {
            return;
        };
        if desired.replicas.is_none() {
            desired.replicas = current.replicas;
        }
        if desired.strategy.is_none() {
            desired.strategy = current.strategy.clone();
        }
        if desired.revision_history_limit.is_none() {
            desired.revision_history_limit = current.revision_history_limit;
        }
        if desired.progress_deadline_seconds.is_none() {
            desired.progress_deadline_seconds = current.progress_deadline_seconds;
        }
    }
}

pub(crate) fn template_matches(desired: &PodTemplateSpec, actual: &PodTemplateSpec) -> bool {
    let subset = |want: Option<&BTreeMap<String, String>>, have: Option<&BTreeMap<String, String>>| {
        want.into_iter()
            .flatten()
            .all(|(k, v)| have.and_then(|h| h.get(k)) == Some(v))
    };
    let (want_meta, have_meta) = (desired.metadata.as_ref(), actual.metadata.as_ref());
    let containers = |t: &PodTemplateSpec| t.spec.as_ref().map(|p| p.containers.clone()).unwrap_or_default();
    let (want, have) = (containers(desired), containers(actual));
    let volumes = |t: &PodTemplateSpec| -> Vec<String> {
        t.spec
            .as_ref()
            .and_then(|p| p.volumes.as_ref())
            .into_iter()
            .flatten()
            .map(|v| v.name.clone())
            .collect()
    };

    subset(
        want_meta.and_then(|m| m.labels.as_ref()),
        have_meta.and_then(|m| m.labels.as_ref()),
    ) && subset(
        want_meta.and_then(|m| m.annotations.as_ref()),
        have_meta.and_then(|m| m.annotations.as_ref()),
    ) && volumes(desired) == volumes(actual)
        && want.len() == have.len()
        && want.iter().zip(&have).all(|(w, h)| container_matches(w, h))
}

fn container_matches(desired: &PodContainer, actual: &PodContainer) -> bool {
    let ports = |c: &PodContainer| -> Vec<(i32, Option<String>)> {
        c.ports
            .iter()
            .flatten()
            .map(|p| (p.container_port, p.name.clone()))
            .collect()
    };
    let mounts = |c: &PodContainer| -> Vec<(String, String, bool)> {
        c.volume_mounts
            .iter()
            .flatten()
            .map(|m| (m.name.clone(), m.mount_path.clone(), m.read_only.unwrap_or_default()))
            .collect()
    };
    let readiness = |c: &PodContainer| {
        c.readiness_probe
            .as_ref()
            .map(|p| (p.tcp_socket.clone(), p.http_get.clone(), p.exec.clone(), p.grpc.clone()))
    };
    desired.name == actual.name
        && desired.image == actual.image
        && desired.command == actual.command
        && desired.args == actual.args
        && desired.env.as_deref().unwrap_or_default() == actual.env.as_deref().unwrap_or_default()
        && desired.resources.clone().unwrap_or_default() == actual.resources.clone().unwrap_or_default()
        && ports(desired) == ports(actual)
        && mounts(desired) == mounts(actual)
        && readiness(desired) == readiness(actual)
}

/// Readiness of a Deployment from its Available and Progressing conditions
///
/// `None` until the deployment controller has reported both. A rollout in
/// progress is Unknown rather than False.
pub fn deployment_readiness(deployment: &Deployment) -> Option<Condition> {
    let conditions = deployment.status.as_ref()?.conditions.as_ref()?;
    let find = |type_: &str| conditions.iter().find(|c| c.type_ == type_);
    let available = find("Available")?;
    let progressing = find("Progressing")?;

    let from = |status: ConditionStatus, reason: &Option<String>, message: &Option<String>| {
        Condition::new(CONDITION_DEPLOYMENT_READY, status).with_reason(
            reason.clone().unwrap_or_default(),
            message.clone().unwrap_or_default(),
        )
    };
    let available_status = ConditionStatus::from_k8s(&available.status);
    if progressing.status == "True" && available_status == ConditionStatus::False {
        return Some(from(ConditionStatus::Unknown, &progressing.reason, &progressing.message));
    }
    Some(from(available_status, &available.reason, &available.message))
}

/// Copy a Deployment's readiness onto `DeploymentReady`
pub(crate) fn mark_deployment_readiness(conditions: &mut ConditionManager<'_>, deployment: &Deployment) {
    let Some(condition) = deployment_readiness(deployment) else {
        return;
    };
    let reason = condition.reason.as_deref().unwrap_or_default();
    let message = condition.message.as_deref().unwrap_or_default();
    match condition.status {
        ConditionStatus::True => conditions.mark_true(CONDITION_DEPLOYMENT_READY),
        ConditionStatus::False => conditions.mark_false(CONDITION_DEPLOYMENT_READY, reason, message),
        ConditionStatus::Unknown => conditions.mark_unknown(CONDITION_DEPLOYMENT_READY, reason, message),
    }
}

/// Manages the Deployer's Service
#[derive(Debug, Default, Clone, Copy)]
pub struct ServiceManager;

#[async_trait]
impl ChildManager for ServiceManager {
    type Parent = Deployer;
    type Child = Service;

    fn label_key(&self) -> &'static str {
        DEPLOYER_LABEL_KEY
    }

    async fn desired_child(
        &self,
        _ctx: &Context,
        parent: &Parent<'_, Deployer>,
    ) -> Result<Option<Service>, ReconcilerError> {
        if parent.status().deployment_ref.is_none() {
            return Ok(None);
        }
        let Some(target) = parent.resource().serving_port() else {
            return Ok(None);
        };
        Ok(Some(Service {
            metadata: ObjectMeta {
                name: Some(parent.name().to_string()),
                labels: Some(child_labels(parent)),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: target.name.clone(),
                    port: SERVICE_PORT,
                    target_port: Some(IntOrString::Int(target.container_port)),
                    ..ServicePort::default()
                }]),
                selector: Some(BTreeMap::from([(
                    DEPLOYER_LABEL_KEY.to_string(),
                    parent.name().to_string(),
                )])),
                ..ServiceSpec::default()
            }),
            status: None,
        }))
    }

    fn reflect_child_status(&self, parent: &mut Parent<'_, Deployer>, child: &ChildOutcome<Service>) {
        match child {
            ChildOutcome::Present(service) => {
                let status = parent.status_mut();
                status.service_ref = TypedLocalObjectReference::for_object(service);
                status.address = Some(Addressable {
                    url: service_url(service),
                });
                parent.conditions().mark_true(CONDITION_SERVICE_READY);
            }
            ChildOutcome::Absent => {
                let status = parent.status_mut();
                status.service_ref = None;
                status.address = None;
                parent.conditions().mark_unknown(
                    CONDITION_SERVICE_READY,
                    "DeploymentMissing",
                    "waiting for the deployment to be created",
                );
            }
            ChildOutcome::NotOwned { name } => {
                let status = parent.status_mut();
                status.service_ref = None;
                status.address = None;
                let message = not_owned_message("Service", name, &parent.kind());
                parent.conditions().mark_false_with_severity(
                    CONDITION_SERVICE_READY,
                    ConditionSeverity::Warning,
                    "NotOwned",
                    &message,
                );
            }
        }
    }

    fn semantic_equals(&self, desired: &Service, actual: &Service) -> bool {
        desired.spec == actual.spec && labels_match(desired, actual)
    }

    fn merge_before_update(&self, current: &mut Service, desired: &Service) {
        merge_labels(current, desired);
        current.spec = desired.spec.clone();
    }

    /// Cluster IPs are assigned once and cannot change
    fn harmonize_immutable_fields(&self, current: &Service, desired: &mut Service) {
        let (Some(current), Some(desired)) = (current.spec.as_ref(), desired.spec.as_mut()) else {
            return;
        };
        desired.cluster_ip = current.cluster_ip.clone();
        desired.cluster_ips = current.cluster_ips.clone();
        if desired.type_.is_none() {
            desired.type_ = current.type_.clone();
        }
        if desired.session_affinity.is_none() {
            desired.session_affinity = current.session_affinity.clone();
        }
        if desired.ip_families.is_none() {
            desired.ip_families = current.ip_families.clone();
        }
        if desired.ip_family_policy.is_none() {
            desired.ip_family_policy = current.ip_family_policy.clone();
        }
        if desired.internal_traffic_policy.is_none() {
            desired.internal_traffic_policy = current.internal_traffic_policy.clone();
        }
    }
}

/// In-cluster URL of a Service
pub fn service_url(service: &Service) -> String {
    format!(
        "http://{}.{}.svc.cluster.local",
        service.meta().name.as_deref().unwrap_or_default(),
        service.meta().namespace.as_deref().unwrap_or_default()
    )
}
