//! # Stream Reconciler
//!
//! Provisions a stream on its Gateway, then publishes how to reach it as a
//! binding: a ConfigMap describing the stream and a Secret holding the
//! gateway address and topic. Processors mount both.

use crate::controller::conditions::{ConditionSet, ConditionSetError};
use crate::controller::reconciler::{
    labels_match, merge_labels, ChildManager, ChildOutcome, ChildReconciler, Context, Parent,
    ParentReconciler, ReconcileResult, ReconcilerError, SubReconciler,
};
use crate::controller::stash::STREAM_ADDRESS;
use crate::controller::tracker::TrackedKey;
use crate::crd::{
    Gateway, LocalObjectReference, ResourceStatus, Stream, CONDITION_BINDING_READY,
    CONDITION_RESOURCE_AVAILABLE, STREAM_LABEL_KEY,
};
use anyhow::anyhow;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const REASON_PROVISION_FAILED: &str = "ProvisionFailed";
pub const REASON_BINDING_FAILED: &str = "BindingFailed";

/// `kind` recorded in the binding metadata
const BINDING_KIND: &str = "Stream.streaming.projectriff.io";
const BINDING_PROVIDER: &str = "riff Streaming";

pub fn binding_metadata_name(stream: &str) -> String {
    format!("{stream}-stream-binding-metadata")
}

pub fn binding_secret_name(stream: &str) -> String {
    format!("{stream}-stream-binding-secret")
}

pub fn conditions() -> Result<ConditionSet, ConditionSetError> {
    ConditionSet::living([CONDITION_RESOURCE_AVAILABLE, CONDITION_BINDING_READY])
}

pub fn reconciler() -> Result<ParentReconciler<Stream>, ConditionSetError> {
    let subs: Vec<Box<dyn SubReconciler<Stream>>> = vec![
        Box::new(ProvisionReconciler),
        Box::new(ChildReconciler::new("BindingMetadata", BindingMetadataManager)),
        Box::new(ChildReconciler::new("BindingSecret", BindingSecretManager)),
        Box::new(BindingConditionReconciler),
    ];
    Ok(ParentReconciler::new(Arc::new(conditions()?), subs))
}

/// Asks the Gateway's provisioner for the stream's address
///
/// A missing or unready Gateway is reported on the status and waits for
/// the Gateway to change; failures talking to the provisioner are retried.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProvisionReconciler;

#[async_trait]
impl SubReconciler<Stream> for ProvisionReconciler {
    fn name(&self) -> &'static str {
        "Provision"
    }

    async fn reconcile(&self, ctx: &Context, parent: &mut Parent<'_, Stream>) -> Result<ReconcileResult, ReconcilerError> {
        let namespace = parent.namespace().to_string();
        let gateway_name = parent.resource().spec.gateway.name.clone();
        ctx.track(&TrackedKey::new::<Gateway>(&namespace, &gateway_name), &parent.key());

        let gateway = match ctx.client.get_opt::<Gateway>(&namespace, &gateway_name).await {
            Ok(Some(gateway)) => gateway,
            Ok(None) => {
                parent.conditions().mark_false(
                    CONDITION_RESOURCE_AVAILABLE,
                    REASON_PROVISION_FAILED,
                    &format!("Gateway {gateway_name:?} not found"),
                );
                return Ok(ReconcileResult::done());
            }
            Err(e) => {
                parent
                    .conditions()
                    .mark_false(CONDITION_RESOURCE_AVAILABLE, REASON_PROVISION_FAILED, &e.to_string());
                return Err(e.into());
            }
        };

        let address = gateway
            .status
            .as_ref()
            .filter(|status| status.is_ready())
            .and_then(|status| status.address.as_ref());
        let Some(address) = address else {
            debug!(gateway = %gateway_name, "Gateway is not ready");
            parent.conditions().mark_false(
                CONDITION_RESOURCE_AVAILABLE,
                REASON_PROVISION_FAILED,
                &format!("Gateway {gateway_name:?} not ready"),
            );
            return Ok(ReconcileResult::done());
        };
        let host = reqwest::Url::parse(&address.url)
            .ok()
            .and_then(|url| url.host_str().map(ToString::to_string))
            .ok_or_else(|| anyhow!("Gateway {gateway_name:?} has an unusable address {:?}", address.url))?;
        let url = format!("http://{host}/{namespace}/{}", parent.name());

        match ctx.provisioner()?.provision(&url).await {
            Ok(stream_address) => {
                debug!(topic = %stream_address.topic, "Stream provisioned");
                ctx.stash_value(&STREAM_ADDRESS, stream_address)?;
                parent.conditions().mark_true(CONDITION_RESOURCE_AVAILABLE);
                Ok(ReconcileResult::done())
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Unable to provision stream");
                parent
                    .conditions()
                    .mark_false(CONDITION_RESOURCE_AVAILABLE, REASON_PROVISION_FAILED, &e.to_string());
                Err(anyhow::Error::from(e).into())
            }
        }
    }
}

/// ConfigMap describing the stream to binding consumers
#[derive(Debug, Default, Clone, Copy)]
pub struct BindingMetadataManager;

#[async_trait]
impl ChildManager for BindingMetadataManager {
    type Parent = Stream;
    type Child = ConfigMap;

    fn label_key(&self) -> &'static str {
        STREAM_LABEL_KEY
    }

    async fn desired_child(&self, ctx: &Context, parent: &Parent<'_, Stream>) -> Result<Option<ConfigMap>, ReconcilerError> {
        if ctx.retrieve_value(&STREAM_ADDRESS)?.is_none() {
            return Ok(None);
        }
        let stream = parent.resource();
        Ok(Some(ConfigMap {
            metadata: ObjectMeta {
                name: Some(binding_metadata_name(parent.name())),
                labels: stream.metadata.labels.clone(),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([
                ("kind".to_string(), BINDING_KIND.to_string()),
                ("provider".to_string(), BINDING_PROVIDER.to_string()),
                ("tags".to_string(), String::new()),
                ("stream".to_string(), parent.name().to_string()),
                ("contentType".to_string(), stream.spec.content_type.clone()),
            ])),
            ..ConfigMap::default()
        }))
    }

    fn reflect_child_status(&self, parent: &mut Parent<'_, Stream>, child: &ChildOutcome<ConfigMap>) {
        match child {
            ChildOutcome::Present(config_map) => {
                parent.status_mut().binding.metadata_ref = config_map
                    .metadata
                    .name
                    .clone()
                    .map(|name| LocalObjectReference { name });
            }
            ChildOutcome::Absent => parent.status_mut().binding.metadata_ref = None,
            ChildOutcome::NotOwned { name } => {
                parent.status_mut().binding.metadata_ref = None;
                parent.conditions().mark_false(
                    CONDITION_BINDING_READY,
                    REASON_BINDING_FAILED,
                    &format!("binding metadata {name:?} already exists"),
                );
            }
        }
    }

    fn semantic_equals(&self, desired: &ConfigMap, actual: &ConfigMap) -> bool {
        desired.data == actual.data && labels_match(desired, actual)
    }

    fn merge_before_update(&self, current: &mut ConfigMap, desired: &ConfigMap) {
        merge_labels(current, desired);
        current.data.clone_from(&desired.data);
    }
}

/// Secret holding the gateway address and topic of the stream
#[derive(Debug, Default, Clone, Copy)]
pub struct BindingSecretManager;

#[async_trait]
impl ChildManager for BindingSecretManager {
    type Parent = Stream;
    type Child = Secret;

    fn label_key(&self) -> &'static str {
        STREAM_LABEL_KEY
    }

    async fn desired_child(&self, ctx: &Context, parent: &Parent<'_, Stream>) -> Result<Option<Secret>, ReconcilerError> {
        let Some(address) = ctx.retrieve_value(&STREAM_ADDRESS)? else {
            return Ok(None);
        };
        Ok(Some(Secret {
            metadata: ObjectMeta {
                name: Some(binding_secret_name(parent.name())),
                labels: parent.resource().metadata.labels.clone(),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([
                ("gateway".to_string(), ByteString(address.gateway.into_bytes())),
                ("topic".to_string(), ByteString(address.topic.into_bytes())),
            ])),
            ..Secret::default()
        }))
    }

    fn reflect_child_status(&self, parent: &mut Parent<'_, Stream>, child: &ChildOutcome<Secret>) {
        match child {
            ChildOutcome::Present(secret) => {
                parent.status_mut().binding.secret_ref = secret
                    .metadata
                    .name
                    .clone()
                    .map(|name| LocalObjectReference { name });
            }
            ChildOutcome::Absent => parent.status_mut().binding.secret_ref = None,
            ChildOutcome::NotOwned { name } => {
                parent.status_mut().binding.secret_ref = None;
                parent.conditions().mark_false(
                    CONDITION_BINDING_READY,
                    REASON_BINDING_FAILED,
                    &format!("binding secret {name:?} already exists"),
                );
            }
        }
    }

    fn semantic_equals(&self, desired: &Secret, actual: &Secret) -> bool {
        desired.data == actual.data && labels_match(desired, actual)
    }

    fn merge_before_update(&self, current: &mut Secret, desired: &Secret) {
        merge_labels(current, desired);
        current.data.clone_from(&desired.data);
    }
}

/// The binding is ready once both halves are in place
#[derive(Debug, Default, Clone, Copy)]
pub struct BindingConditionReconciler;

#[async_trait]
impl SubReconciler<Stream> for BindingConditionReconciler {
    fn name(&self) -> &'static str {
        "BindingCondition"
    }

    async fn reconcile(&self, _ctx: &Context, parent: &mut Parent<'_, Stream>) -> Result<ReconcileResult, ReconcilerError> {
        let binding = &parent.status().binding;
        if binding.metadata_ref.is_some() && binding.secret_ref.is_some() {
            if !parent.status().get_condition(CONDITION_BINDING_READY).is_some_and(|c| c.is_true()) {
                info!("Stream binding is ready");
            }
            parent.conditions().mark_true(CONDITION_BINDING_READY);
        }
        Ok(ReconcileResult::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tracker::NamespacedName;
    use crate::controllers::test_support::{meta, Harness, NAMESPACE};
    use crate::crd::{
        Addressable, Condition, ConditionStatus, GatewaySpec, GatewayStatus, Status, StreamSpec,
        CONDITION_READY,
    };
    use crate::provisioner::{MemoryProvisioner, StreamAddress};

    const PROVISIONER_URL: &str = "http://franz.default.svc.cluster.local/default/letters";

    fn gateway(ready: bool) -> Gateway {
        let mut gateway = Gateway::new("franz", GatewaySpec::default());
        gateway.metadata = meta("franz");
        let status = if ready { ConditionStatus::True } else { ConditionStatus::Unknown };
        gateway.status = Some(GatewayStatus {
            common: Status {
                observed_generation: None,
                conditions: vec![Condition::new(CONDITION_READY, status)],
            },
            address: Some(Addressable {
                url: "http://franz.default.svc.cluster.local:6565".to_string(),
            }),
        });
        gateway
    }

    fn stream() -> Stream {
        let mut stream = Stream::new(
            "letters",
            StreamSpec {
                gateway: LocalObjectReference {
                    name: "franz".to_string(),
                },
                content_type: "text/plain".to_string(),
            },
        );
        stream.metadata = meta("letters");
        stream
    }

    fn address() -> StreamAddress {
        StreamAddress {
            gateway: "franz.default.svc.cluster.local:6565".to_string(),
            topic: "default/letters".to_string(),
        }
    }

    fn harness(provisioner: &Arc<MemoryProvisioner>) -> Harness {
        let mut h = Harness::new();
        h.ctx = h.ctx.clone().with_provisioner(Arc::clone(provisioner) as _);
        h
    }

    async fn reconcile(h: &Harness) -> Result<ReconcileResult, ReconcilerError> {
        reconciler()
            .unwrap()
            .reconcile(&h.ctx, &NamespacedName::new(NAMESPACE, "letters"))
            .await
    }

    #[tokio::test]
    async fn test_provisioned_stream_publishes_binding() {
        let provisioner = Arc::new(MemoryProvisioner::new());
        provisioner.respond(PROVISIONER_URL, address());
        let h = harness(&provisioner);
        h.seed(&gateway(true));
        h.seed(&stream());

        reconcile(&h).await.unwrap();

        assert_eq!(provisioner.calls(), vec![PROVISIONER_URL.to_string()]);
        let metadata = h.get::<ConfigMap>("letters-stream-binding-metadata").unwrap();
        let data = metadata.data.unwrap();
        assert_eq!(data["kind"], "Stream.streaming.projectriff.io");
        assert_eq!(data["stream"], "letters");
        assert_eq!(data["contentType"], "text/plain");
        assert_eq!(
            metadata.metadata.labels.unwrap()[STREAM_LABEL_KEY],
            "letters"
        );

        let secret = h.get::<Secret>("letters-stream-binding-secret").unwrap();
        let data = secret.data.unwrap();
        assert_eq!(data["gateway"].0, b"franz.default.svc.cluster.local:6565");
        assert_eq!(data["topic"].0, b"default/letters");

        let status = h.get::<Stream>("letters").unwrap().status.unwrap();
        assert_eq!(
            status.binding.metadata_ref.as_ref().unwrap().name,
            "letters-stream-binding-metadata"
        );
        assert_eq!(status.binding.secret_ref.as_ref().unwrap().name, "letters-stream-binding-secret");
        assert!(status.get_condition(CONDITION_BINDING_READY).unwrap().is_true());
        assert!(status.is_ready());
    }

    #[tokio::test]
    async fn test_missing_gateway_waits_for_it() {
        let provisioner = Arc::new(MemoryProvisioner::new());
        let h = harness(&provisioner);
        h.seed(&stream());

        assert_eq!(reconcile(&h).await.unwrap(), ReconcileResult::done());

        let status = h.get::<Stream>("letters").unwrap().status.unwrap();
        let available = status.get_condition(CONDITION_RESOURCE_AVAILABLE).unwrap();
        assert!(available.is_false());
        assert_eq!(available.reason.as_deref(), Some(REASON_PROVISION_FAILED));
        assert_eq!(available.message.as_deref(), Some(r#"Gateway "franz" not found"#));
        assert!(provisioner.calls().is_empty());
        assert!(h.all::<ConfigMap>().is_empty());
        assert_eq!(
            h.tracker
                .lookup(&TrackedKey::new::<Gateway>(NAMESPACE, "franz")),
            vec![NamespacedName::new(NAMESPACE, "letters")]
        );
    }

    #[tokio::test]
    async fn test_unready_gateway_is_not_provisioned_against() {
        let provisioner = Arc::new(MemoryProvisioner::new());
        let h = harness(&provisioner);
        h.seed(&gateway(false));
        h.seed(&stream());

        reconcile(&h).await.unwrap();

        let status = h.get::<Stream>("letters").unwrap().status.unwrap();
        let available = status.get_condition(CONDITION_RESOURCE_AVAILABLE).unwrap();
        assert_eq!(available.message.as_deref(), Some(r#"Gateway "franz" not ready"#));
        assert!(provisioner.calls().is_empty());
        assert!(status.binding.metadata_ref.is_none());
    }

    #[tokio::test]
    async fn test_provisioner_failure_is_retried() {
        let provisioner = Arc::new(MemoryProvisioner::new());
        provisioner.fail(PROVISIONER_URL, "connection refused");
        let h = harness(&provisioner);
        h.seed(&gateway(true));
        h.seed(&stream());

        assert!(matches!(
            reconcile(&h).await,
            Err(ReconcilerError::ReconciliationFailed(_))
        ));

        let status = h.get::<Stream>("letters").unwrap().status.unwrap();
        let available = status.get_condition(CONDITION_RESOURCE_AVAILABLE).unwrap();
        assert!(available.is_false());
        assert!(available
            .message
            .as_deref()
            .unwrap_or_default()
            .contains("connection refused"));
        assert!(h.all::<Secret>().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_binding_metadata_fails_binding() {
        let provisioner = Arc::new(MemoryProvisioner::new());
        provisioner.respond(PROVISIONER_URL, address());
        let h = harness(&provisioner);
        h.seed(&gateway(true));
        h.seed(&stream());
        h.seed(&ConfigMap {
            metadata: meta("letters-stream-binding-metadata"),
            ..ConfigMap::default()
        });

        reconcile(&h).await.unwrap();

        let status = h.get::<Stream>("letters").unwrap().status.unwrap();
        assert!(status.binding.metadata_ref.is_none());
        assert!(status.binding.secret_ref.is_some());
        let binding = status.get_condition(CONDITION_BINDING_READY).unwrap();
        assert!(binding.is_false());
        assert_eq!(binding.reason.as_deref(), Some(REASON_BINDING_FAILED));
        assert_eq!(
            binding.message.as_deref(),
            Some(r#"binding metadata "letters-stream-binding-metadata" already exists"#)
        );
        assert!(!status.is_ready());
        assert!(h
            .get::<ConfigMap>("letters-stream-binding-metadata")
            .unwrap()
            .data
            .is_none());
    }

    #[tokio::test]
    async fn test_provisioner_must_be_installed() {
        let h = Harness::new();
        h.seed(&gateway(true));
        h.seed(&stream());

        assert!(matches!(
            reconcile(&h).await,
            Err(ReconcilerError::MissingClient(_))
        ));
    }
}
