//! # Builders Reconciler
//!
//! Publishes the latest image of every riff ClusterBuilder (those named
//! `riff-*`) in a ConfigMap in the system namespace, so clients can pick a
//! builder without read access to cluster-scoped build objects.
//!
//! Reconciliation is keyed by the system Namespace so the ConfigMap is
//! recreated after it is deleted.

use crate::controller::events::{reasons, EventKind};
use crate::controller::reconciler::{Context, ReconcileResult, Reconciler, ReconcilerError};
use crate::controller::store::Labels;
use crate::controller::tracker::NamespacedName;
use crate::crd::ClusterBuilder;
use crate::observability;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, Instrument};

const KIND: &str = "ConfigMap";

/// ClusterBuilders published by riff
const RIFF_BUILDER_PREFIX: &str = "riff-";

#[must_use]
pub fn is_riff_builder(name: &str) -> bool {
    name.starts_with(RIFF_BUILDER_PREFIX)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BuildersReconciler;

impl BuildersReconciler {
    pub async fn reconcile_builders(&self, ctx: &Context) -> Result<ReconcileResult, ReconcilerError> {
        let namespace = &ctx.config.system_namespace;
        let name = &ctx.config.builders_config_map_name;

        let images: BTreeMap<String, String> = ctx
            .client
            .list::<ClusterBuilder>("", &Labels::new())
            .await?
            .into_iter()
            .filter(|builder| is_riff_builder(&builder.name_any()))
            .map(|builder| {
                let image = builder.status.as_ref().map(|s| s.latest_image.clone()).unwrap_or_default();
                (builder.name_any(), image)
            })
            .collect();

        match ctx.client.get_opt::<ConfigMap>(namespace, name).await? {
            Some(existing) if existing.meta().deletion_timestamp.is_some() => {
                debug!("Builders ConfigMap is being deleted");
            }
            Some(existing) => {
                if existing.data.clone().unwrap_or_default() == images {
                    return Ok(ReconcileResult::done());
                }
                info!(builders = ?images, "Updating builders ConfigMap");
                let mut desired = existing;
                desired.data = Some(images);
                let updated = ctx.client.update(&desired).await?;
                observability::metrics::increment_child_operations("update", KIND);
                ctx.event(
                    &updated.object_ref(&()),
                    EventKind::Normal,
                    reasons::UPDATED,
                    format!("Updated ConfigMap {name:?}"),
                )
                .await;
            }
            None => {
                let config_map = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(namespace.clone()),
                        ..ObjectMeta::default()
                    },
                    data: Some(images),
                    ..ConfigMap::default()
                };
                info!(builders = ?config_map.data, "Creating builders ConfigMap");
                let created = ctx.client.create(&config_map).await?;
                observability::metrics::increment_child_operations("create", KIND);
                ctx.event(
                    &created.object_ref(&()),
                    EventKind::Normal,
                    reasons::CREATED,
                    format!("Created ConfigMap {name:?}"),
                )
                .await;
            }
        }
        Ok(ReconcileResult::done())
    }
}

#[async_trait]
impl Reconciler for BuildersReconciler {
    type Resource = Namespace;

    /// `key` names the Namespace; only the system namespace is handled
    async fn reconcile(&self, ctx: &Context, key: &NamespacedName) -> Result<ReconcileResult, ReconcilerError> {
        if key.name != ctx.config.system_namespace {
            return Ok(ReconcileResult::done());
        }
        let span = tracing::info_span!("controller.reconcile", resource.kind = KIND, resource.namespace = %key.name);
        let started = Instant::now();
        observability::metrics::increment_reconciliations(KIND);
        let result = self.reconcile_builders(ctx).instrument(span).await;
        observability::metrics::observe_reconciliation_duration(KIND, started.elapsed().as_secs_f64());
        result
    }
}
