//! # Parent Reconciler
//!
//! Entry point bound to the work queue for one resource kind. Each call:
//!
//! 1. fetches the resource; not-found ends the call quietly
//! 2. skips resources that are being deleted
//! 3. applies defaults in memory and initializes every declared condition
//! 4. runs the sub-reconcilers in order, stopping at the first error
//! 5. records the observed generation when the chain succeeded
//! 6. writes status only when it differs from what was fetched
//!
//! Conditions set before a failure are still persisted, so a resource never
//! hides an error state from its status.

use crate::controller::conditions::{ConditionManager, ConditionSet};
use crate::controller::events::{reasons, EventKind};
use crate::controller::reconciler::types::{Context, ReconcileResult, ReconcilerError};
use crate::controller::store::merge_patch_diff;
use crate::controller::tracker::NamespacedName;
use crate::crd::{Reconcilable, ResourceStatus};
use crate::observability;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Resource;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// One focused step of a reconciliation
///
/// A sub-reconciler reads the parent's spec, writes only the parent's
/// status, and may manage children, track dependencies and use the stash.
/// Returning `Ok` with a requeue delay means "check again later" and is not
/// a failure.
#[async_trait]
pub trait SubReconciler<T: Reconcilable>: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn reconcile(
        &self,
        ctx: &Context,
        parent: &mut Parent<'_, T>,
    ) -> Result<ReconcileResult, ReconcilerError>;
}

/// The resource under reconciliation as seen by sub-reconcilers
///
/// Spec and metadata are read-only. Status is the working copy that will
/// be compared against the fetched one.
#[derive(Debug)]
pub struct Parent<'a, T: Reconcilable> {
    resource: &'a T,
    status: &'a mut T::Status,
    conditions: &'a ConditionSet,
}

impl<'a, T: Reconcilable> Parent<'a, T> {
    pub fn new(resource: &'a T, status: &'a mut T::Status, conditions: &'a ConditionSet) -> Self {
        Self {
            resource,
            status,
            conditions,
        }
    }

    /// The defaulted resource; its own `status` field is the fetched copy
    #[must_use]
    pub fn resource(&self) -> &T {
        self.resource
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.resource.meta().name.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        self.resource.meta().namespace.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn key(&self) -> NamespacedName {
        NamespacedName::new(self.namespace(), self.name())
    }

    #[must_use]
    pub fn kind(&self) -> String {
        T::kind(&()).into_owned()
    }

    #[must_use]
    pub fn object_ref(&self) -> ObjectReference {
        self.resource.object_ref(&())
    }

    #[must_use]
    pub fn status(&self) -> &T::Status {
        self.status
    }

    pub fn status_mut(&mut self) -> &mut T::Status {
        self.status
    }

    /// Condition manager over the working status
    pub fn conditions(&mut self) -> ConditionManager<'_> {
        self.conditions.manage(self.status.common_mut())
    }
}

/// Drives one resource kind through its sub-reconciler chain
pub struct ParentReconciler<T: Reconcilable> {
    conditions: Arc<ConditionSet>,
    subs: Vec<Box<dyn SubReconciler<T>>>,
}

impl<T: Reconcilable> std::fmt::Debug for ParentReconciler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subs: Vec<&str> = self.subs.iter().map(|s| s.name()).collect();
        f.debug_struct("ParentReconciler")
            .field("kind", &T::kind(&()))
            .field("conditions", &self.conditions)
            .field("subs", &subs)
            .finish()
    }
}

impl<T: Reconcilable> ParentReconciler<T> {
    pub fn new(conditions: Arc<ConditionSet>, subs: Vec<Box<dyn SubReconciler<T>>>) -> Self {
        Self { conditions, subs }
    }

    #[must_use]
    pub fn conditions(&self) -> &ConditionSet {
        &self.conditions
    }

    /// Reconcile the resource named by `key`
    pub async fn reconcile(
        &self,
        ctx: &Context,
        key: &NamespacedName,
    ) -> Result<ReconcileResult, ReconcilerError> {
        let kind = T::kind(&());
        let span = tracing::info_span!(
            "controller.reconcile",
            resource.kind = %kind,
            resource.namespace = %key.namespace,
            resource.name = %key.name,
        );
        let started = Instant::now();
        observability::metrics::increment_reconciliations(&kind);
        let result = self.reconcile_inner(ctx, key).instrument(span).await;
        observability::metrics::observe_reconciliation_duration(&kind, started.elapsed().as_secs_f64());
        result
    }

    async fn reconcile_inner(
        &self,
        ctx: &Context,
        key: &NamespacedName,
    ) -> Result<ReconcileResult, ReconcilerError> {
        let ctx = ctx.with_stash();

        let Some(original) = ctx.client.get_opt::<T>(&key.namespace, &key.name).await? else {
            debug!("Resource not found, nothing to do");
            return Ok(ReconcileResult::done());
        };
        if original.meta().deletion_timestamp.is_some() {
            debug!("Resource is being deleted, skipping");
            return Ok(ReconcileResult::done());
        }

        let original_status = original.status().cloned().unwrap_or_default();
        let mut resource = original.clone();
        resource.apply_defaults();

        let mut status = original_status.clone();
        self.conditions.manage(status.common_mut()).initialize_conditions();

        let outcome = self.run_chain(&ctx, &resource, &mut status).await;
        if outcome.is_ok() {
            status.common_mut().observed_generation = original.meta().generation;
        }

        if status == original_status {
            debug!("Status unchanged, skipping update");
        } else if let Some(result) = self.write_status(&ctx, &original, &original_status, status).await? {
            return Ok(result);
        }

        match outcome {
            Ok(result) => Ok(result),
            Err(e) if e.is_conflict() => {
                debug!(error = %e, "Conflict during reconciliation, requeueing");
                observability::metrics::increment_requeues("conflict");
                Ok(ReconcileResult::requeue())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_chain(
        &self,
        ctx: &Context,
        resource: &T,
        status: &mut T::Status,
    ) -> Result<ReconcileResult, ReconcilerError> {
        let mut parent = Parent::new(resource, status, &self.conditions);
        let mut result = ReconcileResult::done();
        for sub in &self.subs {
            match sub.reconcile(ctx, &mut parent).await {
                Ok(r) => result = result.merge(r),
                Err(e) => {
                    warn!(sub_reconciler = sub.name(), error = %e, "Sub-reconciler failed, stopping chain");
                    return Err(e);
                }
            }
        }
        Ok(result)
    }

    /// Persist a changed status
    ///
    /// Returns `Some` when the call should end here: the write conflicted
    /// and needs an immediate requeue, or the resource is gone.
    async fn write_status(
        &self,
        ctx: &Context,
        original: &T,
        original_status: &T::Status,
        status: T::Status,
    ) -> Result<Option<ReconcileResult>, ReconcilerError> {
        let kind = T::kind(&());
        let object_ref = original.object_ref(&());
        let diff = match (serde_json::to_value(original_status), serde_json::to_value(&status)) {
            (Ok(before), Ok(after)) => merge_patch_diff(&before, &after).to_string(),
            _ => String::new(),
        };
        info!(diff = %diff, "Updating status");

        let mut updated = original.clone();
        *updated.status_mut() = status;
        match ctx.client.update_status(&updated).await {
            Ok(Some(_)) => {
                observability::metrics::increment_status_updates(&kind);
                ctx.event(&object_ref, EventKind::Normal, reasons::STATUS_UPDATED, "Updated status".to_string())
                    .await;
                Ok(None)
            }
            Ok(None) => {
                debug!("Status already current on server");
                Ok(None)
            }
            Err(e) if e.is_not_found() => {
                debug!(error = %e, "Resource deleted before status was written");
                Ok(Some(ReconcileResult::done()))
            }
            Err(e) => {
                ctx.event(
                    &object_ref,
                    EventKind::Warning,
                    reasons::STATUS_UPDATE_FAILED,
                    format!("Failed to update status: {e}"),
                )
                .await;
                if e.is_conflict() {
                    observability::metrics::increment_status_update_conflicts(&kind);
                    observability::metrics::increment_requeues("conflict");
                    debug!(error = %e, "Status update conflicted, requeueing");
                    Ok(Some(ReconcileResult::requeue()))
                } else {
                    warn!(error = %e, "Unable to update status");
                    Err(e.into())
                }
            }
        }
    }
}

/// A reconciler the runtime drives for objects of one watched kind
///
/// The runtime hands over the key of the object that triggered the call;
/// the reconciler fetches whatever it needs itself.
#[async_trait]
pub trait Reconciler: Send + Sync + std::fmt::Debug + 'static {
    /// Kind whose objects trigger reconciliation
    type Resource: kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug + DeserializeOwned + Send + Sync + 'static;

    async fn reconcile(&self, ctx: &Context, key: &NamespacedName) -> Result<ReconcileResult, ReconcilerError>;
}

#[async_trait]
impl<T: Reconcilable> Reconciler for ParentReconciler<T> {
    type Resource = T;

    async fn reconcile(&self, ctx: &Context, key: &NamespacedName) -> Result<ReconcileResult, ReconcilerError> {
        ParentReconciler::reconcile(self, ctx, key).await
    }
}
