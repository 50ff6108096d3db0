//! # Container Reconciler
//!
//! Tracks a pre-built image. The target image is resolved to the digest it
//! currently points at, authenticating with the registry credentials bound
//! to the namespace's build ServiceAccount, and the pinned `repo@digest`
//! becomes the latest image. The resource is revisited on a fixed polling
//! interval so a tag moved in the registry is picked up without a watch
//! event.

use crate::controller::conditions::{ConditionSet, ConditionSetError};
use crate::controller::reconciler::{
    Context, Parent, ParentReconciler, ReconcileResult, ReconcilerError, SubReconciler,
};
use crate::controller::tracker::TrackedKey;
use crate::controllers::target_image::{TargetImageReconciler, REASON_IMAGE_INVALID};
use crate::crd::{Container, ImageStatus, CONDITION_IMAGE_RESOLVED};
use crate::registry::{ImageReference, Keychain};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub fn conditions() -> Result<ConditionSet, ConditionSetError> {
    ConditionSet::living([CONDITION_IMAGE_RESOLVED])
}

pub fn reconciler() -> Result<ParentReconciler<Container>, ConditionSetError> {
    let subs: Vec<Box<dyn SubReconciler<Container>>> =
        vec![Box::new(TargetImageReconciler), Box::new(LatestImageReconciler)];
    Ok(ParentReconciler::new(Arc::new(conditions()?), subs))
}

/// Pins the target image to its current digest and schedules the next poll
#[derive(Debug, Default, Clone, Copy)]
pub struct LatestImageReconciler;

impl LatestImageReconciler {
    /// Credentials from the Secrets bound to the build ServiceAccount
    ///
    /// The ServiceAccount and each Secret it names are tracked. Secrets that
    /// do not exist are skipped; a missing ServiceAccount is an error.
    async fn keychain(&self, ctx: &Context, parent: &Parent<'_, Container>) -> Result<Keychain, ReconcilerError> {
        let namespace = parent.namespace();
        let account_name = &ctx.config.build_service_account;
        ctx.track(&TrackedKey::new::<ServiceAccount>(namespace, account_name), &parent.key());
        let Some(account) = ctx.client.get_opt::<ServiceAccount>(namespace, account_name).await? else {
            return Err(ReconcilerError::invalid(
                REASON_IMAGE_INVALID,
                format!("ServiceAccount {account_name:?} not found"),
            ));
        };

        let mut secrets = Vec::new();
        for reference in account.secrets.iter().flatten() {
            let Some(name) = reference.name.as_deref().filter(|n| !n.is_empty()) else {
                continue;
            };
            ctx.track(&TrackedKey::new::<Secret>(namespace, name), &parent.key());
            match ctx.client.get_opt::<Secret>(namespace, name).await? {
                Some(secret) => secrets.push(secret),
                None => debug!(secret = %name, "Secret bound to the build ServiceAccount not found"),
            }
        }
        Ok(Keychain::from_secrets(&secrets))
    }

    async fn resolve_digest(
        &self,
        ctx: &Context,
        parent: &Parent<'_, Container>,
        target: &str,
    ) -> Result<String, ReconcilerError> {
        let invalid = |message: String| ReconcilerError::invalid(REASON_IMAGE_INVALID, message);
        let image = ImageReference::parse(target).map_err(|e| invalid(e.to_string()))?;
        let keychain = self.keychain(ctx, parent).await?;
        let credential = keychain.resolve(&image.registry).map_err(|e| invalid(e.to_string()))?;
        let digest = ctx
            .registry()?
            .resolve(&image, &credential)
            .await
            .map_err(|e| invalid(e.to_string()))?;
        Ok(image.with_digest(&digest))
    }
}

#[async_trait]
impl SubReconciler<Container> for LatestImageReconciler {
    fn name(&self) -> &'static str {
        "LatestImage"
    }

    async fn reconcile(
        &self,
        ctx: &Context,
        parent: &mut Parent<'_, Container>,
    ) -> Result<ReconcileResult, ReconcilerError> {
        let Some(target) = parent.status().target_image().map(ToString::to_string) else {
            return Ok(ReconcileResult::done());
        };
        match self.resolve_digest(ctx, parent, &target).await {
            Ok(latest) => {
                if parent.status().latest_image() != Some(latest.as_str()) {
                    info!(image = %latest, "Resolved latest image");
                }
                parent.status_mut().set_latest_image(Some(latest));
                parent.conditions().mark_true(CONDITION_IMAGE_RESOLVED);
                Ok(ReconcileResult::requeue_after(ctx.config.container_polling_interval()))
            }
            Err(ReconcilerError::Invalid { reason, message }) => {
                warn!(image = %target, message = %message, "Unable to resolve image digest");
                parent
                    .conditions()
                    .mark_false(CONDITION_IMAGE_RESOLVED, &reason, &message);
                Err(ReconcilerError::Invalid { reason, message })
            }
            Err(e) => Err(e),
        }
    }
}
