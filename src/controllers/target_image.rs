//! # Target Image
//!
//! Resolves the image repository a resource builds into or runs from.
//!
//! An image starting with `_` borrows the `default-image-prefix` of the
//! namespace's build ConfigMap:
//!
//! - `_` becomes `<prefix>/<resource name>`
//! - `_suffix` becomes `<prefix>suffix`
//!
//! The ConfigMap is tracked, so editing the prefix re-resolves every
//! resource that used it.

use crate::constants::DEFAULT_IMAGE_PREFIX_KEY;
use crate::controller::reconciler::{Context, Parent, ReconcileResult, ReconcilerError, SubReconciler};
use crate::controller::stash::TARGET_IMAGE;
use crate::controller::tracker::TrackedKey;
use crate::crd::{ImageResource, ImageStatus, CONDITION_IMAGE_RESOLVED};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, warn};

pub const REASON_DEFAULT_IMAGE_PREFIX_MISSING: &str = "DefaultImagePrefixMissing";
pub const REASON_IMAGE_INVALID: &str = "ImageInvalid";

/// `[registry[:port]/]path[:tag][@digest]`, lowercase repository path
static IMAGE_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*(?::[0-9]+)?/)?",
        r"[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*",
        r"(?::[\w][\w.-]{0,127})?",
        r"(?:@[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,})?$",
    ))
    .expect("valid image reference regex (verified by tests)")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetImageError {
    #[error("missing default image prefix")]
    DefaultPrefixMissing,

    #[error("could not parse reference: {0}")]
    Invalid(String),
}

impl TargetImageError {
    fn reason(&self) -> &'static str {
        match self {
            Self::DefaultPrefixMissing => REASON_DEFAULT_IMAGE_PREFIX_MISSING,
            Self::Invalid(_) => REASON_IMAGE_INVALID,
        }
    }
}

/// Expand a `_`-prefixed image against `prefix`; other images pass through
pub fn resolve_default_image(image: &str, name: &str, prefix: &str) -> Result<String, TargetImageError> {
    let Some(rest) = image.strip_prefix('_') else {
        return Ok(image.to_string());
    };
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return Err(TargetImageError::DefaultPrefixMissing);
    }
    if rest.is_empty() {
        Ok(format!("{prefix}/{name}"))
    } else {
        Ok(format!("{prefix}{rest}"))
    }
}

/// Check that `image` is a well-formed image reference
pub fn validate_image(image: &str) -> Result<(), TargetImageError> {
    if image.len() <= 255 && IMAGE_REFERENCE.is_match(image) {
        Ok(())
    } else {
        Err(TargetImageError::Invalid(image.to_string()))
    }
}

/// Sets `status.targetImage` and the ImageResolved condition, and stashes
/// the image for later sub-reconcilers
#[derive(Debug, Default, Clone, Copy)]
pub struct TargetImageReconciler;

impl TargetImageReconciler {
    async fn resolve<T>(&self, ctx: &Context, parent: &Parent<'_, T>) -> Result<String, ReconcilerError>
    where
        T: ImageResource,
        T::Status: ImageStatus,
    {
        let image = parent.resource().image();
        let image = if image.starts_with('_') {
            let prefix = self.default_prefix(ctx, parent).await?;
            match resolve_default_image(image, parent.name(), prefix.as_deref().unwrap_or_default()) {
                Ok(image) => image,
                Err(e) => return Err(ReconcilerError::invalid(e.reason(), e.to_string())),
            }
        } else {
            image.to_string()
        };
        validate_image(&image).map_err(|e| ReconcilerError::invalid(e.reason(), e.to_string()))?;
        Ok(image)
    }

    /// Read the namespace's default image prefix, tracking the ConfigMap
    /// that holds it
    async fn default_prefix<T: ImageResource>(
        &self,
        ctx: &Context,
        parent: &Parent<'_, T>,
    ) -> Result<Option<String>, ReconcilerError> {
        let config_map_name = &ctx.config.build_config_map_name;
        ctx.track(
            &TrackedKey::new::<ConfigMap>(parent.namespace(), config_map_name),
            &parent.key(),
        );
        let config_map = ctx
            .client
            .get_opt::<ConfigMap>(parent.namespace(), config_map_name)
            .await?;
        Ok(config_map
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(DEFAULT_IMAGE_PREFIX_KEY))
            .filter(|prefix| !prefix.is_empty()))
    }
}

#[async_trait]
impl<T> SubReconciler<T> for TargetImageReconciler
where
    T: ImageResource,
    T::Status: ImageStatus,
{
    fn name(&self) -> &'static str {
        "TargetImage"
    }

    async fn reconcile(
        &self,
        ctx: &Context,
        parent: &mut Parent<'_, T>,
    ) -> Result<ReconcileResult, ReconcilerError> {
        match self.resolve(ctx, parent).await {
            Ok(image) => {
                debug!(image = %image, "Resolved target image");
                ctx.stash_value(&TARGET_IMAGE, image.clone())?;
                parent.status_mut().set_target_image(Some(image));
                parent.conditions().mark_true(CONDITION_IMAGE_RESOLVED);
                Ok(ReconcileResult::done())
            }
            Err(ReconcilerError::Invalid { reason, message }) => {
                warn!(reason = %reason, message = %message, "Unable to resolve target image");
                parent
                    .conditions()
                    .mark_false(CONDITION_IMAGE_RESOLVED, &reason, &message);
                Err(ReconcilerError::Invalid { reason, message })
            }
            Err(e) => Err(e),
        }
    }
}
