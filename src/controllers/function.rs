//! # Function Reconciler
//!
//! Builds function source into an image with the `riff-function` builder.
//! The build carries the invoker settings (`RIFF_ARTIFACT`, `RIFF_HANDLER`,
//! `RIFF_OVERRIDE`) as environment.

use crate::controller::conditions::ConditionSetError;
use crate::controller::reconciler::ParentReconciler;
use crate::controllers::build::build_reconciler;
use crate::crd::Function;

pub fn reconciler() -> Result<ParentReconciler<Function>, ConditionSetError> {
    build_reconciler::<Function>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::reconciler::ReconcilerError;
    use crate::controller::tracker::{NamespacedName, TrackedKey};
    use crate::controllers::build::BUILD_CACHE_ANNOTATION;
    use crate::controllers::target_image::REASON_DEFAULT_IMAGE_PREFIX_MISSING;
    use crate::controllers::test_support::{meta, Harness, NAMESPACE};
    use crate::crd::{FunctionSpec, GitSource, KpackImage, ResourceStatus, Source};
    use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};

    fn function(source: Option<Source>) -> Function {
        let mut function = Function::new(
            "square",
            FunctionSpec {
                image: "_".to_string(),
                source,
                artifact: "square.js".to_string(),
                handler: "square".to_string(),
                ..FunctionSpec::default()
            },
        );
        function.metadata = meta("square");
        function
    }

    fn git() -> Option<Source> {
        Some(Source {
            git: Some(GitSource {
                url: "https://github.com/projectriff-samples/node-square".to_string(),
                revision: "main".to_string(),
            }),
            sub_path: None,
        })
    }

    fn key() -> NamespacedName {
        NamespacedName::new(NAMESPACE, "square")
    }

    #[tokio::test]
    async fn test_source_creates_build_cache_and_image() {
        let h = Harness::new();
        h.seed_image_prefix("registry.example.com/riff");
        h.seed(&function(git()));

        reconciler().unwrap().reconcile(&h.ctx, &key()).await.unwrap();

        let pvc: PersistentVolumeClaim = h.get("square-build-cache").unwrap();
        assert_eq!(
            pvc.metadata.labels.unwrap().get("build.projectriff.io/function").map(String::as_str),
            Some("square")
        );

        let images: Vec<KpackImage> = h.all();
        assert_eq!(images.len(), 1);
        let image = &images[0];
        assert!(image.metadata.name.as_deref().unwrap().starts_with("square-function-"));
        assert_eq!(image.spec.tag, "registry.example.com/riff/square");
        assert_eq!(image.spec.builder.name, "riff-function");
        assert_eq!(image.spec.service_account, "riff-build");
        assert_eq!(
            image
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(BUILD_CACHE_ANNOTATION))
                .map(String::as_str),
            Some("square-build-cache")
        );
        let env = &image.spec.build.as_ref().unwrap().env;
        assert!(env.iter().any(|e| e.name == "RIFF_ARTIFACT" && e.value.as_deref() == Some("square.js")));

        let status = h.get::<Function>("square").unwrap().status.unwrap();
        assert_eq!(status.target_image.as_deref(), Some("registry.example.com/riff/square"));
        assert!(status.build_cache_ref.is_some());
        assert!(status.kpack_image_ref.is_some());
        assert!(status.get_condition("ImageResolved").unwrap().is_true());
        assert!(status.get_condition("Ready").unwrap().is_unknown());
    }

    #[tokio::test]
    async fn test_no_source_uses_target_as_latest() {
        let h = Harness::new();
        h.seed_image_prefix("registry.example.com/riff");
        h.seed(&function(None));

        reconciler().unwrap().reconcile(&h.ctx, &key()).await.unwrap();

        assert!(h.all::<PersistentVolumeClaim>().is_empty());
        assert!(h.all::<KpackImage>().is_empty());
        let status = h.get::<Function>("square").unwrap().status.unwrap();
        assert_eq!(status.latest_image.as_deref(), Some("registry.example.com/riff/square"));
        assert!(status.is_ready());
        assert_eq!(status.observed_generation(), Some(1));
    }

    #[tokio::test]
    async fn test_missing_prefix_is_recorded_and_tracked() {
        let h = Harness::new();
        h.seed(&function(git()));

        let err = reconciler().unwrap().reconcile(&h.ctx, &key()).await.unwrap_err();
        assert!(matches!(err, ReconcilerError::Invalid { .. }));

        let status = h.get::<Function>("square").unwrap().status.unwrap();
        let resolved = status.get_condition("ImageResolved").unwrap();
        assert!(resolved.is_false());
        assert_eq!(resolved.reason.as_deref(), Some(REASON_DEFAULT_IMAGE_PREFIX_MISSING));
        assert!(status.get_condition("Ready").unwrap().is_false());
        assert!(h.all::<KpackImage>().is_empty());

        let trackers = h
            .tracker
            .lookup(&TrackedKey::new::<ConfigMap>(NAMESPACE, "riff-build"));
        assert_eq!(trackers, vec![key()]);
    }
}
