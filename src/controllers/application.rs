//! # Application Reconciler
//!
//! Builds application source with the `riff-application` builder. Same
//! pipeline as Function, without the invoker environment.

use crate::controller::conditions::ConditionSetError;
use crate::controller::reconciler::ParentReconciler;
use crate::controllers::build::build_reconciler;
use crate::crd::Application;

pub fn reconciler() -> Result<ParentReconciler<Application>, ConditionSetError> {
    build_reconciler::<Application>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tracker::NamespacedName;
    use crate::controllers::test_support::{meta, Harness, NAMESPACE};
    use crate::crd::{ApplicationSpec, GitSource, KpackImage, ResourceStatus, Source};

    #[tokio::test]
    async fn test_application_build_has_no_invoker_env() {
        let h = Harness::new();
        let mut application = Application::new(
            "petclinic",
            ApplicationSpec {
                image: "registry.example.com/petclinic".to_string(),
                source: Some(Source {
                    git: Some(GitSource {
                        url: "https://github.com/spring-projects/spring-petclinic".to_string(),
                        revision: "main".to_string(),
                    }),
                    sub_path: None,
                }),
                ..ApplicationSpec::default()
            },
        );
        application.metadata = meta("petclinic");
        h.seed(&application);

        reconciler()
            .unwrap()
            .reconcile(&h.ctx, &NamespacedName::new(NAMESPACE, "petclinic"))
            .await
            .unwrap();

        let images: Vec<KpackImage> = h.all();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].spec.builder.name, "riff-application");
        assert!(images[0].spec.build.is_none());
        assert!(images[0]
            .metadata
            .name
            .as_deref()
            .unwrap()
            .starts_with("petclinic-application-"));

        let status = h.get::<Application>("petclinic").unwrap().status.unwrap();
        assert_eq!(status.target_image.as_deref(), Some("registry.example.com/petclinic"));
        assert!(!status.is_ready());
    }

    #[tokio::test]
    async fn test_explicit_image_needs_no_config_map() {
        let h = Harness::new();
        let mut application = Application::new(
            "petclinic",
            ApplicationSpec {
                image: "registry.example.com/petclinic".to_string(),
                ..ApplicationSpec::default()
            },
        );
        application.metadata = meta("petclinic");
        h.seed(&application);

        reconciler()
            .unwrap()
            .reconcile(&h.ctx, &NamespacedName::new(NAMESPACE, "petclinic"))
            .await
            .unwrap();

        assert!(h.tracker.is_empty());
        let status = h.get::<Application>("petclinic").unwrap().status.unwrap();
        assert!(status.is_ready());
        assert_eq!(status.latest_image.as_deref(), Some("registry.example.com/petclinic"));
    }
}
