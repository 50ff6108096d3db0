//! # Credential Reconciler
//!
//! Binds the registry credentials of a namespace to its build
//! ServiceAccount. Secrets labelled [`CREDENTIAL_LABEL_KEY`] are added to
//! the account's secrets and listed in the [`CREDENTIALS_ANNOTATION_KEY`]
//! annotation. A secret that was bound through the annotation and has lost
//! its label is removed again; secrets bound by hand are left alone.
//!
//! The account is created only once the namespace has a credential or a
//! build resource. Reconciliation is keyed by Namespace so the account can
//! be created before it exists.

use crate::controller::events::{reasons, EventKind};
use crate::controller::reconciler::{Context, ReconcileResult, Reconciler, ReconcilerError};
use crate::controller::store::Labels;
use crate::controller::tracker::NamespacedName;
use crate::crd::{Application, Container, Function, CREDENTIALS_ANNOTATION_KEY, CREDENTIAL_LABEL_KEY};
use crate::observability;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ObjectReference, Secret, ServiceAccount};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, info, Instrument};

const KIND: &str = "ServiceAccount";

/// Keeps the build ServiceAccount of one namespace in step with its
/// credential Secrets
#[derive(Debug, Default, Clone, Copy)]
pub struct CredentialReconciler;

impl CredentialReconciler {
    pub async fn reconcile_namespace(&self, ctx: &Context, namespace: &str) -> Result<ReconcileResult, ReconcilerError> {
        let account_name = &ctx.config.build_service_account;
        let credentials = credential_names(ctx, namespace).await?;

        match ctx.client.get_opt::<ServiceAccount>(namespace, account_name).await? {
            Some(account) if account.meta().deletion_timestamp.is_some() => {
                debug!("Build ServiceAccount is being deleted");
            }
            Some(account) => {
                let desired = bind_credentials(&account, &credentials);
                if secrets_of(&desired) != secrets_of(&account) || desired.annotations() != account.annotations() {
                    info!(secrets = ?credentials, "Updating build ServiceAccount");
                    ctx.client.update(&desired).await?;
                    observability::metrics::increment_child_operations("update", KIND);
                    ctx.event(
                        &desired.object_ref(&()),
                        EventKind::Normal,
                        reasons::UPDATED,
                        format!("Bound credentials {}", joined(&credentials)),
                    )
                    .await;
                }
            }
            None if credentials.is_empty() && !has_build_resources(ctx, namespace).await? => {
                debug!("No credentials or build resources, build ServiceAccount not needed");
            }
            None => {
                let account = ServiceAccount {
                    metadata: ObjectMeta {
                        name: Some(account_name.clone()),
                        namespace: Some(namespace.to_string()),
                        annotations: Some(BTreeMap::from([(
                            CREDENTIALS_ANNOTATION_KEY.to_string(),
                            joined(&credentials),
                        )])),
                        ..ObjectMeta::default()
                    },
                    secrets: Some(credentials.iter().map(|name| reference(name)).collect()),
                    ..ServiceAccount::default()
                };
                info!(secrets = ?credentials, "Creating build ServiceAccount");
                let created = ctx.client.create(&account).await?;
                observability::metrics::increment_child_operations("create", KIND);
                ctx.event(
                    &created.object_ref(&()),
                    EventKind::Normal,
                    reasons::CREATED,
                    format!("Created ServiceAccount {account_name:?}"),
                )
                .await;
            }
        }
        Ok(ReconcileResult::done())
    }
}

#[async_trait]
impl Reconciler for CredentialReconciler {
    type Resource = Namespace;

    /// `key` names the Namespace
    async fn reconcile(&self, ctx: &Context, key: &NamespacedName) -> Result<ReconcileResult, ReconcilerError> {
        let span = tracing::info_span!("controller.reconcile", resource.kind = KIND, resource.namespace = %key.name);
        let started = Instant::now();
        observability::metrics::increment_reconciliations(KIND);
        let result = self.reconcile_namespace(ctx, &key.name).instrument(span).await;
        observability::metrics::observe_reconciliation_duration(KIND, started.elapsed().as_secs_f64());
        result
    }
}

/// Names of the credential Secrets in `namespace`
async fn credential_names(ctx: &Context, namespace: &str) -> Result<BTreeSet<String>, ReconcilerError> {
    Ok(ctx
        .client
        .list::<Secret>(namespace, &Labels::new())
        .await?
        .iter()
        .filter(|secret| secret.labels().contains_key(CREDENTIAL_LABEL_KEY))
        .map(ResourceExt::name_any)
        .collect())
}

async fn has_build_resources(ctx: &Context, namespace: &str) -> Result<bool, ReconcilerError> {
    let none = Labels::new();
    Ok(!ctx.client.list::<Application>(namespace, &none).await?.is_empty()
        || !ctx.client.list::<Function>(namespace, &none).await?.is_empty()
        || !ctx.client.list::<Container>(namespace, &none).await?.is_empty())
}

/// The account with `credentials` bound and the annotation rewritten
///
/// Secrets listed by the previous annotation and no longer credentials are
/// dropped. Other entries keep their order; new credentials are appended
/// sorted.
fn bind_credentials(account: &ServiceAccount, credentials: &BTreeSet<String>) -> ServiceAccount {
    let previously_bound: BTreeSet<&str> = account
        .annotations()
        .get(CREDENTIALS_ANNOTATION_KEY)
        .map(|bound| bound.split(',').filter(|name| !name.is_empty()).collect())
        .unwrap_or_default();

    let mut secrets: Vec<ObjectReference> = account
        .secrets
        .iter()
        .flatten()
        .filter(|secret| {
            let name = secret.name.as_deref().unwrap_or_default();
            !previously_bound.contains(name) || credentials.contains(name)
        })
        .cloned()
        .collect();
    let present: BTreeSet<String> = secrets.iter().filter_map(|s| s.name.clone()).collect();
    secrets.extend(credentials.difference(&present).map(|name| reference(name)));

    let mut desired = account.clone();
    desired.secrets = Some(secrets);
    desired
        .annotations_mut()
        .insert(CREDENTIALS_ANNOTATION_KEY.to_string(), joined(credentials));
    desired
}

fn secrets_of(account: &ServiceAccount) -> &[ObjectReference] {
    account.secrets.as_deref().unwrap_or_default()
}

fn reference(name: &str) -> ObjectReference {
    ObjectReference {
        name: Some(name.to_string()),
        ..ObjectReference::default()
    }
}

fn joined(names: &BTreeSet<String>) -> String {
    names.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::store::Verb;
    use crate::controllers::test_support::{meta, Harness, NAMESPACE};
    use crate::crd::{ContainerSpec, FunctionSpec};

    fn credential(name: &str) -> Secret {
        let mut metadata = meta(name);
        metadata.labels = Some(BTreeMap::from([(CREDENTIAL_LABEL_KEY.to_string(), "docker-hub".to_string())]));
        Secret {
            metadata,
            ..Secret::default()
        }
    }

    fn account(secrets: &[&str], bound: Option<&str>) -> ServiceAccount {
        let mut metadata = meta("riff-build");
        if let Some(bound) = bound {
            metadata.annotations = Some(BTreeMap::from([(CREDENTIALS_ANNOTATION_KEY.to_string(), bound.to_string())]));
        }
        ServiceAccount {
            metadata,
            secrets: Some(secrets.iter().map(|name| reference(name)).collect()),
            ..ServiceAccount::default()
        }
    }

    fn secret_names(account: &ServiceAccount) -> Vec<String> {
        account.secrets.iter().flatten().filter_map(|s| s.name.clone()).collect()
    }

    async fn reconcile(h: &Harness) -> Result<ReconcileResult, ReconcilerError> {
        Reconciler::reconcile(&CredentialReconciler, &h.ctx, &NamespacedName::new("", NAMESPACE)).await
    }

    #[tokio::test]
    async fn test_account_is_created_with_credentials() {
        let h = Harness::new();
        h.seed(&credential("gcr"));
        h.seed(&credential("docker-hub"));
        h.seed(&Secret {
            metadata: meta("unrelated"),
            ..Secret::default()
        });

        reconcile(&h).await.unwrap();

        let account = h.get::<ServiceAccount>("riff-build").unwrap();
        assert_eq!(secret_names(&account), vec!["docker-hub", "gcr"]);
        assert_eq!(
            account.annotations().get(CREDENTIALS_ANNOTATION_KEY).map(String::as_str),
            Some("docker-hub,gcr")
        );
        assert_eq!(h.recorder.reasons(), vec![(EventKind::Normal, reasons::CREATED.to_string())]);
    }

    #[tokio::test]
    async fn test_account_is_created_for_build_resources() {
        let h = Harness::new();
        let mut function = Function::new("square", FunctionSpec::default());
        function.metadata = meta("square");
        h.seed(&function);

        reconcile(&h).await.unwrap();

        let account = h.get::<ServiceAccount>("riff-build").unwrap();
        assert!(secret_names(&account).is_empty());
        assert_eq!(
            account.annotations().get(CREDENTIALS_ANNOTATION_KEY).map(String::as_str),
            Some("")
        );
    }

    #[tokio::test]
    async fn test_empty_namespace_gets_no_account() {
        let h = Harness::new();
        let mut elsewhere = Container::new("base", ContainerSpec::default());
        elsewhere.metadata = meta("base");
        elsewhere.metadata.namespace = Some("other".to_string());
        h.seed(&elsewhere);

        reconcile(&h).await.unwrap();

        assert!(h.get::<ServiceAccount>("riff-build").is_none());
        assert!(h.store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_stale_credentials_are_unbound_and_manual_secrets_kept() {
        let h = Harness::new();
        h.seed(&credential("gcr"));
        h.seed(&credential("quay"));
        h.seed(&account(&["riff-build-token-x7k2p", "docker-hub", "gcr"], Some("docker-hub,gcr")));

        reconcile(&h).await.unwrap();

        let account = h.get::<ServiceAccount>("riff-build").unwrap();
        assert_eq!(secret_names(&account), vec!["riff-build-token-x7k2p", "gcr", "quay"]);
        assert_eq!(
            account.annotations().get(CREDENTIALS_ANNOTATION_KEY).map(String::as_str),
            Some("gcr,quay")
        );
        assert_eq!(h.recorder.reasons(), vec![(EventKind::Normal, reasons::UPDATED.to_string())]);
    }

    #[tokio::test]
    async fn test_bound_account_is_not_rewritten() {
        let h = Harness::new();
        h.seed(&credential("gcr"));
        h.seed(&account(&["riff-build-token-x7k2p", "gcr"], Some("gcr")));
        h.store.clear_actions();

        reconcile(&h).await.unwrap();

        assert!(h.store.writes().iter().all(|a| a.verb != Verb::Update));
        assert!(h.recorder.reasons().is_empty());
    }

    #[tokio::test]
    async fn test_account_without_secrets_field_is_not_rewritten() {
        let h = Harness::new();
        let mut bare = account(&[], Some(""));
        bare.secrets = None;
        h.seed(&bare);
        h.store.clear_actions();

        reconcile(&h).await.unwrap();

        assert!(h.store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_deleting_account_is_left_alone() {
        let h = Harness::new();
        h.seed(&credential("gcr"));
        let mut deleting = account(&[], None);
        deleting.metadata.deletion_timestamp = Some(serde_json::from_value(serde_json::json!("2026-10-01T00:00:00Z")).unwrap());
        deleting.metadata.finalizers = Some(vec!["example.com/hold".to_string()]);
        h.seed(&deleting);
        h.store.clear_actions();

        reconcile(&h).await.unwrap();

        assert!(h.store.writes().is_empty());
        assert!(secret_names(&h.get::<ServiceAccount>("riff-build").unwrap()).is_empty());
    }
}
