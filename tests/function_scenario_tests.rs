//! # Function Build Scenario
//!
//! Drives a Function from creation to Ready, playing the volume binder and
//! kpack by editing child status between reconciliations.

mod common;

use common::{meta, Cluster, IMAGE_PREFIX, NAMESPACE};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, PersistentVolumeClaimStatus};
use riff_system::controller::store::Verb;
use riff_system::controller::tracker::{NamespacedName, TrackedKey};
use riff_system::controllers::function;
use riff_system::crd::{
    Condition, ConditionStatus, Function, FunctionSpec, GitSource, KpackImage, KpackImageStatus, ResourceStatus,
    Source, Status,
};
use std::time::Duration;

fn square() -> Function {
    let mut function = Function::new(
        "square",
        FunctionSpec {
            image: "_".to_string(),
            source: Some(Source {
                git: Some(GitSource {
                    url: "https://github.com/projectriff-samples/node-square".to_string(),
                    revision: "main".to_string(),
                }),
                sub_path: None,
            }),
            artifact: "square.js".to_string(),
            ..FunctionSpec::default()
        },
    );
    function.metadata = meta("square");
    function
}

fn key() -> NamespacedName {
    NamespacedName::new(NAMESPACE, "square")
}

fn bind(cluster: &Cluster) {
    let pvc = cluster.only::<PersistentVolumeClaim>();
    cluster.edit(pvc, |pvc| {
        pvc.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            ..PersistentVolumeClaimStatus::default()
        });
    });
}

fn finish_build(cluster: &Cluster, digest: &str, ready: ConditionStatus) {
    let image = cluster.only::<KpackImage>();
    cluster.edit(image, |image| {
        image.status = Some(KpackImageStatus {
            common: Status {
                observed_generation: image.metadata.generation,
                conditions: vec![Condition::new("Ready", ready)],
            },
            latest_image: format!("{IMAGE_PREFIX}/square@sha256:{digest}"),
            ..KpackImageStatus::default()
        });
    });
}

#[tokio::test]
async fn test_function_becomes_ready_once_cache_bound_and_build_succeeds() {
    let cluster = Cluster::new();
    cluster.seed_image_prefix();
    cluster.seed(&square());
    let reconciler = function::reconciler().unwrap();

    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();
    let status = cluster.get::<Function>("square").unwrap().status.unwrap();
    assert_eq!(status.target_image.as_deref(), Some("registry.example.com/riff/square"));
    assert!(status.get_condition("BuildCacheReady").unwrap().is_unknown());
    assert!(status.get_condition("BuildSucceeded").unwrap().is_unknown());
    assert!(status.get_condition("Ready").unwrap().is_unknown());

    bind(&cluster);
    finish_build(&cluster, "abc123", ConditionStatus::True);
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();

    let status = cluster.get::<Function>("square").unwrap().status.unwrap();
    assert!(status.get_condition("BuildCacheReady").unwrap().is_true());
    assert!(status.get_condition("BuildSucceeded").unwrap().is_true());
    assert!(status.is_ready());
    assert_eq!(
        status.latest_image.as_deref(),
        Some("registry.example.com/riff/square@sha256:abc123")
    );
    assert_eq!(status.observed_generation(), Some(1));
}

#[tokio::test]
async fn test_failed_build_fails_ready_and_keeps_previous_latest_image() {
    let cluster = Cluster::new();
    cluster.seed_image_prefix();
    cluster.seed(&square());
    let reconciler = function::reconciler().unwrap();

    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();
    bind(&cluster);
    finish_build(&cluster, "abc123", ConditionStatus::True);
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();

    let image = cluster.only::<KpackImage>();
    cluster.edit(image, |image| {
        let status = image.status.get_or_insert_with(KpackImageStatus::default);
        status.common.conditions = vec![
            Condition::new("Ready", ConditionStatus::False).with_reason("BuildFailed", "step detect failed")
        ];
    });
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();

    let status = cluster.get::<Function>("square").unwrap().status.unwrap();
    let ready = status.get_condition("Ready").unwrap();
    assert!(ready.is_false());
    assert_eq!(ready.reason.as_deref(), Some("BuildFailed"));
    assert_eq!(
        status.latest_image.as_deref(),
        Some("registry.example.com/riff/square@sha256:abc123")
    );
}

#[tokio::test]
async fn test_steady_state_reconcile_writes_nothing() {
    let cluster = Cluster::new();
    cluster.seed_image_prefix();
    cluster.seed(&square());
    let reconciler = function::reconciler().unwrap();

    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();
    bind(&cluster);
    finish_build(&cluster, "abc123", ConditionStatus::True);
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();

    cluster.store.clear_actions();
    let before = cluster.get::<Function>("square").unwrap();
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();

    assert!(cluster.store.writes().is_empty(), "unexpected writes: {:?}", cluster.store.writes());
    let after = cluster.get::<Function>("square").unwrap();
    assert_eq!(before.status, after.status);
    assert_eq!(cluster.all::<KpackImage>().len(), 1);
    assert_eq!(cluster.all::<PersistentVolumeClaim>().len(), 1);
}

#[tokio::test]
async fn test_spec_change_updates_kpack_image_in_place() {
    let cluster = Cluster::new();
    cluster.seed_image_prefix();
    cluster.seed(&square());
    let reconciler = function::reconciler().unwrap();
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();
    let created = cluster.only::<KpackImage>();

    let function = cluster.get::<Function>("square").unwrap();
    cluster.edit(function, |f| {
        f.spec.image = "registry.example.com/other/square".to_string();
        f.metadata.generation = Some(2);
    });
    cluster.store.clear_actions();
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();

    let updated = cluster.only::<KpackImage>();
    assert_eq!(updated.metadata.name, created.metadata.name);
    assert_eq!(updated.spec.tag, "registry.example.com/other/square");
    assert!(cluster
        .store
        .writes()
        .iter()
        .any(|a| a.matches(Verb::Update, "Image")));
    assert!(!cluster
        .store
        .writes()
        .iter()
        .any(|a| a.matches(Verb::Create, "Image")));
}

#[tokio::test]
async fn test_config_map_change_is_picked_up_by_tracked_function() {
    let cluster = Cluster::new();
    cluster.seed(&square());
    let reconciler = function::reconciler().unwrap();

    assert!(reconciler.reconcile(&cluster.ctx, &key()).await.is_err());
    let config_map = TrackedKey::new::<ConfigMap>(NAMESPACE, "riff-build");
    assert_eq!(cluster.tracker.lookup(&config_map), vec![key()]);

    // The watch would map the new ConfigMap back to the Function
    cluster.seed_image_prefix();
    for tracker in cluster.tracker.lookup(&config_map) {
        reconciler.reconcile(&cluster.ctx, &tracker).await.unwrap();
    }

    let status = cluster.get::<Function>("square").unwrap().status.unwrap();
    assert!(status.get_condition("ImageResolved").unwrap().is_true());
    assert_eq!(cluster.all::<KpackImage>().len(), 1);
}

#[tokio::test]
async fn test_edited_image_prefix_re_resolves_target_and_build_tag() {
    let cluster = Cluster::new();
    cluster.seed_image_prefix();
    cluster.seed(&square());
    let reconciler = function::reconciler().unwrap();
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();
    assert_eq!(cluster.only::<KpackImage>().spec.tag, "registry.example.com/riff/square");

    let config_map = cluster.get::<ConfigMap>("riff-build").unwrap();
    cluster.edit(config_map, |cm| {
        cm.data = Some([("default-image-prefix".to_string(), "other.example.com/x".to_string())].into());
    });
    let trackers = cluster
        .tracker
        .lookup(&TrackedKey::new::<ConfigMap>(NAMESPACE, "riff-build"));
    assert_eq!(trackers, vec![key()]);
    for tracker in &trackers {
        reconciler.reconcile(&cluster.ctx, tracker).await.unwrap();
    }

    let status = cluster.get::<Function>("square").unwrap().status.unwrap();
    assert_eq!(status.target_image.as_deref(), Some("other.example.com/x/square"));
    assert_eq!(cluster.only::<KpackImage>().spec.tag, "other.example.com/x/square");
}

#[tokio::test]
async fn test_tracking_lapses_when_lease_is_not_renewed() {
    let cluster = Cluster::new();
    cluster.seed(&square());
    let reconciler = function::reconciler().unwrap();
    assert!(reconciler.reconcile(&cluster.ctx, &key()).await.is_err());

    let config_map = TrackedKey::new::<ConfigMap>(NAMESPACE, "riff-build");
    let lease = cluster.ctx.config.dependency_lease();
    cluster.clock.advance(lease - Duration::from_secs(1));
    assert_eq!(cluster.tracker.lookup(&config_map), vec![key()]);

    // Reconciling again renews the lease
    assert!(reconciler.reconcile(&cluster.ctx, &key()).await.is_err());
    cluster.clock.advance(Duration::from_secs(2));
    assert_eq!(cluster.tracker.lookup(&config_map), vec![key()]);

    cluster.clock.advance(lease);
    assert!(cluster.tracker.lookup(&config_map).is_empty());
    assert_eq!(cluster.tracker.sweep(), 0);
}
