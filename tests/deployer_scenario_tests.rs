//! # Deployer Scenario
//!
//! A Deployer running the latest image of a Function, through rollout,
//! image updates and edits made by other actors.

mod common;

use common::{meta, Cluster, NAMESPACE};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use k8s_openapi::api::core::v1::Service;
use riff_system::controller::store::Verb;
use riff_system::controller::tracker::{NamespacedName, TrackedKey};
use riff_system::controllers::{deployer, function};
use riff_system::crd::{
    BuildStatus, Deployer, DeployerBuild, DeployerSpec, Function, FunctionSpec, ResourceStatus,
};

fn square_function() -> Function {
    let mut function = Function::new(
        "square",
        FunctionSpec {
            image: "_".to_string(),
            ..FunctionSpec::default()
        },
    );
    function.metadata = meta("square");
    function
}

fn square_deployer() -> Deployer {
    let mut deployer = Deployer::new(
        "square",
        DeployerSpec {
            build: Some(DeployerBuild {
                function_ref: Some("square".to_string()),
                ..DeployerBuild::default()
            }),
            ..DeployerSpec::default()
        },
    );
    deployer.metadata = meta("square");
    deployer
}

fn key() -> NamespacedName {
    NamespacedName::new(NAMESPACE, "square")
}

fn container_image(deployment: &Deployment) -> Option<String> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .clone()
}

fn roll_out(cluster: &Cluster) {
    let deployment = cluster.only::<Deployment>();
    cluster.edit(deployment, |d| {
        d.status = Some(DeploymentStatus {
            conditions: Some(vec![
                DeploymentCondition {
                    type_: "Available".to_string(),
                    status: "True".to_string(),
                    reason: Some("MinimumReplicasAvailable".to_string()),
                    ..DeploymentCondition::default()
                },
                DeploymentCondition {
                    type_: "Progressing".to_string(),
                    status: "True".to_string(),
                    reason: Some("NewReplicaSetAvailable".to_string()),
                    ..DeploymentCondition::default()
                },
            ]),
            ..DeploymentStatus::default()
        });
    });
}

async fn ready_cluster() -> Cluster {
    let cluster = Cluster::new();
    cluster.seed_image_prefix();
    cluster.seed(&square_function());
    function::reconciler().unwrap().reconcile(&cluster.ctx, &key()).await.unwrap();
    cluster.seed(&square_deployer());
    cluster
}

#[tokio::test]
async fn test_deployer_runs_function_image_and_becomes_ready() {
    let cluster = ready_cluster().await;
    let reconciler = deployer::reconciler().unwrap();

    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();
    let deployment = cluster.only::<Deployment>();
    assert_eq!(
        container_image(&deployment).as_deref(),
        Some("registry.example.com/riff/square")
    );
    let service = cluster.only::<Service>();
    assert_eq!(service.metadata.name.as_deref(), Some("square"));

    let status = cluster.get::<Deployer>("square").unwrap().status.unwrap();
    assert_eq!(status.latest_image.as_deref(), Some("registry.example.com/riff/square"));
    assert!(status.get_condition("ServiceReady").unwrap().is_true());
    assert!(status.get_condition("Ready").unwrap().is_unknown());

    roll_out(&cluster);
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();

    let status = cluster.get::<Deployer>("square").unwrap().status.unwrap();
    assert!(status.get_condition("DeploymentReady").unwrap().is_true());
    assert!(status.is_ready());
    assert_eq!(
        status.address.map(|a| a.url).as_deref(),
        Some("http://square.default.svc.cluster.local")
    );
}

#[tokio::test]
async fn test_new_function_image_rolls_existing_deployment() {
    let cluster = ready_cluster().await;
    let reconciler = deployer::reconciler().unwrap();
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();
    let created = cluster.only::<Deployment>();

    let function = cluster.get::<Function>("square").unwrap();
    cluster.edit(function, |f| {
        let status = f.status.get_or_insert_with(BuildStatus::default);
        status.latest_image = Some("registry.example.com/riff/square@sha256:feed".to_string());
    });

    // The Function watch maps the change back to the tracking Deployer
    let trackers = cluster.tracker.lookup(&TrackedKey::new::<Function>(NAMESPACE, "square"));
    assert_eq!(trackers, vec![key()]);
    reconciler.reconcile(&cluster.ctx, &trackers[0]).await.unwrap();

    let updated = cluster.only::<Deployment>();
    assert_eq!(updated.metadata.name, created.metadata.name);
    assert_eq!(
        container_image(&updated).as_deref(),
        Some("registry.example.com/riff/square@sha256:feed")
    );
}

#[tokio::test]
async fn test_scaled_replicas_are_not_clobbered() {
    let cluster = ready_cluster().await;
    let reconciler = deployer::reconciler().unwrap();
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();

    let deployment = cluster.only::<Deployment>();
    cluster.edit(deployment, |d| {
        if let Some(spec) = d.spec.as_mut() {
            spec.replicas = Some(3);
            spec.revision_history_limit = Some(10);
        }
    });
    cluster.store.clear_actions();
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();

    assert!(!cluster
        .store
        .writes()
        .iter()
        .any(|a| a.matches(Verb::Update, "Deployment")));
    let spec = cluster.only::<Deployment>().spec.unwrap();
    assert_eq!(spec.replicas, Some(3));
    assert_eq!(spec.revision_history_limit, Some(10));
}

#[tokio::test]
async fn test_server_defaulted_template_fields_are_not_drift() {
    let cluster = ready_cluster().await;
    let reconciler = deployer::reconciler().unwrap();
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();

    let deployment = cluster.only::<Deployment>();
    cluster.edit(deployment, |d| {
        let Some(spec) = d.spec.as_mut() else { return };
        spec.progress_deadline_seconds = Some(600);
        let Some(pod) = spec.template.spec.as_mut() else { return };
        pod.dns_policy = Some("ClusterFirst".to_string());
        pod.restart_policy = Some("Always".to_string());
        pod.scheduler_name = Some("default-scheduler".to_string());
        pod.termination_grace_period_seconds = Some(30);
        let container = &mut pod.containers[0];
        container.termination_message_path = Some("/dev/termination-log".to_string());
        container.termination_message_policy = Some("File".to_string());
        container.image_pull_policy = Some("IfNotPresent".to_string());
        for port in container.ports.iter_mut().flatten() {
            port.protocol = Some("TCP".to_string());
        }
        if let Some(probe) = container.readiness_probe.as_mut() {
            probe.period_seconds = Some(10);
            probe.timeout_seconds = Some(1);
            probe.success_threshold = Some(1);
            probe.failure_threshold = Some(3);
        }
    });
    cluster.store.clear_actions();
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();

    assert!(!cluster
        .store
        .writes()
        .iter()
        .any(|a| a.matches(Verb::Update, "Deployment")));
}

#[tokio::test]
async fn test_edited_image_is_restored() {
    let cluster = ready_cluster().await;
    let reconciler = deployer::reconciler().unwrap();
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();

    let deployment = cluster.only::<Deployment>();
    cluster.edit(deployment, |d| {
        if let Some(pod) = d.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
            pod.containers[0].image = Some("docker.io/someone/else".to_string());
        }
    });
    reconciler.reconcile(&cluster.ctx, &key()).await.unwrap();

    assert_eq!(
        container_image(&cluster.only::<Deployment>()).as_deref(),
        Some("registry.example.com/riff/square")
    );
}

#[tokio::test]
async fn test_missing_function_leaves_no_children() {
    let cluster = Cluster::new();
    cluster.seed(&square_deployer());
    deployer::reconciler().unwrap().reconcile(&cluster.ctx, &key()).await.unwrap();

    assert!(cluster.all::<Deployment>().is_empty());
    assert!(cluster.all::<Service>().is_empty());
    let status = cluster.get::<Deployer>("square").unwrap().status.unwrap();
    assert!(status.latest_image.is_none());
    assert!(!status.is_ready());

    // Creating the Function later reaches the Deployer through the tracker
    assert_eq!(
        cluster.tracker.lookup(&TrackedKey::new::<Function>(NAMESPACE, "square")),
        vec![key()]
    );
}
