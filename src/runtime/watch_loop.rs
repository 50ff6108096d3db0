//! # Watch Loop
//!
//! One kube-runtime controller per resource kind, each supervised by a
//! restart loop. Owned child kinds are watched through `owns`; kinds a
//! reconciler reads without owning are watched through `watches`, mapped
//! back to their dependents by the kind's tracker.
//!
//! | Kind | Owns | Watches (tracked) |
//! |---|---|---|
//! | Function, Application | PersistentVolumeClaim, kpack Image | build ConfigMap |
//! | Container | | build ConfigMap, build ServiceAccount, Secret |
//! | Deployer | Deployment, Service | Application, Container, Function |
//! | Stream | ConfigMap, Secret | Gateway |
//! | Processor | Deployment, ScaledObject | processor ConfigMap, Stream, Container, Function, Secret |
//!
//! The credential and builders controllers create objects that may not
//! exist yet, so they are driven per Namespace; their inputs map to the
//! namespace they live in.

use crate::config::{ControllerConfig, SharedControllerConfig};
use crate::controller::client::Client;
use crate::controller::events::EventRecorder;
use crate::controller::reconciler::{Context, ParentReconciler, Reconciler, ReconcilerError};
use crate::controller::server::ServerState;
use crate::controller::tracker::{run_sweeper, NamespacedName, TrackedKey, Tracker};
use crate::controllers::builders::{is_riff_builder, BuildersReconciler};
use crate::controllers::credential::CredentialReconciler;
use crate::controllers::{application, container, deployer, function, processor, stream};
use crate::crd::{
    Application, BuildResource, ClusterBuilder, Container, Deployer, Function, Gateway, KpackImage, Processor,
    ScaledObject, Stream as RiffStream, CREDENTIAL_LABEL_KEY,
};
use crate::observability;
use crate::provisioner::{HttpProvisioner, StreamProvisioner};
use crate::registry::{DigestResolver, RegistryClient};
use crate::runtime::error_policy::{handle_reconciliation_error, handle_watch_stream_error, reset_backoff};
use crate::runtime::ReconcileData;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, PersistentVolumeClaim, Secret, Service, ServiceAccount};
use kube::api::Api;
use kube::Resource;
use kube_runtime::controller::{self, Action};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{watcher, Controller};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// One event of a running controller stream
pub type ControllerEvent<T> = Result<(ObjectRef<T>, Action), controller::Error<ReconcilerError, watcher::Error>>;

type ParentData<T> = Arc<ReconcileData<ParentReconciler<T>>>;

/// Reconcile one object on behalf of kube-runtime
///
/// A successful run clears the object's error backoff. Without an explicit
/// requeue the object is revisited after the resync interval.
pub async fn reconcile<R: Reconciler>(
    obj: Arc<R::Resource>,
    data: Arc<ReconcileData<R>>,
) -> Result<Action, ReconcilerError> {
    let key = NamespacedName::for_object(obj.as_ref());
    let span = tracing::info_span!(
        "controller.watch.reconcile",
        resource.kind = %R::Resource::kind(&()),
        resource.name = %key.name,
        resource.namespace = %key.namespace,
        resource.generation = obj.meta().generation.unwrap_or(0),
    );
    let result = data.reconciler.reconcile(&data.ctx, &key).instrument(span).await?;
    reset_backoff(&data, &key.namespace, &key.name);

    let action = match result.delay() {
        Some(delay) => {
            observability::metrics::increment_requeues("requested");
            Action::requeue(delay)
        }
        None => Action::requeue(data.ctx.config.resync_interval()),
    };
    debug!(resource.name = %key.name, action = ?action, "watch.event.reconciled");
    Ok(action)
}

/// Map a watched object to every resource of kind `T` tracking it
pub fn tracked_by<K, T>(tracker: Arc<Tracker>) -> impl Fn(K) -> Vec<ObjectRef<T>> + Send + Sync + 'static
where
    K: Resource<DynamicType = ()>,
    T: Resource<DynamicType = ()>,
{
    move |obj: K| {
        let key = TrackedKey::for_object(&obj);
        let trackers = tracker.lookup(&key);
        observability::metrics::record_tracker_lookup(&key.kind, trackers.len());
        trackers
            .into_iter()
            .map(|n| ObjectRef::new(&n.name).within(&n.namespace))
            .collect()
    }
}

/// Map a namespaced object to the Namespace it lives in
pub fn namespace_of<K: Resource>(obj: K) -> Option<ObjectRef<Namespace>> {
    obj.meta().namespace.as_deref().map(ObjectRef::new)
}

/// Settings shared by every controller of one process
struct Watches {
    client: kube::Client,
    controller: controller::Config,
    build_config_maps: watcher::Config,
    build_service_accounts: watcher::Config,
    processor_config_map: watcher::Config,
    credentials: watcher::Config,
    system_namespace: String,
    builders_config_map: watcher::Config,
}

impl Watches {
    fn new(client: kube::Client, config: &ControllerConfig) -> Self {
        let named = |name: &str| watcher::Config::default().fields(&format!("metadata.name={name}"));
        Self {
            client,
            controller: controller::Config::default().concurrency(config.max_concurrent_reconciliations),
            build_config_maps: named(&config.build_config_map_name),
            build_service_accounts: named(&config.build_service_account),
            processor_config_map: named(&config.processor_config_map_name),
            credentials: watcher::Config::default().labels(CREDENTIAL_LABEL_KEY),
            system_namespace: config.system_namespace.clone(),
            builders_config_map: named(&config.builders_config_map_name),
        }
    }

    fn resources() -> watcher::Config {
        watcher::Config::default().any_semantic()
    }
}

fn build_controller<T: BuildResource>(
    watches: &Watches,
    data: &ParentData<T>,
) -> impl Stream<Item = ControllerEvent<T>> {
    let client = watches.client.clone();
    Controller::new(Api::<T>::all(client.clone()), Watches::resources())
        .owns(Api::<PersistentVolumeClaim>::all(client.clone()), watcher::Config::default())
        .owns(Api::<KpackImage>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<ConfigMap>::all(client),
            watches.build_config_maps.clone(),
            tracked_by::<ConfigMap, T>(Arc::clone(&data.ctx.tracker)),
        )
        .with_config(watches.controller.clone())
        .shutdown_on_signal()
        .run(
            reconcile::<ParentReconciler<T>>,
            handle_reconciliation_error::<ParentReconciler<T>>,
            Arc::clone(data),
        )
}

fn container_controller(
    watches: &Watches,
    data: &ParentData<Container>,
) -> impl Stream<Item = ControllerEvent<Container>> {
    let client = watches.client.clone();
    let tracker = &data.ctx.tracker;
    Controller::new(Api::<Container>::all(client.clone()), Watches::resources())
        .watches(
            Api::<ConfigMap>::all(client.clone()),
            watches.build_config_maps.clone(),
            tracked_by::<ConfigMap, Container>(Arc::clone(tracker)),
        )
        .watches(
            Api::<ServiceAccount>::all(client.clone()),
            watches.build_service_accounts.clone(),
            tracked_by::<ServiceAccount, Container>(Arc::clone(tracker)),
        )
        .watches(
            Api::<Secret>::all(client),
            watcher::Config::default(),
            tracked_by::<Secret, Container>(Arc::clone(tracker)),
        )
        .with_config(watches.controller.clone())
        .shutdown_on_signal()
        .run(
            reconcile::<ParentReconciler<Container>>,
            handle_reconciliation_error::<ParentReconciler<Container>>,
            Arc::clone(data),
        )
}

fn deployer_controller(
    watches: &Watches,
    data: &ParentData<Deployer>,
) -> impl Stream<Item = ControllerEvent<Deployer>> {
    let client = watches.client.clone();
    let tracker = &data.ctx.tracker;
    Controller::new(Api::<Deployer>::all(client.clone()), Watches::resources())
        .owns(Api::<Deployment>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<Application>::all(client.clone()),
            watcher::Config::default(),
            tracked_by::<Application, Deployer>(Arc::clone(tracker)),
        )
        .watches(
            Api::<Container>::all(client.clone()),
            watcher::Config::default(),
            tracked_by::<Container, Deployer>(Arc::clone(tracker)),
        )
        .watches(
            Api::<Function>::all(client),
            watcher::Config::default(),
            tracked_by::<Function, Deployer>(Arc::clone(tracker)),
        )
        .with_config(watches.controller.clone())
        .shutdown_on_signal()
        .run(
            reconcile::<ParentReconciler<Deployer>>,
            handle_reconciliation_error::<ParentReconciler<Deployer>>,
            Arc::clone(data),
        )
}

fn stream_controller(
    watches: &Watches,
    data: &ParentData<RiffStream>,
) -> impl Stream<Item = ControllerEvent<RiffStream>> {
    let client = watches.client.clone();
    Controller::new(Api::<RiffStream>::all(client.clone()), Watches::resources())
        .owns(Api::<ConfigMap>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Secret>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<Gateway>::all(client),
            watcher::Config::default(),
            tracked_by::<Gateway, RiffStream>(Arc::clone(&data.ctx.tracker)),
        )
        .with_config(watches.controller.clone())
        .shutdown_on_signal()
        .run(
            reconcile::<ParentReconciler<RiffStream>>,
            handle_reconciliation_error::<ParentReconciler<RiffStream>>,
            Arc::clone(data),
        )
}

fn processor_controller(
    watches: &Watches,
    data: &ParentData<Processor>,
) -> impl Stream<Item = ControllerEvent<Processor>> {
    let client = watches.client.clone();
    let tracker = &data.ctx.tracker;
    Controller::new(Api::<Processor>::all(client.clone()), Watches::resources())
        .owns(Api::<Deployment>::all(client.clone()), watcher::Config::default())
        .owns(Api::<ScaledObject>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<ConfigMap>::namespaced(client.clone(), &watches.system_namespace),
            watches.processor_config_map.clone(),
            tracked_by::<ConfigMap, Processor>(Arc::clone(tracker)),
        )
        .watches(
            Api::<RiffStream>::all(client.clone()),
            watcher::Config::default(),
            tracked_by::<RiffStream, Processor>(Arc::clone(tracker)),
        )
        .watches(
            Api::<Container>::all(client.clone()),
            watcher::Config::default(),
            tracked_by::<Container, Processor>(Arc::clone(tracker)),
        )
        .watches(
            Api::<Function>::all(client.clone()),
            watcher::Config::default(),
            tracked_by::<Function, Processor>(Arc::clone(tracker)),
        )
        .watches(
            Api::<Secret>::all(client),
            watcher::Config::default(),
            tracked_by::<Secret, Processor>(Arc::clone(tracker)),
        )
        .with_config(watches.controller.clone())
        .shutdown_on_signal()
        .run(
            reconcile::<ParentReconciler<Processor>>,
            handle_reconciliation_error::<ParentReconciler<Processor>>,
            Arc::clone(data),
        )
}

fn credential_controller(
    watches: &Watches,
    data: &Arc<ReconcileData<CredentialReconciler>>,
) -> impl Stream<Item = ControllerEvent<Namespace>> {
    let client = watches.client.clone();
    Controller::new(Api::<Namespace>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<ServiceAccount>::all(client.clone()),
            watches.build_service_accounts.clone(),
            namespace_of::<ServiceAccount>,
        )
        .watches(
            Api::<Secret>::all(client.clone()),
            watches.credentials.clone(),
            namespace_of::<Secret>,
        )
        .watches(
            Api::<Application>::all(client.clone()),
            watcher::Config::default(),
            namespace_of::<Application>,
        )
        .watches(
            Api::<Function>::all(client.clone()),
            watcher::Config::default(),
            namespace_of::<Function>,
        )
        .watches(
            Api::<Container>::all(client),
            watcher::Config::default(),
            namespace_of::<Container>,
        )
        .with_config(watches.controller.clone())
        .shutdown_on_signal()
        .run(
            reconcile::<CredentialReconciler>,
            handle_reconciliation_error::<CredentialReconciler>,
            Arc::clone(data),
        )
}

fn builders_controller(
    watches: &Watches,
    data: &Arc<ReconcileData<BuildersReconciler>>,
) -> impl Stream<Item = ControllerEvent<Namespace>> {
    let client = watches.client.clone();
    let system_namespace = watches.system_namespace.clone();
    let to_system_namespace = move |builder: ClusterBuilder| {
        is_riff_builder(builder.meta().name.as_deref().unwrap_or_default())
            .then(|| ObjectRef::<Namespace>::new(&system_namespace))
    };
    Controller::new(
        Api::<Namespace>::all(client.clone()),
        watcher::Config::default().fields(&format!("metadata.name={}", watches.system_namespace)),
    )
    .watches(
        Api::<ClusterBuilder>::all(client.clone()),
        watcher::Config::default(),
        to_system_namespace,
    )
    .watches(
        Api::<ConfigMap>::namespaced(client, &watches.system_namespace),
        watches.builders_config_map.clone(),
        namespace_of::<ConfigMap>,
    )
    .with_config(watches.controller.clone())
    .shutdown_on_signal()
    .run(
        reconcile::<BuildersReconciler>,
        handle_reconciliation_error::<BuildersReconciler>,
        Arc::clone(data),
    )
}

/// Run a controller stream, restarting it whenever a watch error ends it,
/// until shutdown is requested
///
/// `name` labels the controller in logs; it is the kind it reconciles.
async fn supervise<T, S, F>(
    name: &str,
    build: F,
    server_state: Arc<ServerState>,
    controller_config: SharedControllerConfig,
) where
    T: Resource<DynamicType = ()> + 'static,
    S: Stream<Item = ControllerEvent<T>>,
    F: Fn() -> S,
{
    let kind = name.to_string();
    let backoff_start_ms = controller_config.read().await.backoff_start_ms;
    let backoff = Arc::new(AtomicU64::new(backoff_start_ms));

    loop {
        if !server_state.is_ready.load(Ordering::Relaxed) {
            info!(resource.kind = %kind, "Shutdown requested, exiting watch loop");
            break;
        }

        let watch_span = tracing::info_span!("controller.watch", resource.kind = %kind, operation = "watch_loop");
        info!(resource.kind = %kind, "Starting controller watch loop...");
        build()
            .then(|event| {
                let backoff = Arc::clone(&backoff);
                let controller_config = Arc::clone(&controller_config);
                let kind = kind.clone();
                async move {
                    match event {
                        Ok((object, _)) => {
                            let start = controller_config.read().await.backoff_start_ms;
                            backoff.store(start, Ordering::Relaxed);
                            debug!(object = %object, "watch.event.success");
                            true
                        }
                        Err(controller::Error::ReconcilerFailed(e, object)) => {
                            debug!(object = %object, error = %e, "watch.event.reconciliation_failed");
                            true
                        }
                        Err(controller::Error::ObjectNotFound(object)) => {
                            debug!(object = %object, "watch.event.object_gone");
                            true
                        }
                        Err(e) => {
                            let error_string = format!("{e:?}");
                            let config = controller_config.read().await;
                            let max_backoff = config.backoff_max_ms;
                            let restart_delay = config.watch_restart_delay_duration();
                            drop(config);
                            handle_watch_stream_error(&kind, &error_string, &backoff, max_backoff, restart_delay).await
                        }
                    }
                }
            })
            .take_while(|keep| futures::future::ready(*keep))
            .for_each(|_| futures::future::ready(()))
            .instrument(watch_span)
            .await;

        if !server_state.is_ready.load(Ordering::Relaxed) {
            info!(resource.kind = %kind, "Shutdown requested, exiting watch loop");
            break;
        }

        let delay = controller_config.read().await.watch_restart_delay_after_end_duration();
        warn!(
            resource.kind = %kind,
            "Controller watch stream ended, restarting in {} seconds...",
            delay.as_secs()
        );
        tokio::time::sleep(delay).await;
    }
}

/// Context for one kind; each kind tracks its own dependencies
fn context(client: &kube::Client, recorder: &Arc<dyn EventRecorder>, config: &ControllerConfig) -> Context {
    Context::new(
        Client::kube(client.clone()),
        Arc::new(Tracker::new()),
        Arc::clone(recorder),
        config.clone(),
    )
}

/// Run every controller until shutdown
pub async fn run_watch_loop(
    client: kube::Client,
    recorder: Arc<dyn EventRecorder>,
    server_state: Arc<ServerState>,
    controller_config: SharedControllerConfig,
) -> Result<(), anyhow::Error> {
    info!("Starting controller watch loops...");
    let config = controller_config.read().await.clone();

    let shutdown_server_state = Arc::clone(&server_state);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for shutdown signal: {}", e);
            return;
        }
        info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
        shutdown_server_state.is_ready.store(false, Ordering::Relaxed);
        info!("Marked server as not ready, waiting for in-flight reconciliations to complete...");
    });

    let registry: Arc<dyn DigestResolver> = Arc::new(RegistryClient::new(config.outbound_timeout())?);
    let provisioner: Arc<dyn StreamProvisioner> = Arc::new(HttpProvisioner::new(config.outbound_timeout())?);

    let functions = Arc::new(ReconcileData::new(
        function::reconciler()?,
        context(&client, &recorder, &config),
    ));
    let applications = Arc::new(ReconcileData::new(
        application::reconciler()?,
        context(&client, &recorder, &config),
    ));
    let containers = Arc::new(ReconcileData::new(
        container::reconciler()?,
        context(&client, &recorder, &config).with_registry(registry),
    ));
    let deployers = Arc::new(ReconcileData::new(
        deployer::reconciler()?,
        context(&client, &recorder, &config),
    ));
    let streams = Arc::new(ReconcileData::new(
        stream::reconciler()?,
        context(&client, &recorder, &config).with_provisioner(provisioner),
    ));
    let processors = Arc::new(ReconcileData::new(
        processor::reconciler()?,
        context(&client, &recorder, &config),
    ));
    let credentials = Arc::new(ReconcileData::new(
        CredentialReconciler,
        context(&client, &recorder, &config),
    ));
    let builders = Arc::new(ReconcileData::new(
        BuildersReconciler,
        context(&client, &recorder, &config),
    ));

    let sweepers: Vec<_> = [
        &functions.ctx.tracker,
        &applications.ctx.tracker,
        &containers.ctx.tracker,
        &deployers.ctx.tracker,
        &streams.ctx.tracker,
        &processors.ctx.tracker,
    ]
    .into_iter()
    .map(|tracker| tokio::spawn(run_sweeper(Arc::clone(tracker), config.tracker_sweep_interval())))
    .collect();

    let watches = Watches::new(client, &config);
    tokio::join!(
        supervise(
            "Function",
            || build_controller(&watches, &functions),
            Arc::clone(&server_state),
            Arc::clone(&controller_config),
        ),
        supervise(
            "Application",
            || build_controller(&watches, &applications),
            Arc::clone(&server_state),
            Arc::clone(&controller_config),
        ),
        supervise(
            "Container",
            || container_controller(&watches, &containers),
            Arc::clone(&server_state),
            Arc::clone(&controller_config),
        ),
        supervise(
            "Deployer",
            || deployer_controller(&watches, &deployers),
            Arc::clone(&server_state),
            Arc::clone(&controller_config),
        ),
        supervise(
            "Stream",
            || stream_controller(&watches, &streams),
            Arc::clone(&server_state),
            Arc::clone(&controller_config),
        ),
        supervise(
            "Processor",
            || processor_controller(&watches, &processors),
            Arc::clone(&server_state),
            Arc::clone(&controller_config),
        ),
        supervise(
            "ServiceAccount",
            || credential_controller(&watches, &credentials),
            Arc::clone(&server_state),
            Arc::clone(&controller_config),
        ),
        supervise(
            "ClusterBuilder",
            || builders_controller(&watches, &builders),
            Arc::clone(&server_state),
            Arc::clone(&controller_config),
        ),
    );

    for sweeper in sweepers {
        sweeper.abort();
    }
    info!("Controller stopped gracefully");
    Ok(())
}
