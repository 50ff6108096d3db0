//! # Initialization
//!
//! Process startup: rustls provider, tracing, metrics, health server and the
//! Kubernetes client the controllers share.

use crate::config::{create_shared_config, SharedControllerConfig, SharedServerConfig};
use crate::controller::events::{EventRecorder, KubeEventRecorder};
use crate::controller::server::{start_server, ServerState};
use crate::crd::{Application, Container, Deployer, Function, Processor, Stream};
use crate::observability;
use anyhow::Result;
use kube::api::{Api, ListParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

/// Name the controller reports as the source of its events
pub const CONTROLLER_NAME: &str = "riff-system";

/// Everything the watch loop needs to start
pub struct InitializationResult {
    pub client: Client,
    pub recorder: Arc<dyn EventRecorder>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    pub controller_config: SharedControllerConfig,
    pub server_config: SharedServerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.is_ready.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// Installs the rustls crypto provider, tracing and metrics, starts the
/// health server and waits for it to bind, then connects to the cluster.
pub async fn initialize() -> Result<InitializationResult> {
    // Must precede any TLS use by the kube client
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_provider| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "riff_system=info".into()),
        )
        .init();

    info!("Starting riff system controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState {
        is_ready: Arc::new(AtomicBool::new(false)),
    });

    let (controller_config, server_config) = create_shared_config();

    let server_port = server_config.read().await.metrics_port;
    let server_state_clone = Arc::clone(&server_state);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    wait_for_server_ready(&server_state, &server_handle, Arc::clone(&server_config)).await?;

    let client = Client::try_default().await?;
    let recorder: Arc<dyn EventRecorder> = Arc::new(KubeEventRecorder::new(client.clone(), CONTROLLER_NAME));

    summarize_existing::<Function>(&client).await;
    summarize_existing::<Application>(&client).await;
    summarize_existing::<Container>(&client).await;
    summarize_existing::<Deployer>(&client).await;
    summarize_existing::<Stream>(&client).await;
    summarize_existing::<Processor>(&client).await;

    info!("Controller initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        recorder,
        server_state,
        controller_config,
        server_config,
    })
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    server_config: SharedServerConfig,
) -> Result<()> {
    let config = server_config.read().await;
    let startup_timeout = std::time::Duration::from_secs(config.startup_timeout_secs);
    let poll_interval = std::time::Duration::from_millis(config.poll_interval_ms);
    drop(config);
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state.is_ready.load(Ordering::Relaxed) {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Log how many resources of kind `K` exist per namespace
///
/// A kind whose CRD is not installed is reported and skipped; the watch
/// loop keeps retrying it.
async fn summarize_existing<K>(client: &Client)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let kind = K::kind(&());
    let span = tracing::info_span!("controller.startup.summary", resource.kind = %kind);

    let api: Api<K> = Api::all(client.clone());
    let list = match api.list(&ListParams::default()).instrument(span.clone()).await {
        Ok(list) => list,
        Err(e) => {
            span.in_scope(|| warn!("Unable to list existing {} resources (is the CRD installed?): {}", kind, e));
            return;
        }
    };

    let by_namespace = group_by_namespace(list.items.iter().map(Resource::meta));
    span.in_scope(|| {
        info!(
            "{}: {} existing resources in {} namespaces",
            kind,
            list.items.len(),
            by_namespace.len()
        );
        for (namespace, names) in &by_namespace {
            info!("  {}: {}", namespace, abbreviate(names));
        }
    });
}

fn group_by_namespace<'a>(
    metas: impl Iterator<Item = &'a kube::api::ObjectMeta>,
) -> BTreeMap<String, Vec<String>> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for meta in metas {
        grouped
            .entry(meta.namespace.clone().unwrap_or_else(|| "default".to_string()))
            .or_default()
            .push(meta.name.clone().unwrap_or_default());
    }
    for names in grouped.values_mut() {
        names.sort();
    }
    grouped
}

fn abbreviate(names: &[String]) -> String {
    if names.len() <= 3 {
        names.join(", ")
    } else {
        format!("{}, ... ({} total)", names[..3].join(", "), names.len())
    }
}
