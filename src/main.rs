//! # riff System Controller
//!
//! Kubernetes controller for the riff build and runtime resources.
//!
//! - **Function, Application**: resolve the target image and drive an
//!   on-cluster kpack build with a persistent build cache
//! - **Container**: resolve and poll a pre-built image
//! - **Deployer**: run the latest image of a build as a Deployment behind a
//!   Service
//!
//! Metrics and health checks are served on `METRICS_PORT` (default 5000).

use anyhow::Result;
use riff_system::runtime::{initialization::initialize, watch_loop::run_watch_loop};

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;
    run_watch_loop(
        init.client,
        init.recorder,
        init.server_state,
        init.controller_config,
    )
    .await
}
