//! # Configuration
//!
//! Environment-driven configuration for the controller and its HTTP server.
//!
//! - `controller`: reconciliation, tracker and build defaults
//! - `server`: metrics and health server settings

pub mod controller;
pub mod server;

pub use controller::ControllerConfig;
pub use server::ServerConfig;

use std::sync::Arc;
use tokio::sync::RwLock;

/// Controller configuration shared between runtime tasks
pub type SharedControllerConfig = Arc<RwLock<ControllerConfig>>;

/// Server configuration shared between runtime tasks
pub type SharedServerConfig = Arc<RwLock<ServerConfig>>;

/// Load both configurations from the environment
pub fn create_shared_config() -> (SharedControllerConfig, SharedServerConfig) {
    (
        Arc::new(RwLock::new(ControllerConfig::from_env())),
        Arc::new(RwLock::new(ServerConfig::from_env())),
    )
}
