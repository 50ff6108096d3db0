//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Default HTTP server port for metrics and health checks
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default period after which every resource is reconciled again (10 hours)
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 10 * 60 * 60;

/// Default interval between sweeps of expired tracker entries
pub const DEFAULT_TRACKER_SWEEP_INTERVAL_SECS: u64 = 5 * 60;

/// Default minimum requeue delay after a hard reconciliation error
pub const DEFAULT_ERROR_BACKOFF_MIN_SECS: u64 = 5;

/// Default maximum requeue delay after repeated hard reconciliation errors
pub const DEFAULT_ERROR_BACKOFF_MAX_SECS: u64 = 10 * 60;

/// Default exponential backoff starting value for watch stream throttling (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default exponential backoff maximum value for watch stream throttling (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Default delay before restarting watch stream after unknown errors (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Default delay before restarting watch stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS: u64 = 1;

/// Default interval at which Container resources re-resolve their image
pub const DEFAULT_CONTAINER_POLLING_INTERVAL_SECS: u64 = 60;

/// Default size of a build cache volume
pub const DEFAULT_BUILD_CACHE_SIZE: &str = "1Gi";

/// ConfigMap holding per-namespace build settings
pub const DEFAULT_BUILD_CONFIG_MAP_NAME: &str = "riff-build";

/// ServiceAccount builds run as
pub const DEFAULT_BUILD_SERVICE_ACCOUNT: &str = "riff-build";

/// Key of the build ConfigMap holding the default image prefix
pub const DEFAULT_IMAGE_PREFIX_KEY: &str = "default-image-prefix";

/// Namespace riff's own components and cluster-wide settings live in
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "riff-system";

/// ConfigMap in the system namespace naming the stream processor sidecar image
pub const DEFAULT_PROCESSOR_CONFIG_MAP_NAME: &str = "riff-streaming-processor";

/// Key of the processor ConfigMap holding the sidecar image
pub const PROCESSOR_IMAGE_KEY: &str = "processorImage";

/// ConfigMap in the system namespace listing the riff cluster builders
pub const DEFAULT_BUILDERS_CONFIG_MAP_NAME: &str = "builders";

/// Timeout for requests to image registries and stream provisioners
pub const DEFAULT_OUTBOUND_TIMEOUT_SECS: u64 = 30;

/// Default number of resources reconciled at once per kind
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: u16 = 10;
