//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use std::time::Duration;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Period after which every resource is reconciled again, changed or not
    pub resync_interval_secs: u64,
    /// How long a tracked dependency stays registered without being renewed
    /// Defaults to the resync interval, so a live parent always renews in time
    pub dependency_lease_secs: u64,
    /// Interval between sweeps that reclaim expired tracker entries
    pub tracker_sweep_interval_secs: u64,
    /// First requeue delay after a hard reconciliation error (seconds)
    pub error_backoff_min_secs: u64,
    /// Cap on the requeue delay after repeated hard errors (seconds)
    pub error_backoff_max_secs: u64,
    /// Exponential backoff starting value (milliseconds)
    /// Initial delay before restarting a throttled watch stream
    pub backoff_start_ms: u64,
    /// Exponential backoff maximum value (milliseconds)
    pub backoff_max_ms: u64,
    /// Watch stream restart delay after unknown errors (seconds)
    pub watch_restart_delay_secs: u64,
    /// Watch stream restart delay after stream ends (seconds)
    pub watch_restart_delay_after_end_secs: u64,
    /// How often a Container re-resolves its image (seconds)
    pub container_polling_interval_secs: u64,
    /// Build cache size used when a resource does not request one
    pub default_build_cache_size: String,
    /// ConfigMap holding `default-image-prefix` in each namespace
    pub build_config_map_name: String,
    /// ServiceAccount builds run as
    pub build_service_account: String,
    /// Namespace holding cluster-wide riff settings
    pub system_namespace: String,
    /// ConfigMap naming the stream processor sidecar image
    pub processor_config_map_name: String,
    /// ConfigMap the riff cluster builders are published to
    pub builders_config_map_name: String,
    /// Timeout for registry and provisioner requests (seconds)
    pub outbound_timeout_secs: u64,
    /// Maximum concurrent reconciliations per resource kind
    pub max_concurrent_reconciliations: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            dependency_lease_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            tracker_sweep_interval_secs: DEFAULT_TRACKER_SWEEP_INTERVAL_SECS,
            error_backoff_min_secs: DEFAULT_ERROR_BACKOFF_MIN_SECS,
            error_backoff_max_secs: DEFAULT_ERROR_BACKOFF_MAX_SECS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            watch_restart_delay_after_end_secs: DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS,
            container_polling_interval_secs: DEFAULT_CONTAINER_POLLING_INTERVAL_SECS,
            default_build_cache_size: DEFAULT_BUILD_CACHE_SIZE.to_string(),
            build_config_map_name: DEFAULT_BUILD_CONFIG_MAP_NAME.to_string(),
            build_service_account: DEFAULT_BUILD_SERVICE_ACCOUNT.to_string(),
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            processor_config_map_name: DEFAULT_PROCESSOR_CONFIG_MAP_NAME.to_string(),
            builders_config_map_name: DEFAULT_BUILDERS_CONFIG_MAP_NAME.to_string(),
            outbound_timeout_secs: DEFAULT_OUTBOUND_TIMEOUT_SECS,
            max_concurrent_reconciliations: DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        let resync_interval_secs =
            env_var_or_default("RESYNC_INTERVAL_SECS", DEFAULT_RESYNC_INTERVAL_SECS);
        Self {
            resync_interval_secs,
            dependency_lease_secs: env_var_or_default(
                "DEPENDENCY_LEASE_SECS",
                resync_interval_secs,
            ),
            tracker_sweep_interval_secs: env_var_or_default(
                "TRACKER_SWEEP_INTERVAL_SECS",
                DEFAULT_TRACKER_SWEEP_INTERVAL_SECS,
            ),
            error_backoff_min_secs: env_var_or_default(
                "ERROR_BACKOFF_MIN_SECS",
                DEFAULT_ERROR_BACKOFF_MIN_SECS,
            ),
            error_backoff_max_secs: env_var_or_default(
                "ERROR_BACKOFF_MAX_SECS",
                DEFAULT_ERROR_BACKOFF_MAX_SECS,
            ),
            backoff_start_ms: env_var_or_default("BACKOFF_START_MS", DEFAULT_BACKOFF_START_MS),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                DEFAULT_WATCH_RESTART_DELAY_SECS,
            ),
            watch_restart_delay_after_end_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_AFTER_END_SECS",
                DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS,
            ),
            container_polling_interval_secs: env_var_or_default(
                "CONTAINER_POLLING_INTERVAL_SECS",
                DEFAULT_CONTAINER_POLLING_INTERVAL_SECS,
            ),
            default_build_cache_size: env_var_or_default_str(
                "DEFAULT_BUILD_CACHE_SIZE",
                DEFAULT_BUILD_CACHE_SIZE,
            ),
            build_config_map_name: env_var_or_default_str(
                "BUILD_CONFIG_MAP_NAME",
                DEFAULT_BUILD_CONFIG_MAP_NAME,
            ),
            build_service_account: env_var_or_default_str(
                "BUILD_SERVICE_ACCOUNT",
                DEFAULT_BUILD_SERVICE_ACCOUNT,
            ),
            system_namespace: env_var_or_default_str("SYSTEM_NAMESPACE", DEFAULT_SYSTEM_NAMESPACE),
            processor_config_map_name: env_var_or_default_str(
                "PROCESSOR_CONFIG_MAP_NAME",
                DEFAULT_PROCESSOR_CONFIG_MAP_NAME,
            ),
            builders_config_map_name: env_var_or_default_str(
                "BUILDERS_CONFIG_MAP_NAME",
                DEFAULT_BUILDERS_CONFIG_MAP_NAME,
            ),
            outbound_timeout_secs: env_var_or_default(
                "OUTBOUND_TIMEOUT_SECS",
                DEFAULT_OUTBOUND_TIMEOUT_SECS,
            ),
            max_concurrent_reconciliations: env_var_or_default(
                "MAX_CONCURRENT_RECONCILIATIONS",
                DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            ),
        }
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Lease handed to every `Tracker::track` call
    pub fn dependency_lease(&self) -> Duration {
        Duration::from_secs(self.dependency_lease_secs)
    }

    pub fn tracker_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.tracker_sweep_interval_secs)
    }

    pub fn error_backoff_min(&self) -> Duration {
        Duration::from_secs(self.error_backoff_min_secs)
    }

    pub fn error_backoff_max(&self) -> Duration {
        Duration::from_secs(self.error_backoff_max_secs)
    }

    /// Get watch restart delay duration
    pub fn watch_restart_delay_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }

    /// Get watch restart delay after end duration
    pub fn watch_restart_delay_after_end_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_after_end_secs)
    }

    pub fn container_polling_interval(&self) -> Duration {
        Duration::from_secs(self.container_polling_interval_secs)
    }

    pub fn outbound_timeout(&self) -> Duration {
        Duration::from_secs(self.outbound_timeout_secs)
    }
}

/// Read environment variable or return default value
pub(crate) fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_lease_matches_resync() {
        let config = ControllerConfig::default();
        assert_eq!(config.dependency_lease(), config.resync_interval());
        assert_eq!(config.resync_interval(), Duration::from_secs(36_000));
        assert_eq!(config.default_build_cache_size, "1Gi");
        assert_eq!(config.build_config_map_name, "riff-build");
        assert_eq!(config.system_namespace, "riff-system");
        assert_eq!(config.processor_config_map_name, "riff-streaming-processor");
        assert_eq!(config.outbound_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_env_var_or_default_falls_back_on_garbage() {
        assert_eq!(env_var_or_default("RIFF_TEST_UNSET_VARIABLE", 7u64), 7);
        assert_eq!(
            env_var_or_default_str("RIFF_TEST_UNSET_VARIABLE", "riff-build"),
            "riff-build"
        );
    }
}
