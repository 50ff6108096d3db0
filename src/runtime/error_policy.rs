//! # Error Policy
//!
//! Error handling and backoff for the controller watch loops: hard
//! reconciliation errors are retried on a per-resource Fibonacci backoff,
//! and watch stream errors are classified to decide between continuing and
//! restarting the watch.

use crate::controller::reconciler::{BackoffState, Reconciler, ReconcilerError};
use crate::observability;
use crate::runtime::ReconcileData;
use kube::Resource;
use kube_runtime::controller::Action;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Fallback delay when the backoff table cannot be read
const FALLBACK_BACKOFF: Duration = Duration::from_secs(60);

/// Requeue a failed resource after its next Fibonacci backoff
///
/// Backoff state is kept per resource so one failing resource never slows
/// down another. It is reset by the next successful reconciliation.
pub fn handle_reconciliation_error<R: Reconciler>(
    obj: Arc<R::Resource>,
    error: &ReconcilerError,
    data: Arc<ReconcileData<R>>,
) -> Action {
    let kind = R::Resource::kind(&());
    let name = obj.meta().name.as_deref().unwrap_or("unknown");
    let namespace = obj.meta().namespace.as_deref().unwrap_or_default();

    let error_span = tracing::error_span!(
        "controller.watch.reconciliation_error",
        resource.kind = %kind,
        resource.name = name,
        resource.namespace = namespace,
        error = %error
    );
    let _error_guard = error_span.enter();

    error!("Reconciliation error for {}/{}: {}", namespace, name, error);
    observability::metrics::increment_reconciliation_errors(&kind);

    let config = &data.ctx.config;
    let resource_key = backoff_key(&kind, namespace, name);
    let (delay, error_count) = match data.ctx.backoff_states.lock() {
        Ok(mut states) => {
            let state = states
                .entry(resource_key)
                .or_insert_with(|| BackoffState::new(config.error_backoff_min(), config.error_backoff_max()));
            state.increment_error();
            (state.backoff.next_backoff(), state.error_count)
        }
        Err(e) => {
            warn!("Failed to lock backoff states: {}, using default backoff", e);
            (FALLBACK_BACKOFF, 0)
        }
    };

    info!(
        "Retrying with Fibonacci backoff: {}s (error count: {}, trigger source: error-backoff)",
        delay.as_secs(),
        error_count
    );
    observability::metrics::increment_requeues("error-backoff");
    Action::requeue(delay)
}

/// Forget the backoff of a resource that reconciled successfully
pub fn reset_backoff<R: Reconciler>(data: &ReconcileData<R>, namespace: &str, name: &str) {
    let key = backoff_key(&R::Resource::kind(&()), namespace, name);
    if let Ok(mut states) = data.ctx.backoff_states.lock() {
        if let Some(state) = states.get_mut(&key) {
            state.reset();
        }
    }
}

fn backoff_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{kind}/{namespace}/{name}")
}

/// Kind of a watch stream error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchError {
    /// 401: credentials or RBAC revoked
    Unauthorized,
    /// 410: resource version too old
    Expired,
    /// 429: API server storage reinitializing
    Throttled,
    /// 404: resource or CRD missing
    NotFound,
    Other,
}

/// Classify a watch stream error from its debug rendering
///
/// 404 is checked before 401 since a plain-text 404 body surfaces as a
/// serde error that also mentions the failed watch.
pub fn classify_watch_error(error: &str) -> WatchError {
    let is_not_found = error.contains("ObjectNotFound") || error.contains("404") || error.contains("not found");
    if (error.contains("401") || error.contains("Unauthorized")) && !is_not_found {
        WatchError::Unauthorized
    } else if error.contains("410")
        || error.contains("too old resource version")
        || error.contains("Expired")
        || error.contains("Gone")
    {
        WatchError::Expired
    } else if error.contains("429")
        || error.contains("storage is (re)initializing")
        || error.contains("TooManyRequests")
    {
        WatchError::Throttled
    } else if is_not_found {
        WatchError::NotFound
    } else {
        WatchError::Other
    }
}

/// Handle a watch stream error
///
/// Returns `true` to keep the stream going, `false` to drop the event and
/// let the watch restart.
pub async fn handle_watch_stream_error(
    kind: &str,
    error_string: &str,
    backoff: &Arc<AtomicU64>,
    max_backoff_ms: u64,
    watch_restart_delay: Duration,
) -> bool {
    let error_span = tracing::warn_span!("controller.watch.error", resource.kind = kind, error = %error_string);
    let _error_guard = error_span.enter();

    match classify_watch_error(error_string) {
        WatchError::Unauthorized => {
            error!("Watch authentication failed (401 Unauthorized); RBAC may have been revoked or the token expired");
            error!("Verify the riff-system ServiceAccount and its ClusterRoleBinding, then restart the controller pod if RBAC was changed");
            warn!(
                "Waiting {}s before retrying watch (RBAC may need time to propagate)...",
                watch_restart_delay.as_secs()
            );
            tokio::time::sleep(watch_restart_delay).await;
            false
        }
        WatchError::Expired => {
            warn!(error_type = "410", "Watch resource version expired, watch will restart");
            false
        }
        WatchError::Throttled => {
            let current = backoff.load(Ordering::Relaxed);
            warn!(
                "API server storage reinitializing (429), backing off for {}ms before restart...",
                current
            );
            tokio::time::sleep(Duration::from_millis(current)).await;
            backoff.store(current.saturating_mul(2).min(max_backoff_ms), Ordering::Relaxed);
            false
        }
        WatchError::NotFound => {
            warn!(
                "{} watch target not found (404); the CRD may not be installed. Error: {}",
                kind, error_string
            );
            true
        }
        WatchError::Other => {
            error!("Controller stream error: {}", error_string);
            tokio::time::sleep(watch_restart_delay).await;
            false
        }
    }
}
