//! # Types
//!
//! Core types shared by parent and child reconcilers.

use crate::config::ControllerConfig;
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::client::Client;
use crate::controller::events::{EventKind, EventRecorder};
use crate::controller::stash::{Stash, StashError, StashKey};
use crate::controller::store::StoreError;
use crate::controller::tracker::{NamespacedName, TrackedKey, Tracker};
use crate::provisioner::StreamProvisioner;
use crate::registry::DigestResolver;
use k8s_openapi::api::core::v1::ObjectReference;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Stash(#[from] StashError),

    /// The resource cannot converge until its spec or environment changes.
    /// The matching condition has already been recorded.
    #[error("{reason}: {message}")]
    Invalid { reason: String, message: String },

    #[error("no {0} installed on the reconciliation context")]
    MissingClient(&'static str),

    #[error("Reconciliation failed: {0}")]
    ReconciliationFailed(#[from] anyhow::Error),
}

impl ReconcilerError {
    pub fn invalid(reason: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    /// A stale resourceVersion; retried immediately rather than backed off
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}

/// When to reconcile the resource again
///
/// The default is "only when something changes".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    #[must_use]
    pub fn done() -> Self {
        Self::default()
    }

    /// Requeue without delay
    #[must_use]
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    #[must_use]
    pub fn requeue_after(after: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(after),
        }
    }

    /// Combine two results, keeping the soonest requeue
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        let requeue_after = match (self.requeue_after, other.requeue_after) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            requeue: self.requeue || other.requeue,
            requeue_after,
        }
    }

    /// Delay until the next reconcile, if any
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        if self.requeue {
            Some(Duration::ZERO)
        } else {
            self.requeue_after
        }
    }
}

/// Backoff state for a specific resource
/// Tracks error count and backoff calculator for progressive retries
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl BackoffState {
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            backoff: FibonacciBackoff::new(min, max),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count += 1;
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Everything a reconciler needs besides the resource itself
///
/// Cloned per reconciliation; the stash slot is only filled by
/// [`Context::with_stash`]. Clients for services outside the cluster are
/// installed by the kinds that need them.
#[derive(Clone, Debug)]
pub struct Context {
    pub client: Client,
    pub tracker: Arc<Tracker>,
    pub recorder: Arc<dyn EventRecorder>,
    pub config: Arc<ControllerConfig>,
    // Backoff state per resource (identified by kind/namespace/name)
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
    stash: Option<Arc<Stash>>,
    registry: Option<Arc<dyn DigestResolver>>,
    provisioner: Option<Arc<dyn StreamProvisioner>>,
}

impl Context {
    pub fn new(
        client: Client,
        tracker: Arc<Tracker>,
        recorder: Arc<dyn EventRecorder>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            tracker,
            recorder,
            config: Arc::new(config),
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
            stash: None,
            registry: None,
            provisioner: None,
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn DigestResolver>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn with_provisioner(mut self, provisioner: Arc<dyn StreamProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn registry(&self) -> Result<&Arc<dyn DigestResolver>, ReconcilerError> {
        self.registry.as_ref().ok_or(ReconcilerError::MissingClient("registry client"))
    }

    pub fn provisioner(&self) -> Result<&Arc<dyn StreamProvisioner>, ReconcilerError> {
        self.provisioner
            .as_ref()
            .ok_or(ReconcilerError::MissingClient("stream provisioner"))
    }

    /// A copy of this context with a fresh, empty stash installed
    #[must_use]
    pub fn with_stash(&self) -> Self {
        Self {
            stash: Some(Arc::new(Stash::new())),
            ..self.clone()
        }
    }

    pub fn stash_value<T: Any + Send + Sync>(&self, key: &StashKey<T>, value: T) -> Result<(), StashError> {
        self.stash
            .as_ref()
            .ok_or(StashError::NotInstalled(key.name()))?
            .store(key, value)
    }

    pub fn retrieve_value<T: Any + Clone + Send + Sync>(
        &self,
        key: &StashKey<T>,
    ) -> Result<Option<T>, StashError> {
        self.stash
            .as_ref()
            .ok_or(StashError::NotInstalled(key.name()))?
            .retrieve(key)
    }

    /// Register `tracker`'s dependency on `key` for the configured lease
    pub fn track(&self, key: &TrackedKey, tracker: &NamespacedName) {
        self.tracker.track(key, tracker, self.config.dependency_lease());
    }

    pub async fn event(&self, object: &ObjectReference, kind: EventKind, reason: &str, message: String) {
        self.recorder.event(object, kind, reason, message).await;
    }
}
