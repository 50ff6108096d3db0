//! # Events
//!
//! Kubernetes Events emitted while reconciling, visible through
//! `kubectl describe`. Publishing is fire-and-forget: a failed event is
//! logged and never fails the reconciliation.
//!
//! Events are emitted in the order sub-reconcilers produce them. The
//! in-memory recorder preserves that order for assertions.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// Event reasons emitted by riff reconcilers
pub mod reasons {
    pub const CREATED: &str = "Created";
    pub const UPDATED: &str = "Updated";
    pub const DELETED: &str = "Deleted";
    pub const CREATION_FAILED: &str = "CreationFailed";
    pub const UPDATE_FAILED: &str = "UpdateFailed";
    pub const DELETE_FAILED: &str = "DeleteFailed";
    pub const STATUS_UPDATED: &str = "StatusUpdated";
    pub const STATUS_UPDATE_FAILED: &str = "StatusUpdateFailed";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

impl From<EventKind> for EventType {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Warning => write!(f, "Warning"),
        }
    }
}

/// Sink for reconciliation events
#[async_trait]
pub trait EventRecorder: Send + Sync + fmt::Debug {
    async fn event(&self, object: &ObjectReference, kind: EventKind, reason: &str, message: String);
}

/// Publishes events to the API server
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl fmt::Debug for KubeEventRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeEventRecorder").finish_non_exhaustive()
    }
}

impl KubeEventRecorder {
    /// `controller` appears as the reporting component on every event
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn event(&self, object: &ObjectReference, kind: EventKind, reason: &str, message: String) {
        let event = Event {
            type_: kind.into(),
            reason: reason.to_string(),
            note: Some(message),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, object).await {
            warn!(
                reason,
                resource.kind = object.kind.as_deref().unwrap_or_default(),
                resource.name = object.name.as_deref().unwrap_or_default(),
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// An event captured by [`MemoryRecorder`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
    pub object_kind: String,
    pub object_name: String,
}

impl RecordedEvent {
    pub fn new(kind: EventKind, reason: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.to_string(),
            message: message.into(),
            object_kind: String::new(),
            object_name: String::new(),
        }
    }
}

/// Records events in emission order
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `(kind, reason)` pairs in emission order
    #[must_use]
    pub fn reasons(&self) -> Vec<(EventKind, String)> {
        self.events()
            .into_iter()
            .map(|e| (e.kind, e.reason))
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn event(&self, object: &ObjectReference, kind: EventKind, reason: &str, message: String) {
        let event = RecordedEvent {
            kind,
            reason: reason.to_string(),
            message,
            object_kind: object.kind.clone().unwrap_or_default(),
            object_name: object.name.clone().unwrap_or_default(),
        };
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
