//! # Object Store
//!
//! The versioned resource store reconcilers read and write. Objects cross
//! this boundary untyped ([`DynamicObject`] plus its [`ApiResource`]); the
//! typed facade lives in [`crate::controller::client`].
//!
//! - [`KubeStore`]: the Kubernetes API server
//! - [`MemoryStore`]: an in-memory store with a recorded action log and an
//!   ordered reactor chain, used by tests

mod kubernetes;
mod memory;

pub use kubernetes::{merge_patch_diff, KubeStore};
pub use memory::{Action, MemoryStore, Reactor, Verb};

use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("conflict writing {kind} {name:?}: the object has been modified")]
    Conflict { kind: String, name: String },

    #[error("invalid {kind} {name:?}: {message}")]
    Invalid {
        kind: String,
        name: String,
        message: String,
    },

    #[error("API error {code}: {message}")]
    Api { code: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(kind: &str, name: &str) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn conflict(kind: &str, name: &str) -> Self {
        Self::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn already_exists(kind: &str, name: &str) -> Self {
        Self::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    /// Classify an API server error for the object `kind`/`name`
    ///
    /// 409 means AlreadyExists on create and Conflict on every other write,
    /// so the caller says which one it was doing.
    pub fn from_kube(error: kube::Error, kind: &str, name: &str, creating: bool) -> Self {
        match error {
            kube::Error::Api(ae) => match ae.code {
                404 => Self::not_found(kind, name),
                409 if creating => Self::already_exists(kind, name),
                409 => Self::conflict(kind, name),
                422 => Self::Invalid {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    message: ae.message.clone(),
                },
                code => Self::Api {
                    code,
                    message: ae.message.clone(),
                },
            },
            kube::Error::SerdeError(e) => Self::Serialization(e.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Label selector as exact key/value matches
pub type Labels = BTreeMap<String, String>;

/// Get/List/Create/Update/Delete over namespaced objects, with a separate
/// status write path that never alters spec
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, StoreError>;

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        labels: &Labels,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    /// Create an object. An empty name with `generateName` set gets a
    /// generated name.
    async fn create(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    /// Replace an object's metadata and spec; status is left alone
    async fn update(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    /// Write an object's status subresource; spec is left alone
    ///
    /// `None` means the stored status already matched and nothing was
    /// written.
    async fn update_status(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<Option<DynamicObject>, StoreError>;

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError>;
}

/// `key=value,key=value`, sorted by key
#[must_use]
pub fn selector_string(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
