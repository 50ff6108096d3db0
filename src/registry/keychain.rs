//! Registry credentials from Kubernetes Secrets
//!
//! Only `kubernetes.io/basic-auth` Secrets annotated with the registry they
//! authenticate against are considered. A registry with no matching Secret
//! is accessed anonymously.

use crate::registry::reference::normalize_registry;
use k8s_openapi::api::core::v1::Secret;
use std::fmt;
use thiserror::Error;

/// Annotation naming the registry a basic-auth Secret is for
pub const DOCKER_REGISTRY_ANNOTATION: &str = "build.pivotal.io/docker";

const BASIC_AUTH_TYPE: &str = "kubernetes.io/basic-auth";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeychainError {
    #[error("secret {secret:?} for registry {registry:?} has no {field}")]
    MissingField {
        secret: String,
        registry: String,
        field: &'static str,
    },
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Anonymous,
    Basic { username: String, password: String },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Clone)]
struct Entry {
    secret: String,
    registry: String,
    username: Option<String>,
    password: Option<String>,
}

/// Credentials indexed by registry
#[derive(Clone, Default)]
pub struct Keychain {
    entries: Vec<Entry>,
}

impl fmt::Debug for Keychain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registries: Vec<&str> = self.entries.iter().map(|e| e.registry.as_str()).collect();
        f.debug_struct("Keychain").field("registries", &registries).finish()
    }
}

impl Keychain {
    /// Anonymous access everywhere
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_secrets<'a>(secrets: impl IntoIterator<Item = &'a Secret>) -> Self {
        let entries = secrets
            .into_iter()
            .filter(|s| s.type_.as_deref() == Some(BASIC_AUTH_TYPE))
            .filter_map(|secret| {
                let registry = secret.metadata.annotations.as_ref()?.get(DOCKER_REGISTRY_ANNOTATION)?;
                let field = |key: &str| {
                    secret
                        .data
                        .as_ref()
                        .and_then(|data| data.get(key))
                        .map(|value| String::from_utf8_lossy(&value.0).into_owned())
                };
                Some(Entry {
                    secret: secret.metadata.name.clone().unwrap_or_default(),
                    registry: normalize_registry(registry),
                    username: field("username"),
                    password: field("password"),
                })
            })
            .collect();
        Self { entries }
    }

    /// Credential for `registry`; the first matching Secret wins
    ///
    /// A matching Secret without a username or password is an error rather
    /// than a silent fall back to anonymous access.
    pub fn resolve(&self, registry: &str) -> Result<Credential, KeychainError> {
        let registry = normalize_registry(registry);
        let Some(entry) = self.entries.iter().find(|e| e.registry == registry) else {
            return Ok(Credential::Anonymous);
        };
        let missing = |field| KeychainError::MissingField {
            secret: entry.secret.clone(),
            registry: registry.clone(),
            field,
        };
        Ok(Credential::Basic {
            username: entry.username.clone().ok_or_else(|| missing("username"))?,
            password: entry.password.clone().ok_or_else(|| missing("password"))?,
        })
    }
}
