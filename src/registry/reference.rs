//! Image reference parsing
//!
//! `[registry/]repository[:tag][@digest]`. A first path component without
//! a `.` or `:` (and other than `localhost`) is part of the repository, and
//! the image lives on Docker Hub. Single-component Docker Hub repositories
//! are official images under `library/`.

use std::fmt;
use thiserror::Error;

/// Registry used when a reference names none
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("could not parse reference: {0:?}")]
    Invalid(String),
}

/// A parsed image reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    /// Tag or `algorithm:hex` digest
    pub reference: String,
}

impl ImageReference {
    pub fn parse(image: &str) -> Result<Self, ReferenceError> {
        let invalid = || ReferenceError::Invalid(image.to_string());
        if image.is_empty() || image.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        let (name, digest) = match image.split_once('@') {
            Some((name, digest)) if digest.contains(':') => (name, Some(digest)),
            Some(_) => return Err(invalid()),
            None => (image, None),
        };

        // A tag can only follow the last path separator; a colon before it
        // belongs to a registry port
        let (name, tag) = match name.rfind(':') {
            Some(i) if !name[i..].contains('/') => (&name[..i], Some(&name[i + 1..])),
            _ => (name, None),
        };
        if name.is_empty() || tag.is_some_and(str::is_empty) {
            return Err(invalid());
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if first.contains(['.', ':']) || first == "localhost" => {
                (normalize_registry(first), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };
        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid());
        }
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        let reference = digest.or(tag).unwrap_or(DEFAULT_TAG).to_string();
        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Fully qualified repository name, without tag or digest
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The repository pinned to `digest`
    #[must_use]
    pub fn with_digest(&self, digest: &str) -> String {
        format!("{}@{digest}", self.name())
    }

    /// Base URL of the registry API; plain HTTP for loopback registries
    #[must_use]
    pub fn registry_url(&self) -> String {
        let host = self.registry.split(':').next().unwrap_or_default();
        let scheme = if host == "localhost" || host.starts_with("127.") {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{}", self.registry)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reference.contains(':') {
            write!(f, "{}@{}", self.name(), self.reference)
        } else {
            write!(f, "{}:{}", self.name(), self.reference)
        }
    }
}

/// Registry host as credentials are matched against it
///
/// Drops any scheme and trailing slash; every Docker Hub alias becomes
/// [`DEFAULT_REGISTRY`].
#[must_use]
pub fn normalize_registry(registry: &str) -> String {
    let host = registry
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    match host {
        "docker.io" | "registry-1.docker.io" | "index.docker.io" => DEFAULT_REGISTRY.to_string(),
        other => other.to_string(),
    }
}
