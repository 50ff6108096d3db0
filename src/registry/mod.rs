//! # Registry
//!
//! Resolves a container image tag to the digest it currently points at,
//! authenticating with credentials taken from the build ServiceAccount.
//!
//! - `reference`: image reference parsing and registry normalization
//! - `keychain`: registry credentials from basic-auth Secrets
//! - `client`: Docker Registry HTTP API v2 digest lookups

mod client;
mod keychain;
mod reference;

pub use client::{DigestResolver, MemoryRegistry, RegistryClient, RegistryError};
pub use keychain::{Credential, Keychain, KeychainError, DOCKER_REGISTRY_ANNOTATION};
pub use reference::{normalize_registry, ImageReference, ReferenceError, DEFAULT_REGISTRY};
