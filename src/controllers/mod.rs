//! # Controllers
//!
//! Concrete reconcilers for each riff resource kind, assembled from the
//! generic engine in [`crate::controller::reconciler`].
//!
//! - `target_image`: image resolution shared by every build kind
//! - `build_cache`: build cache volume claim
//! - `build`: kpack Image delegation and the Function/Application chain
//! - `function`, `application`, `container`, `deployer`: one per kind
//! - `stream`, `processor`: streaming resources
//! - `credential`: registry credentials bound to the build ServiceAccount
//! - `builders`: riff ClusterBuilders published in the system namespace

pub mod application;
pub mod build;
pub mod build_cache;
pub mod builders;
pub mod container;
pub mod credential;
pub mod deployer;
pub mod function;
pub mod processor;
pub mod stream;
pub mod target_image;

#[cfg(test)]
pub(crate) mod test_support;
