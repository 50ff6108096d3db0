//! riff System Library
//!
//! Reconcilers for the riff build and runtime resources, and the generic
//! reconciliation engine they are built on.
//!
//! ## Quick Start
//!
//! ```rust
//! use riff_system::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod config;
pub mod constants;
pub mod controller;
pub mod controllers;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod provisioner;
pub mod registry;
pub mod runtime;
