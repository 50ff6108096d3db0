//! # Prelude
//!
//! Re-exports commonly used types and traits.
//!
//! ```rust
//! use riff_system::prelude::*;
//! ```

// CRD types
pub use crate::crd::*;

// Reconciliation engine
pub use crate::controller::client::{Client, Object};
pub use crate::controller::conditions::{ConditionManager, ConditionSet, ConditionSetError};
pub use crate::controller::reconciler::{
    BackoffState, ChildManager, ChildOutcome, ChildReconciler, Context, Parent, ParentReconciler, ReconcileResult,
    Reconciler, ReconcilerError, SubReconciler,
};
pub use crate::controller::stash::{Stash, StashKey};
pub use crate::controller::tracker::{NamespacedName, TrackedKey, Tracker};

// Config types
pub use crate::config::{ControllerConfig, ServerConfig, SharedControllerConfig, SharedServerConfig};
