//! # Reconciler
//!
//! The generic reconciliation engine: a [`ParentReconciler`] per resource
//! kind runs an ordered chain of [`SubReconciler`]s, and
//! [`ChildReconciler`] manages one owned child kind as one link of that
//! chain.

pub mod child;
pub mod parent;
pub mod types;

pub use child::{labels_match, merge_labels, ChildManager, ChildOutcome, ChildReconciler};
pub use parent::{Parent, ParentReconciler, Reconciler, SubReconciler};
pub use types::{BackoffState, Context, ReconcileResult, ReconcilerError};
