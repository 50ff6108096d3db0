//! # Ownership
//!
//! Decides whether an object found in the cluster may be managed by the
//! current parent. An object is owned when it carries a controller owner
//! reference whose uid is the parent's. Anything else with the same name
//! belongs to someone else and is never written.
//!
//! Ownership is evaluated on every reconciliation; it can change between
//! runs.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;

/// How an existing object relates to a parent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// No object with the desired name exists
    Absent,
    /// The object is controlled by the parent
    Owned,
    /// The object exists but is controlled by someone else, or by no one
    NotOwned,
}

/// Classify a candidate child for `parent`
pub fn classify<P: Resource>(candidate: Option<&ObjectMeta>, parent: &P) -> Ownership {
    match candidate {
        None => Ownership::Absent,
        Some(meta) if is_controlled_by(meta, parent) => Ownership::Owned,
        Some(_) => Ownership::NotOwned,
    }
}

/// Whether `child` names `parent` as its controller
pub fn is_controlled_by<P: Resource>(child: &ObjectMeta, parent: &P) -> bool {
    let Some(uid) = parent.meta().uid.as_deref() else {
        return false;
    };
    child
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.controller == Some(true) && owner.uid == uid)
}

/// Controller owner reference pointing at `parent`
pub fn controller_ref<P: Resource<DynamicType = ()>>(parent: &P) -> Option<OwnerReference> {
    parent.controller_owner_ref(&())
}

/// Message recorded when a child name is taken by an object the parent does
/// not control
pub fn not_owned_message(child_kind: &str, child_name: &str, parent_kind: &str) -> String {
    format!("There is an existing {child_kind} {child_name:?} that the {parent_kind} does not own.")
}
