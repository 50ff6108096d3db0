//! # Child Reconciler
//!
//! Keeps exactly one child object of a given kind in line with what the
//! parent wants, then reflects the child's state onto the parent's status.
//!
//! Children are found by the `<label key>=<parent name>` label and must be
//! controlled by the parent. A desired child whose name is already taken by
//! an object the parent does not control is left untouched and reported as
//! [`ChildOutcome::NotOwned`].

use crate::controller::client::Object;
use crate::controller::events::{reasons, EventKind};
use crate::controller::ownership::{classify, controller_ref, is_controlled_by, Ownership};
use crate::controller::reconciler::parent::{Parent, SubReconciler};
use crate::controller::reconciler::types::{Context, ReconcileResult, ReconcilerError};
use crate::controller::store::{Labels, StoreError};
use crate::crd::Reconcilable;
use crate::observability;
use async_trait::async_trait;
use kube::Resource;
use std::fmt::Debug;
use tracing::{debug, info, warn};

/// What the child reconciler found or did
#[derive(Clone, Debug, PartialEq)]
pub enum ChildOutcome<C> {
    /// The owned child as it now exists in the cluster
    Present(C),
    /// No child is wanted, and none exists
    Absent,
    /// The desired name is held by an object the parent does not control
    NotOwned { name: String },
}

/// Describes one kind of child owned by a parent kind
#[async_trait]
pub trait ChildManager: Send + Sync {
    type Parent: Reconcilable;
    type Child: Object + Debug;

    /// Label linking children to their parent
    fn label_key(&self) -> &'static str;

    /// The child the parent wants, or `None` when it wants no child
    ///
    /// Labels, namespace and the controller reference are added by the
    /// reconciler.
    async fn desired_child(
        &self,
        ctx: &Context,
        parent: &Parent<'_, Self::Parent>,
    ) -> Result<Option<Self::Child>, ReconcilerError>;

    fn reflect_child_status(&self, parent: &mut Parent<'_, Self::Parent>, child: &ChildOutcome<Self::Child>);

    /// Publish what was applied for later sub-reconcilers
    fn stash_child(&self, _ctx: &Context, _child: &ChildOutcome<Self::Child>) -> Result<(), ReconcilerError> {
        Ok(())
    }

    /// Whether the live child already matches the desired one
    fn semantic_equals(&self, desired: &Self::Child, actual: &Self::Child) -> bool;

    /// Copy the managed subset of `desired` onto `current`
    fn merge_before_update(&self, current: &mut Self::Child, desired: &Self::Child);

    /// Carry fields the server owns or will not let change from `current`
    /// into `desired`
    fn harmonize_immutable_fields(&self, _current: &Self::Child, _desired: &mut Self::Child) {}
}

/// [`SubReconciler`] driving a [`ChildManager`]
#[derive(Debug)]
pub struct ChildReconciler<M> {
    manager: M,
    name: &'static str,
}

impl<M: ChildManager> ChildReconciler<M> {
    pub fn new(name: &'static str, manager: M) -> Self {
        Self { manager, name }
    }

    async fn reconcile_child(
        &self,
        ctx: &Context,
        parent: &Parent<'_, M::Parent>,
    ) -> Result<ChildOutcome<M::Child>, ReconcilerError> {
        let child_kind = M::Child::kind(&()).into_owned();
        let labels = Labels::from([(self.manager.label_key().to_string(), parent.name().to_string())]);
        let mut owned: Vec<M::Child> = ctx
            .client
            .list::<M::Child>(parent.namespace(), &labels)
            .await?
            .into_iter()
            .filter(|c| is_controlled_by(c.meta(), parent.resource()))
            .collect();

        let mut actual = if owned.len() > 1 {
            // More than one owned child should never happen; start over.
            for extra in owned.drain(..) {
                self.delete(ctx, parent, &extra).await?;
            }
            None
        } else {
            owned.pop()
        };

        let Some(mut desired) = self.manager.desired_child(ctx, parent).await? else {
            if let Some(unwanted) = actual {
                info!(child.kind = %child_kind, child.name = unwanted.meta().name.as_deref().unwrap_or_default(), "Deleting unwanted child");
                self.delete(ctx, parent, &unwanted).await?;
            }
            return Ok(ChildOutcome::Absent);
        };
        self.claim(parent, &mut desired, &labels);

        if actual.is_none() {
            if let Some(name) = desired.meta().name.clone().filter(|n| !n.is_empty()) {
                let existing = ctx.client.get_opt::<M::Child>(parent.namespace(), &name).await?;
                match classify(existing.as_ref().map(Resource::meta), parent.resource()) {
                    Ownership::Absent => {}
                    Ownership::Owned => actual = existing,
                    Ownership::NotOwned => {
                        info!(child.kind = %child_kind, child.name = %name, "Child name is held by an object the parent does not own");
                        return Ok(ChildOutcome::NotOwned { name });
                    }
                }
            }
        }

        let Some(actual) = actual else {
            return self.create(ctx, parent, desired).await;
        };

        self.manager.harmonize_immutable_fields(&actual, &mut desired);
        if self.manager.semantic_equals(&desired, &actual) {
            debug!(child.kind = %child_kind, "Child is up to date");
            return Ok(ChildOutcome::Present(actual));
        }

        let mut current = actual.clone();
        self.manager.merge_before_update(&mut current, &desired);
        let name = current.meta().name.clone().unwrap_or_default();
        info!(child.kind = %child_kind, child.name = %name, "Updating child");
        match ctx.client.update(&current).await {
            Ok(updated) => {
                observability::metrics::increment_child_operations("update", &child_kind);
                ctx.event(
                    &parent.object_ref(),
                    EventKind::Normal,
                    reasons::UPDATED,
                    format!("Updated {child_kind} {name:?}"),
                )
                .await;
                Ok(ChildOutcome::Present(updated))
            }
            Err(e) => {
                warn!(child.kind = %child_kind, child.name = %name, error = %e, "Unable to update child");
                ctx.event(
                    &parent.object_ref(),
                    EventKind::Warning,
                    reasons::UPDATE_FAILED,
                    format!("Failed to update {child_kind} {name:?}: {e}"),
                )
                .await;
                Err(e.into())
            }
        }
    }

    /// Label the child, place it beside the parent and make the parent its
    /// controller
    fn claim(&self, parent: &Parent<'_, M::Parent>, desired: &mut M::Child, labels: &Labels) {
        let owner = controller_ref(parent.resource());
        let meta = desired.meta_mut();
        meta.namespace = Some(parent.namespace().to_string());
        meta.labels
            .get_or_insert_with(Default::default)
            .extend(labels.clone());
        let mut owners: Vec<_> = meta
            .owner_references
            .take()
            .unwrap_or_default()
            .into_iter()
            .filter(|o| o.controller != Some(true))
            .collect();
        owners.extend(owner);
        meta.owner_references = Some(owners);
    }

    async fn create(
        &self,
        ctx: &Context,
        parent: &Parent<'_, M::Parent>,
        desired: M::Child,
    ) -> Result<ChildOutcome<M::Child>, ReconcilerError> {
        let child_kind = M::Child::kind(&()).into_owned();
        let display_name = desired
            .meta()
            .name
            .clone()
            .or_else(|| desired.meta().generate_name.clone())
            .unwrap_or_default();
        info!(child.kind = %child_kind, child.name = %display_name, "Creating child");
        match ctx.client.create(&desired).await {
            Ok(created) => {
                let name = created.meta().name.clone().unwrap_or_default();
                observability::metrics::increment_child_operations("create", &child_kind);
                ctx.event(
                    &parent.object_ref(),
                    EventKind::Normal,
                    reasons::CREATED,
                    format!("Created {child_kind} {name:?}"),
                )
                .await;
                Ok(ChildOutcome::Present(created))
            }
            Err(e) if e.is_already_exists() => self.already_exists(ctx, parent, &display_name, e).await,
            Err(e) => {
                warn!(child.kind = %child_kind, child.name = %display_name, error = %e, "Unable to create child");
                ctx.event(
                    &parent.object_ref(),
                    EventKind::Warning,
                    reasons::CREATION_FAILED,
                    format!("Failed to create {child_kind} {display_name:?}: {e}"),
                )
                .await;
                Err(e.into())
            }
        }
    }

    /// Someone else created the name between our read and our create
    ///
    /// If it turns out to be ours, fail and retry; otherwise it is NotOwned.
    async fn already_exists(
        &self,
        ctx: &Context,
        parent: &Parent<'_, M::Parent>,
        name: &str,
        error: StoreError,
    ) -> Result<ChildOutcome<M::Child>, ReconcilerError> {
        let conflicted = ctx.client.get_opt::<M::Child>(parent.namespace(), name).await?;
        match classify(conflicted.as_ref().map(Resource::meta), parent.resource()) {
            Ownership::NotOwned => Ok(ChildOutcome::NotOwned {
                name: name.to_string(),
            }),
            Ownership::Owned | Ownership::Absent => Err(error.into()),
        }
    }

    async fn delete(
        &self,
        ctx: &Context,
        parent: &Parent<'_, M::Parent>,
        child: &M::Child,
    ) -> Result<(), ReconcilerError> {
        let child_kind = M::Child::kind(&()).into_owned();
        let name = child.meta().name.clone().unwrap_or_default();
        match ctx.client.delete::<M::Child>(parent.namespace(), &name).await {
            Ok(()) => {
                observability::metrics::increment_child_operations("delete", &child_kind);
                ctx.event(
                    &parent.object_ref(),
                    EventKind::Normal,
                    reasons::DELETED,
                    format!("Deleted {child_kind} {name:?}"),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                warn!(child.kind = %child_kind, child.name = %name, error = %e, "Unable to delete child");
                ctx.event(
                    &parent.object_ref(),
                    EventKind::Warning,
                    reasons::DELETE_FAILED,
                    format!("Failed to delete {child_kind} {name:?}: {e}"),
                )
                .await;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl<M: ChildManager> SubReconciler<M::Parent> for ChildReconciler<M> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn reconcile(
        &self,
        ctx: &Context,
        parent: &mut Parent<'_, M::Parent>,
    ) -> Result<ReconcileResult, ReconcilerError> {
        let outcome = self.reconcile_child(ctx, parent).await?;
        self.manager.reflect_child_status(parent, &outcome);
        self.manager.stash_child(ctx, &outcome)?;
        Ok(ReconcileResult::done())
    }
}

/// Copy the labels of `desired` over those of `current`, keeping extras
pub fn merge_labels<K: Resource>(current: &mut K, desired: &K) {
    if let Some(labels) = &desired.meta().labels {
        current
            .meta_mut()
            .labels
            .get_or_insert_with(Default::default)
            .extend(labels.clone());
    }
}

/// Whether every label on `desired` is present on `actual` with the same value
pub fn labels_match<K: Resource>(desired: &K, actual: &K) -> bool {
    let have = actual.meta().labels.clone().unwrap_or_default();
    desired
        .meta()
        .labels
        .iter()
        .flatten()
        .all(|(k, v)| have.get(k) == Some(v))
}
