//! # Status
//!
//! The status fields shared by every riff resource, composed into each
//! resource-specific status rather than inherited.

use crate::crd::condition::{Condition, ConditionStatus, CONDITION_READY};
use kube::Resource;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Observed generation and conditions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Generation of the spec last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Status {
    #[must_use]
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Capability shared by every resource status
///
/// Implementors only expose their composed [`Status`]; the accessors are
/// provided.
pub trait ResourceStatus {
    fn common(&self) -> &Status;

    fn common_mut(&mut self) -> &mut Status;

    fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.common().get_condition(type_)
    }

    fn observed_generation(&self) -> Option<i64> {
        self.common().observed_generation
    }

    fn is_ready(&self) -> bool {
        self.get_condition(CONDITION_READY)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}

impl ResourceStatus for Status {
    fn common(&self) -> &Status {
        self
    }

    fn common_mut(&mut self) -> &mut Status {
        self
    }
}

/// A custom resource driven by a parent reconciler
pub trait Reconcilable:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    type Status: ResourceStatus
        + Clone
        + Debug
        + Default
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync;

    fn status(&self) -> Option<&Self::Status>;

    /// Mutable status, created empty when absent
    fn status_mut(&mut self) -> &mut Self::Status;

    /// Fill in defaulted spec fields. Applied in memory only; the spec is
    /// never written back.
    fn apply_defaults(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ready_requires_true_ready_condition() {
        let mut status = Status::default();
        assert!(!status.is_ready());

        status
            .conditions
            .push(Condition::new(CONDITION_READY, ConditionStatus::Unknown));
        assert!(!status.is_ready());

        status.conditions[0].status = ConditionStatus::True;
        assert!(status.is_ready());
    }

    #[test]
    fn test_empty_status_serializes_to_empty_object() {
        let value = serde_json::to_value(Status::default()).unwrap();
        assert_eq!(value, serde_json::json!({}));
    }
}
