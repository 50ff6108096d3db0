//! # References
//!
//! Pointers from a parent's status to the children it manages.

use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to an object in the same namespace
///
/// `api_group` is `None` for the core group.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypedLocalObjectReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

impl TypedLocalObjectReference {
    /// Reference by group, kind and name; `None` when the name is empty
    #[must_use]
    pub fn new(group: &str, kind: &str, name: &str) -> Option<Self> {
        if name.is_empty() {
            return None;
        }
        Some(Self {
            api_group: (!group.is_empty()).then(|| group.to_string()),
            kind: kind.to_string(),
            name: name.to_string(),
        })
    }

    /// Reference to a typed object; `None` when the object has no name yet
    #[must_use]
    pub fn for_object<K: Resource<DynamicType = ()>>(obj: &K) -> Option<Self> {
        let name = obj.meta().name.as_deref()?;
        Self::new(&K::group(&()), &K::kind(&()), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use kube::api::ObjectMeta;

    #[test]
    fn test_core_group_is_omitted() {
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("square-build-cache".to_string()),
                ..ObjectMeta::default()
            },
            ..PersistentVolumeClaim::default()
        };
        let reference = TypedLocalObjectReference::for_object(&pvc).unwrap();
        assert_eq!(reference.api_group, None);
        assert_eq!(reference.kind, "PersistentVolumeClaim");
        assert_eq!(reference.name, "square-build-cache");
    }

    #[test]
    fn test_named_group_is_kept() {
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some("square-deployer-001".to_string()),
                ..ObjectMeta::default()
            },
            ..Deployment::default()
        };
        let reference = TypedLocalObjectReference::for_object(&deployment).unwrap();
        assert_eq!(reference.api_group.as_deref(), Some("apps"));
        assert_eq!(reference.kind, "Deployment");
    }

    #[test]
    fn test_empty_name_yields_none() {
        assert!(TypedLocalObjectReference::new("", "PersistentVolumeClaim", "").is_none());
        assert!(TypedLocalObjectReference::for_object(&PersistentVolumeClaim::default()).is_none());
    }
}
