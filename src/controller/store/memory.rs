//! # In-Memory Store
//!
//! A store double for reconciler tests. Every call is recorded as an
//! [`Action`] and passed through an ordered chain of [`Reactor`]s; the first
//! reactor returning an error short-circuits the call. Reactors observe the
//! canonical action only and cannot alter stored objects.
//!
//! Semantics mirror the API server where reconcilers can observe them:
//! generated names, uid and resourceVersion assignment, optimistic
//! concurrency on writes that carry a resourceVersion, generation bumps on
//! spec change, and a status path that never touches spec.

use super::{Labels, ObjectStore, StoreError};
use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject, TypeMeta};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

impl Verb {
    /// Whether the verb writes to the store
    #[must_use]
    pub fn is_write(self) -> bool {
        !matches!(self, Self::Get | Self::List)
    }
}

/// A store call as seen by reactors and test assertions
#[derive(Clone, Debug)]
pub struct Action {
    pub verb: Verb,
    pub group: String,
    pub kind: String,
    pub namespace: String,
    /// Object name; the generateName prefix for unnamed creates
    pub name: String,
    /// Object carried by create and update calls
    pub object: Option<DynamicObject>,
}

impl Action {
    #[must_use]
    pub fn matches(&self, verb: Verb, kind: &str) -> bool {
        self.verb == verb && self.kind == kind
    }
}

/// Interceptor consulted before every store call
pub type Reactor = Box<dyn Fn(&Action) -> Option<StoreError> + Send + Sync>;

type ObjectKey = (String, String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    actions: Vec<Action>,
    generated: u32,
    resource_version: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    reactors: Mutex<Vec<Reactor>>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryStore")
            .field("objects", &state.objects.len())
            .field("actions", &state.actions.len())
            .finish_non_exhaustive()
    }
}

fn key(resource: &ApiResource, namespace: &str, name: &str) -> ObjectKey {
    (
        resource.group.clone(),
        resource.kind.clone(),
        namespace.to_string(),
        name.to_string(),
    )
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a reactor to the end of the chain
    pub fn add_reactor<F>(&self, reactor: F)
    where
        F: Fn(&Action) -> Option<StoreError> + Send + Sync + 'static,
    {
        self.reactors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(reactor));
    }

    /// Fail every `verb` on `kind` with `error`
    pub fn fail_on(&self, verb: Verb, kind: &str, error: StoreError) {
        let kind = kind.to_string();
        self.add_reactor(move |action| action.matches(verb, &kind).then(|| error.clone()));
    }

    /// Insert an object as-is without recording an action
    ///
    /// Missing uid, resourceVersion and generation are filled in.
    pub fn seed(&self, resource: &ApiResource, mut object: DynamicObject) {
        let mut state = self.lock();
        state.resource_version += 1;
        let rv = state.resource_version;
        prepare_new(resource, &mut object, rv);
        let k = key(
            resource,
            object.metadata.namespace.as_deref().unwrap_or_default(),
            object.metadata.name.as_deref().unwrap_or_default(),
        );
        state.objects.insert(k, object);
    }

    /// Current stored copy without recording an action
    #[must_use]
    pub fn object(&self, resource: &ApiResource, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.lock().objects.get(&key(resource, namespace, name)).cloned()
    }

    /// Every stored object of a kind, without recording an action
    #[must_use]
    pub fn objects(&self, resource: &ApiResource) -> Vec<DynamicObject> {
        self.lock()
            .objects
            .iter()
            .filter(|((g, k, _, _), _)| *g == resource.group && *k == resource.kind)
            .map(|(_, o)| o.clone())
            .collect()
    }

    #[must_use]
    pub fn actions(&self) -> Vec<Action> {
        self.lock().actions.clone()
    }

    /// Recorded create, update, status and delete calls
    #[must_use]
    pub fn writes(&self) -> Vec<Action> {
        self.lock()
            .actions
            .iter()
            .filter(|a| a.verb.is_write())
            .cloned()
            .collect()
    }

    pub fn clear_actions(&self) {
        self.lock().actions.clear();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, action: Action) -> Result<(), StoreError> {
        self.lock().actions.push(action.clone());
        let reactors = self.reactors.lock().unwrap_or_else(PoisonError::into_inner);
        match reactors.iter().find_map(|reactor| reactor(&action)) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn action(
    verb: Verb,
    resource: &ApiResource,
    namespace: &str,
    name: &str,
    object: Option<&DynamicObject>,
) -> Action {
    Action {
        verb,
        group: resource.group.clone(),
        kind: resource.kind.clone(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        object: object.cloned(),
    }
}

fn prepare_new(resource: &ApiResource, object: &mut DynamicObject, rv: u64) {
    if object.types.is_none() {
        object.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
    }
    let meta = &mut object.metadata;
    if meta.uid.is_none() {
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
    }
    if meta.generation.is_none() {
        meta.generation = Some(1);
    }
    meta.resource_version = Some(rv.to_string());
}

fn check_version(stored: &DynamicObject, incoming: &DynamicObject, kind: &str, name: &str) -> Result<(), StoreError> {
    match &incoming.metadata.resource_version {
        Some(rv) if Some(rv) != stored.metadata.resource_version.as_ref() => {
            Err(StoreError::conflict(kind, name))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, StoreError> {
        self.record(action(Verb::Get, resource, namespace, name, None))?;
        self.lock()
            .objects
            .get(&key(resource, namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::not_found(&resource.kind, name))
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        labels: &Labels,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        self.record(action(Verb::List, resource, namespace, "", None))?;
        let state = self.lock();
        Ok(state
            .objects
            .iter()
            .filter(|((g, k, ns, _), _)| {
                *g == resource.group && *k == resource.kind && ns == namespace
            })
            .map(|(_, o)| o)
            .filter(|o| {
                let have = o.metadata.labels.clone().unwrap_or_default();
                labels.iter().all(|(k, v)| have.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn create(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let requested = object
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| object.metadata.generate_name.clone())
            .unwrap_or_default();
        self.record(action(Verb::Create, resource, &namespace, &requested, Some(object)))?;

        let mut state = self.lock();
        let mut created = object.clone();
        if created.metadata.name.as_deref().is_none_or(str::is_empty) {
            let Some(prefix) = created.metadata.generate_name.clone() else {
                return Err(StoreError::Invalid {
                    kind: resource.kind.clone(),
                    name: String::new(),
                    message: "name or generateName is required".to_string(),
                });
            };
            state.generated += 1;
            created.metadata.name = Some(format!("{prefix}{:03}", state.generated));
        }
        let name = created.metadata.name.clone().unwrap_or_default();
        let k = key(resource, &namespace, &name);
        if state.objects.contains_key(&k) {
            return Err(StoreError::already_exists(&resource.kind, &name));
        }
        state.resource_version += 1;
        let rv = state.resource_version;
        created.metadata.uid = None;
        created.metadata.generation = None;
        prepare_new(resource, &mut created, rv);
        state.objects.insert(k, created.clone());
        Ok(created)
    }

    async fn update(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let name = object.metadata.name.clone().unwrap_or_default();
        self.record(action(Verb::Update, resource, &namespace, &name, Some(object)))?;

        let mut state = self.lock();
        let k = key(resource, &namespace, &name);
        let stored = state
            .objects
            .get(&k)
            .cloned()
            .ok_or_else(|| StoreError::not_found(&resource.kind, &name))?;
        check_version(&stored, object, &resource.kind, &name)?;

        let mut updated = object.clone();
        match stored.data.get("status") {
            Some(status) => {
                updated.data["status"] = status.clone();
            }
            None => {
                if let Some(data) = updated.data.as_object_mut() {
                    data.remove("status");
                }
            }
        }
        let generation = stored.metadata.generation.unwrap_or(1);
        updated.metadata.generation = Some(if stored.data.get("spec") == updated.data.get("spec") {
            generation
        } else {
            generation + 1
        });
        updated.metadata.uid.clone_from(&stored.metadata.uid);
        updated.types = stored.types.clone();
        state.resource_version += 1;
        updated.metadata.resource_version = Some(state.resource_version.to_string());
        state.objects.insert(k, updated.clone());
        Ok(updated)
    }

    async fn update_status(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<Option<DynamicObject>, StoreError> {
        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let name = object.metadata.name.clone().unwrap_or_default();
        self.record(action(Verb::UpdateStatus, resource, &namespace, &name, Some(object)))?;

        let mut state = self.lock();
        let k = key(resource, &namespace, &name);
        let stored = state
            .objects
            .get(&k)
            .cloned()
            .ok_or_else(|| StoreError::not_found(&resource.kind, &name))?;
        // Compared before the version check, as the API server store does
        if stored.data.get("status") == object.data.get("status") {
            return Ok(None);
        }
        check_version(&stored, object, &resource.kind, &name)?;

        let mut updated = stored;
        match object.data.get("status") {
            Some(status) => {
                updated.data["status"] = status.clone();
            }
            None => {
                if let Some(data) = updated.data.as_object_mut() {
                    data.remove("status");
                }
            }
        }
        state.resource_version += 1;
        updated.metadata.resource_version = Some(state.resource_version.to_string());
        state.objects.insert(k, updated.clone());
        Ok(Some(updated))
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        self.record(action(Verb::Delete, resource, namespace, name, None))?;
        self.lock()
            .objects
            .remove(&key(resource, namespace, name))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(&resource.kind, name))
    }
}
