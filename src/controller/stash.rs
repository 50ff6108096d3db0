//! # Stash
//!
//! Request-scoped scratch space shared by the sub-reconcilers of one
//! reconciliation. Keys are static and typed, so every value a chain can
//! publish is enumerable and a reader cannot ask for the wrong type.
//!
//! A stash is installed on the [`Context`](crate::controller::reconciler::Context)
//! at the start of each reconcile call and dropped at its end. Writing to or
//! reading from a context without an installed stash is an error.

use crate::crd::Stream;
use crate::provisioner::StreamAddress;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StashError {
    #[error("no stash installed on the reconciliation context (key {0:?})")]
    NotInstalled(&'static str),
    #[error("stashed value for key {0:?} has an unexpected type")]
    TypeMismatch(&'static str),
    #[error("stash lock poisoned")]
    Poisoned,
}

/// Typed, statically declared stash key
pub struct StashKey<T> {
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> StashKey<T> {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _value: PhantomData,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> fmt::Debug for StashKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StashKey").field(&self.name).finish()
    }
}

/// Resolved image repository for the resource being reconciled
pub static TARGET_IMAGE: StashKey<String> = StashKey::new("target-image");

/// Name of the build cache volume claim, if one is in use
pub static BUILD_CACHE_NAME: StashKey<String> = StashKey::new("build-cache-name");

/// Where the provisioner placed the stream being reconciled
pub static STREAM_ADDRESS: StashKey<StreamAddress> = StashKey::new("stream-address");

/// Sidecar image bridging a processor to its streams
pub static PROCESSOR_IMAGE: StashKey<String> = StashKey::new("processor-image");

/// Input streams of the processor, in declaration order
pub static INPUT_STREAMS: StashKey<Vec<Stream>> = StashKey::new("input-streams");

/// Output streams of the processor, in declaration order
pub static OUTPUT_STREAMS: StashKey<Vec<Stream>> = StashKey::new("output-streams");

/// One reconciliation's stashed values
#[derive(Default)]
pub struct Stash {
    values: Mutex<HashMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl fmt::Debug for Stash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&'static str> = self
            .values
            .lock()
            .map(|values| values.keys().copied().collect())
            .unwrap_or_default();
        f.debug_struct("Stash").field("keys", &keys).finish()
    }
}

impl Stash {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any earlier one under the same key
    pub fn store<T: Any + Send + Sync>(&self, key: &StashKey<T>, value: T) -> Result<(), StashError> {
        let mut values = self.values.lock().map_err(|_poisoned| StashError::Poisoned)?;
        values.insert(key.name, Box::new(value));
        Ok(())
    }

    /// Clone out a value; `Ok(None)` when nothing has been stored yet
    pub fn retrieve<T: Any + Clone + Send + Sync>(
        &self,
        key: &StashKey<T>,
    ) -> Result<Option<T>, StashError> {
        let values = self.values.lock().map_err(|_poisoned| StashError::Poisoned)?;
        match values.get(key.name) {
            None => Ok(None),
            Some(value) => value
                .downcast_ref::<T>()
                .cloned()
                .map(Some)
                .ok_or(StashError::TypeMismatch(key.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_retrieve() {
        let stash = Stash::new();
        assert_eq!(stash.retrieve(&TARGET_IMAGE).unwrap(), None);

        stash
            .store(&TARGET_IMAGE, "registry.example.com/square".to_string())
            .unwrap();
        assert_eq!(
            stash.retrieve(&TARGET_IMAGE).unwrap().as_deref(),
            Some("registry.example.com/square")
        );
        assert_eq!(stash.retrieve(&BUILD_CACHE_NAME).unwrap(), None);
    }

    #[test]
    fn test_later_store_replaces_value() {
        let stash = Stash::new();
        stash.store(&BUILD_CACHE_NAME, "a".to_string()).unwrap();
        stash.store(&BUILD_CACHE_NAME, "b".to_string()).unwrap();
        assert_eq!(stash.retrieve(&BUILD_CACHE_NAME).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_keys_sharing_a_name_must_agree_on_type() {
        static AS_STRING: StashKey<String> = StashKey::new("shared");
        static AS_NUMBER: StashKey<u32> = StashKey::new("shared");

        let stash = Stash::new();
        stash.store(&AS_STRING, "value".to_string()).unwrap();
        assert_eq!(
            stash.retrieve(&AS_NUMBER).unwrap_err(),
            StashError::TypeMismatch("shared")
        );
    }
}
