//! # Tracker
//!
//! Records which resources depend on objects they read but do not own, so a
//! change to the tracked object can re-enqueue every interested resource.
//!
//! Entries are leased. Each reconciliation that still depends on an object
//! refreshes the lease; a dependency that stops being refreshed disappears on
//! its own. Lookups ignore expired entries, so the background sweep only
//! reclaims memory.
//!
//! State is split across shards keyed by the tracked object's hash; each
//! shard holds its own lock, so unrelated keys never contend.

use kube::Resource;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const SHARDS: usize = 16;

/// Group, kind, namespace and name of a tracked object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackedKey {
    /// API group; empty for the core group
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl TrackedKey {
    /// Key for an object of kind `K`
    pub fn new<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> Self {
        Self {
            group: K::group(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Key for an observed object
    pub fn for_object<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        Self::new::<K>(
            obj.meta().namespace.as_deref().unwrap_or_default(),
            obj.meta().name.as_deref().unwrap_or_default(),
        )
    }
}

impl fmt::Display for TrackedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
        } else {
            write!(f, "{}.{} {}/{}", self.kind, self.group, self.namespace, self.name)
        }
    }
}

/// Namespace and name of a tracking resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn for_object<K: Resource>(obj: &K) -> Self {
        Self::new(
            obj.meta().namespace.clone().unwrap_or_default(),
            obj.meta().name.clone().unwrap_or_default(),
        )
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Monotonic time source
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock advanced by hand, for exercising lease expiry
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type Shard = HashMap<TrackedKey, HashMap<NamespacedName, Instant>>;

/// Dependency registry shared by every reconcile worker
pub struct Tracker {
    shards: Vec<Mutex<Shard>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("shards", &self.shards.len())
            .field("clock", &self.clock)
            .finish()
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(Shard::new())).collect(),
            clock,
        }
    }

    /// Record that `tracker` depends on `key` for the next `lease`
    ///
    /// Repeated calls for the same pair refresh the lease in place.
    pub fn track(&self, key: &TrackedKey, tracker: &NamespacedName, lease: Duration) {
        let expires_at = self.clock.now() + lease;
        let mut shard = self.shard(key);
        shard
            .entry(key.clone())
            .or_default()
            .insert(tracker.clone(), expires_at);
        trace!(tracked = %key, tracker = %tracker, lease_secs = lease.as_secs(), "Tracking dependency");
    }

    /// Every resource whose lease on `key` has not expired, sorted
    ///
    /// Expired entries found along the way are dropped.
    pub fn lookup(&self, key: &TrackedKey) -> Vec<NamespacedName> {
        let now = self.clock.now();
        let mut shard = self.shard(key);
        let Some(trackers) = shard.get_mut(key) else {
            return Vec::new();
        };
        trackers.retain(|_, expires_at| now < *expires_at);
        let mut found: Vec<NamespacedName> = trackers.keys().cloned().collect();
        if trackers.is_empty() {
            shard.remove(key);
        }
        found.sort();
        debug!(tracked = %key, trackers = found.len(), "Tracker lookup");
        found
    }

    /// Drop every expired entry; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            shard.retain(|_, trackers| {
                let before = trackers.len();
                trackers.retain(|_, expires_at| now < *expires_at);
                removed += before - trackers.len();
                !trackers.is_empty()
            });
        }
        removed
    }

    /// Number of live and expired (not yet swept) entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .map(HashMap::len)
                    .sum::<usize>()
            })
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, key: &TrackedKey) -> MutexGuard<'_, Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = usize::try_from(hasher.finish() % SHARDS as u64).unwrap_or_default();
        // A panicking writer cannot leave a half-updated entry behind, so the
        // data is still usable after poisoning.
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Periodically reclaim expired tracker entries until the task is aborted
pub async fn run_sweeper(tracker: Arc<Tracker>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let removed = tracker.sweep();
        if removed > 0 {
            debug!(removed, "Swept expired tracker entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    const LEASE: Duration = Duration::from_secs(60);

    fn tracker() -> (Tracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (Tracker::with_clock(clock.clone()), clock)
    }

    fn build_config(namespace: &str) -> TrackedKey {
        TrackedKey::new::<ConfigMap>(namespace, "riff-build")
    }

    #[test]
    fn test_key_for_core_kind_has_empty_group() {
        let key = build_config("default");
        assert_eq!(key.group, "");
        assert_eq!(key.kind, "ConfigMap");
        assert_eq!(key.to_string(), "ConfigMap default/riff-build");
    }

    #[test]
    fn test_lookup_returns_sorted_trackers() {
        let (tracker, _clock) = tracker();
        let key = build_config("default");
        tracker.track(&key, &NamespacedName::new("default", "uppercase"), LEASE);
        tracker.track(&key, &NamespacedName::new("default", "square"), LEASE);

        assert_eq!(
            tracker.lookup(&key),
            vec![
                NamespacedName::new("default", "square"),
                NamespacedName::new("default", "uppercase"),
            ]
        );
        assert!(tracker.lookup(&build_config("other")).is_empty());
    }

    #[test]
    fn test_lease_boundary() {
        let (tracker, clock) = tracker();
        let key = build_config("default");
        let square = NamespacedName::new("default", "square");
        tracker.track(&key, &square, LEASE);

        clock.advance(LEASE - Duration::from_millis(1));
        assert_eq!(tracker.lookup(&key), vec![square.clone()]);

        clock.advance(Duration::from_millis(1));
        assert!(tracker.lookup(&key).is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_refresh_extends_lease_without_duplicates() {
        let (tracker, clock) = tracker();
        let key = build_config("default");
        let square = NamespacedName::new("default", "square");
        tracker.track(&key, &square, LEASE);
        clock.advance(Duration::from_secs(45));
        tracker.track(&key, &square, LEASE);
        clock.advance(Duration::from_secs(45));

        assert_eq!(tracker.lookup(&key), vec![square]);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_leases_are_per_call() {
        let (tracker, clock) = tracker();
        let key = build_config("default");
        tracker.track(&key, &NamespacedName::new("default", "short"), Duration::from_secs(5));
        tracker.track(&key, &NamespacedName::new("default", "long"), LEASE);

        clock.advance(Duration::from_secs(10));
        assert_eq!(tracker.lookup(&key), vec![NamespacedName::new("default", "long")]);
    }

    #[test]
    fn test_sweep_reclaims_expired_entries() {
        let (tracker, clock) = tracker();
        for ns in ["a", "b", "c"] {
            tracker.track(&build_config(ns), &NamespacedName::new(ns, "square"), LEASE);
        }
        tracker.track(
            &build_config("d"),
            &NamespacedName::new("d", "square"),
            LEASE * 2,
        );
        clock.advance(LEASE);

        assert_eq!(tracker.sweep(), 3);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_concurrent_track_and_lookup() {
        let tracker = Arc::new(Tracker::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    let key = build_config("default");
                    for j in 0..100 {
                        tracker.track(&key, &NamespacedName::new("default", format!("r{i}-{j}")), LEASE);
                        let _ = tracker.lookup(&key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.lookup(&build_config("default")).len(), 800);
    }
}
