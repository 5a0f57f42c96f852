//! Observation Registry
//!
//! Bidirectional index of live observations: observer → observations and
//! observee → observations. The registry holds the strong references that
//! keep registered observations alive.
//!
//! Lookups take a read lock; insert and remove take the write lock. Values
//! removed from the index are dropped only after the lock is released,
//! because dropping an observation can destroy participants whose disposers
//! re-enter the registry.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{trace, warn};

use super::{Observation, ObservationId, ObservationKind};
use crate::domain::events::ObservationEvent;
use crate::domain::lifeline::ObjectId;
use crate::domain::ports::EventPublisher;

static GLOBAL: Lazy<Arc<Registry>> = Lazy::new(|| Arc::new(Registry::new()));

/// Type-erased view of a registered observation.
pub trait RegistryEntry: Send + Sync {
    fn id(&self) -> ObservationId;

    fn kind_name(&self) -> &'static str;

    fn observer_id(&self) -> Option<ObjectId>;

    fn object_id(&self) -> Option<ObjectId>;

    fn is_registered(&self) -> bool;

    fn remove(&self);

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

type Entry = Arc<dyn RegistryEntry>;
type Bucket = BTreeMap<ObservationId, Entry>;

#[derive(Default)]
struct Index {
    by_observer: HashMap<ObjectId, Bucket>,
    by_object: HashMap<ObjectId, Bucket>,
    ids: HashSet<ObservationId>,
}

impl Index {
    fn detach(map: &mut HashMap<ObjectId, Bucket>, key: ObjectId, id: ObservationId) -> Option<Entry> {
        let bucket = map.get_mut(&key)?;
        let removed = bucket.remove(&id);
        if bucket.is_empty() {
            map.remove(&key);
        }
        removed
    }
}

/// Process-wide (or test-local) index of live observations.
pub struct Registry {
    index: RwLock<Index>,
    publisher: RwLock<Option<Arc<dyn EventPublisher>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(Index::default()),
            publisher: RwLock::new(None),
        }
    }

    pub fn with_publisher(publisher: Arc<dyn EventPublisher>) -> Self {
        let registry = Self::new();
        registry.set_publisher(publisher);
        registry
    }

    /// The registry observations use unless built with their own.
    pub fn global() -> Arc<Registry> {
        GLOBAL.clone()
    }

    pub fn set_publisher(&self, publisher: Arc<dyn EventPublisher>) {
        *self.publisher.write() = Some(publisher);
    }

    pub(crate) fn publish(&self, event: ObservationEvent) {
        let publisher = self.publisher.read().clone();
        match publisher {
            Some(publisher) => {
                if let Err(e) = publisher.publish(event) {
                    warn!(error = %e, "Failed to publish lifecycle event");
                }
            }
            None => trace!(event = event.event_type(), "Lifecycle event (no publisher)"),
        }
    }

    pub(crate) fn insert(&self, entry: Entry) {
        let id = entry.id();
        let mut index = self.index.write();
        if let Some(observer) = entry.observer_id() {
            index
                .by_observer
                .entry(observer)
                .or_default()
                .insert(id, entry.clone());
        }
        if let Some(object) = entry.object_id() {
            index.by_object.entry(object).or_default().insert(id, entry.clone());
        }
        index.ids.insert(id);
    }

    /// Drop the index entries of one observation and hand back the strong
    /// reference so the caller can release it outside the lock.
    pub(crate) fn remove(
        &self,
        id: ObservationId,
        observer: Option<ObjectId>,
        object: Option<ObjectId>,
    ) -> Vec<Entry> {
        let mut index = self.index.write();
        let mut released = Vec::with_capacity(2);
        if let Some(observer) = observer {
            released.extend(Index::detach(&mut index.by_observer, observer, id));
        }
        if let Some(object) = object {
            released.extend(Index::detach(&mut index.by_object, object, id));
        }
        index.ids.remove(&id);
        released
    }

    /// First live observation matching every given criterion and `predicate`.
    ///
    /// An absent criterion matches anything; with both absent nothing matches.
    pub fn find(
        &self,
        observer: Option<ObjectId>,
        object: Option<ObjectId>,
        predicate: impl Fn(&dyn RegistryEntry) -> bool,
    ) -> Option<Entry> {
        self.matching(observer, object)
            .into_iter()
            .find(|entry| predicate(entry.as_ref()))
    }

    /// Like [`Registry::find`], restricted to observations of kind `K`.
    pub fn find_typed<K: ObservationKind>(
        &self,
        observer: Option<ObjectId>,
        object: Option<ObjectId>,
        predicate: impl Fn(&Observation<K>) -> bool,
    ) -> Option<Arc<Observation<K>>> {
        let entry = self.find(observer, object, |entry| {
            entry
                .as_any()
                .downcast_ref::<Observation<K>>()
                .is_some_and(&predicate)
        })?;
        entry.into_any().downcast::<Observation<K>>().ok()
    }

    pub fn all_for_observer(&self, observer: ObjectId) -> Vec<Entry> {
        self.matching(Some(observer), None)
    }

    pub fn all_for_object(&self, object: ObjectId) -> Vec<Entry> {
        self.matching(None, Some(object))
    }

    /// Every live observation matching the given criteria.
    pub fn all_for(&self, observer: Option<ObjectId>, object: Option<ObjectId>) -> Vec<Entry> {
        self.matching(observer, object)
    }

    /// Remove every observation made by `observer`. Returns how many were removed.
    pub fn remove_all_for_observer(&self, observer: ObjectId) -> usize {
        let entries = self.all_for_observer(observer);
        for entry in &entries {
            entry.remove();
        }
        entries.len()
    }

    pub fn contains(&self, id: ObservationId) -> bool {
        self.index.read().ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.index.read().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matching(&self, observer: Option<ObjectId>, object: Option<ObjectId>) -> Vec<Entry> {
        let index = self.index.read();
        let bucket = match (observer, object) {
            (Some(observer), _) => index.by_observer.get(&observer),
            (None, Some(object)) => index.by_object.get(&object),
            (None, None) => return Vec::new(),
        };
        bucket
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(|entry| object.map_or(true, |object| entry.object_id() == Some(object)))
            .filter(|entry| entry.is_registered())
            .cloned()
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.read();
        f.debug_struct("Registry")
            .field("observations", &index.ids.len())
            .field("observers", &index.by_observer.len())
            .field("objects", &index.by_object.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lifeline::Lifecycle;
    use crate::observation::testing::{manual, ManualKind, Probe};

    #[test]
    fn test_find_with_wildcards() {
        let registry = Arc::new(Registry::new());
        let observer = Arc::new(Probe::default());
        let object = Arc::new(Probe::default());
        let other = Arc::new(Probe::default());

        let paired = manual()
            .observer(&observer)
            .object(&object)
            .registry(registry.clone())
            .callback(|_| {})
            .build()
            .unwrap();
        let anonymous = manual()
            .object(&other)
            .registry(registry.clone())
            .callback(|_| {})
            .build()
            .unwrap();

        let found = registry.find(Some(observer.object_id()), None, |_| true).unwrap();
        assert_eq!(found.id(), paired.id());

        let found = registry
            .find(Some(observer.object_id()), Some(object.object_id()), |_| true)
            .unwrap();
        assert_eq!(found.id(), paired.id());

        assert!(registry
            .find(Some(observer.object_id()), Some(other.object_id()), |_| true)
            .is_none());

        let found = registry.find(None, Some(other.object_id()), |_| true).unwrap();
        assert_eq!(found.id(), anonymous.id());

        assert!(registry.find(None, None, |_| true).is_none());
    }

    #[test]
    fn test_find_typed_downcasts() {
        let registry = Arc::new(Registry::new());
        let object = Arc::new(Probe::default());
        let obs = manual()
            .object(&object)
            .registry(registry.clone())
            .callback(|_| {})
            .build()
            .unwrap();

        let found = registry
            .find_typed::<ManualKind>(None, Some(object.object_id()), |o| o.is_registered())
            .unwrap();
        assert!(Arc::ptr_eq(&found, &obs));
        assert_eq!(found.kind_name(), "manual");
    }

    #[test]
    fn test_indexes_stay_consistent() {
        let registry = Arc::new(Registry::new());
        let observer = Arc::new(Probe::default());
        let objects: Vec<_> = (0..3).map(|_| Arc::new(Probe::default())).collect();
        let observations: Vec<_> = objects
            .iter()
            .map(|object| {
                manual()
                    .observer(&observer)
                    .object(object)
                    .registry(registry.clone())
                    .callback(|_| {})
                    .build()
                    .unwrap()
            })
            .collect();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.all_for_observer(observer.object_id()).len(), 3);
        assert_eq!(registry.all_for_object(objects[1].object_id()).len(), 1);

        observations[1].remove();
        assert_eq!(registry.len(), 2);
        assert!(registry.all_for_object(objects[1].object_id()).is_empty());
        assert_eq!(
            registry
                .all_for(Some(observer.object_id()), Some(objects[0].object_id()))
                .len(),
            1
        );

        assert_eq!(registry.remove_all_for_observer(observer.object_id()), 2);
        assert!(registry.is_empty());
        assert!(observations.iter().all(|o| !o.is_registered()));
    }
}
