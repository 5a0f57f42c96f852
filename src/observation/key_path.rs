//! Key-path observations over a [`ChangeObservable`] object.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use super::{Observation, ObservationBuilder, ObservationKind, Registry};
use crate::domain::lifeline::ObjectId;
use crate::domain::ports::{Change, ChangeHandler, ChangeObservable, ChangeOptions, HandlerToken};
use crate::error::{Error, Result};

pub type KeyPathObservation = Observation<KeyPathKind>;

/// Watches one or more key paths of an object.
pub struct KeyPathKind {
    key_paths: Vec<String>,
    options: ChangeOptions,
    source: Weak<dyn ChangeObservable>,
    tokens: Mutex<Vec<HandlerToken>>,
}

impl KeyPathKind {
    pub fn key_paths(&self) -> &[String] {
        &self.key_paths
    }

    pub fn options(&self) -> ChangeOptions {
        self.options
    }

    fn same_paths(&self, key_paths: &[&str]) -> bool {
        let mine: BTreeSet<&str> = self.key_paths.iter().map(String::as_str).collect();
        let theirs: BTreeSet<&str> = key_paths.iter().copied().collect();
        mine == theirs
    }
}

impl ObservationKind for KeyPathKind {
    type Trigger = Change;
    const NAME: &'static str = "key_path";

    fn register_internal(observation: &Arc<Observation<Self>>) -> Result<()> {
        let kind = observation.kind();
        let source = kind
            .source
            .upgrade()
            .ok_or_else(|| Error::NotFound("observed object is gone".to_string()))?;

        for key_path in &kind.key_paths {
            let this = Arc::downgrade(observation);
            let handler: ChangeHandler = Arc::new(move |change: &Change| {
                if let Some(observation) = this.upgrade() {
                    let change = change.clone();
                    observation.invoke_on_queue_after(move || change);
                }
            });
            // INITIAL may fire from inside this call
            let token = source.add_change_handler(key_path, kind.options, handler);
            kind.tokens.lock().push(token);
        }
        Ok(())
    }

    fn deregister_internal(observation: &Observation<Self>) {
        let kind = observation.kind();
        let tokens = std::mem::take(&mut *kind.tokens.lock());
        match kind.source.upgrade() {
            Some(source) => {
                for token in tokens {
                    source.remove_change_handler(token);
                }
            }
            None => trace!(observation_id = %observation.id(), "Observed object already gone"),
        }
    }
}

impl Observation<KeyPathKind> {
    /// Start building an observation of `key_paths` on `object`.
    pub fn builder<T, I, S>(object: &Arc<T>, key_paths: I) -> ObservationBuilder<KeyPathKind>
    where
        T: ChangeObservable,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let weak: Weak<T> = Arc::downgrade(object);
        let source: Weak<dyn ChangeObservable> = weak;
        let key_paths: Vec<String> = key_paths.into_iter().map(Into::into).collect();
        let empty = key_paths.is_empty() || key_paths.iter().any(String::is_empty);
        let builder = ObservationBuilder::new(KeyPathKind {
            key_paths,
            options: ChangeOptions::empty(),
            source,
            tokens: Mutex::new(Vec::new()),
        })
        .object(object);
        if empty {
            builder.problem("key paths must be present and non-empty")
        } else {
            builder
        }
    }

    pub fn key_paths(&self) -> &[String] {
        self.kind().key_paths()
    }

    /// The change being delivered. `None` outside a callback.
    pub fn change(&self) -> Option<Arc<Change>> {
        self.trigger()
    }

    /// Remove the first observation of exactly `key_paths` on `object`.
    pub fn remove_for(observer: Option<ObjectId>, object: ObjectId, key_paths: &[&str]) -> bool {
        Self::remove_for_in(&Registry::global(), observer, object, key_paths)
    }

    pub fn remove_for_in(
        registry: &Registry,
        observer: Option<ObjectId>,
        object: ObjectId,
        key_paths: &[&str],
    ) -> bool {
        match registry.find_typed::<KeyPathKind>(observer, Some(object), |o| {
            o.kind().same_paths(key_paths)
        }) {
            Some(observation) => {
                observation.remove();
                true
            }
            None => false,
        }
    }
}

impl ObservationBuilder<KeyPathKind> {
    /// Options passed through to the object; NEW | OLD is typical.
    pub fn options(mut self, options: ChangeOptions) -> Self {
        self.kind_mut().options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::PropertyStore;
    use crate::domain::lifeline::{Lifecycle, Lifeline};
    use crate::domain::ports::ChangeKind;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[derive(Default)]
    struct Listener {
        lifeline: Lifeline,
        seen: Mutex<Vec<Change>>,
    }

    impl Lifecycle for Listener {
        fn lifeline(&self) -> &Lifeline {
            &self.lifeline
        }
    }

    #[test]
    fn test_change_reaches_observer() {
        let registry = Arc::new(Registry::new());
        let store = PropertyStore::new();
        let listener = Arc::new(Listener::default());

        let obs = KeyPathObservation::builder(&store, ["name"])
            .observer(&listener)
            .options(ChangeOptions::NEW | ChangeOptions::OLD)
            .registry(registry)
            .observer_callback(|l: &Listener, o: &KeyPathObservation| {
                l.seen.lock().push((*o.change().unwrap()).clone());
            })
            .build()
            .unwrap();

        store.set("name", json!("ada"));
        store.set("name", json!("grace"));

        let seen = listener.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].kind, ChangeKind::Setting);
        assert_eq!(seen[1].old, Some(json!("ada")));
        assert_eq!(seen[1].new, Some(json!("grace")));
        assert!(obs.is_registered());
    }

    #[test]
    fn test_initial_fires_during_registration() {
        let registry = Arc::new(Registry::new());
        let store = PropertyStore::new();
        store.set("count", json!(3));
        let values = Arc::new(Mutex::new(Vec::new()));
        let v = values.clone();

        let _obs = KeyPathObservation::builder(&store, ["count"])
            .options(ChangeOptions::NEW | ChangeOptions::INITIAL)
            .registry(registry)
            .callback(move |o| v.lock().push(o.change().and_then(|c| c.new.clone())))
            .build()
            .unwrap();

        assert_eq!(*values.lock(), vec![Some(json!(3))]);
    }

    #[test]
    fn test_empty_key_paths_rejected() {
        let store = PropertyStore::new();
        let result = KeyPathObservation::builder(&store, Vec::<String>::new())
            .callback(|_| {})
            .build();
        assert_matches!(result, Err(Error::InvalidConfiguration(_)));
    }

    #[test]
    fn test_remove_for_matches_path_set() {
        let registry = Arc::new(Registry::new());
        let store = PropertyStore::new();
        let _obs = KeyPathObservation::builder(&store, ["a", "b"])
            .registry(registry.clone())
            .callback(|_| {})
            .build()
            .unwrap();
        assert_eq!(store.observer_count("a"), 1);

        assert!(!KeyPathObservation::remove_for_in(&registry, None, store.object_id(), &["a"]));
        assert!(KeyPathObservation::remove_for_in(&registry, None, store.object_id(), &["b", "a"]));
        assert_eq!(store.observer_count("a"), 0);
        assert_eq!(store.observer_count("b"), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_observer_destruction_detaches_from_object() {
        let registry = Arc::new(Registry::new());
        let store = PropertyStore::new();
        let listener = Arc::new(Listener::default());
        let listener_id = listener.object_id();

        let _obs = KeyPathObservation::builder(&store, ["name"])
            .observer(&listener)
            .registry(registry.clone())
            .observer_callback(|_: &Listener, _| {})
            .build()
            .unwrap();
        assert_eq!(store.observer_count("name"), 1);

        drop(listener);
        assert_eq!(store.observer_count("name"), 0);
        assert!(registry.all_for_observer(listener_id).is_empty());
        store.set("name", json!("no one listening"));
    }
}
