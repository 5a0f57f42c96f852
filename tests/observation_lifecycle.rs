//! Observation lifecycle integration tests
//!
//! Exercises the public API end to end:
//! - Construction validation
//! - Explicit and automatic removal
//! - Registry consistency
//! - Queued delivery

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use assert_matches::assert_matches;
use serde_json::json;

use lifewatch::adapters::{Control, InMemoryEventCollector, LocalBroadcastCenter, PropertyStore};
use lifewatch::dispatch::{RuntimeQueue, SerialQueue};
use lifewatch::domain::{BroadcastCenter, ChangeOptions, ControlEvents, Notification};
use lifewatch::{
    ControlEventObservation, Error, KeyPathObservation, Lifecycle, Lifeline, NotificationObservation,
    ObservationEvent, Registry,
};

#[derive(Default)]
struct Screen {
    lifeline: Lifeline,
    refreshes: AtomicUsize,
}

impl Lifecycle for Screen {
    fn lifeline(&self) -> &Lifeline {
        &self.lifeline
    }
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

// =============================================================================
// Construction
// =============================================================================

#[test]
fn test_no_observer_and_no_object_is_rejected() {
    let center: Arc<dyn BroadcastCenter> = Arc::new(LocalBroadcastCenter::new());
    let registry = Arc::new(Registry::new());
    let result = NotificationObservation::builder(center, "refresh")
        .registry(registry.clone())
        .callback(|_| {})
        .build();
    assert_matches!(result, Err(Error::InvalidConfiguration(_)));
    assert!(registry.is_empty());
}

#[test]
fn test_callback_forms_are_mutually_exclusive() {
    let store = PropertyStore::new();
    let screen = Arc::new(Screen::default());

    let neither = KeyPathObservation::builder(&store, ["name"])
        .observer(&screen)
        .registry(Arc::new(Registry::new()))
        .build();
    assert_matches!(neither, Err(Error::InvalidConfiguration(_)));

    let both = KeyPathObservation::builder(&store, ["name"])
        .observer(&screen)
        .registry(Arc::new(Registry::new()))
        .callback(|_| {})
        .observer_callback(|_: &Screen, _| {})
        .build();
    assert_matches!(both, Err(Error::InvalidConfiguration(_)));
    assert_eq!(store.observer_count("name"), 0);
}

// =============================================================================
// Removal
// =============================================================================

#[test]
fn test_remove_twice_equals_remove_once() {
    let store = PropertyStore::new();
    let registry = Arc::new(Registry::new());
    let calls = counter();
    let c = calls.clone();
    let observation = KeyPathObservation::builder(&store, ["name"])
        .registry(registry.clone())
        .callback(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    store.set("name", "a");
    observation.remove();
    let after_first = (registry.len(), store.observer_count("name"), observation.is_registered());
    observation.remove();
    let after_second = (registry.len(), store.observer_count("name"), observation.is_registered());
    store.set("name", "b");

    assert_eq!(after_first, (0, 0, false));
    assert_eq!(after_first, after_second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_destroyed_observer_leaves_no_trace() {
    let store = PropertyStore::new();
    let registry = Arc::new(Registry::new());
    let screen = Arc::new(Screen::default());
    let screen_id = screen.object_id();

    let observation = KeyPathObservation::builder(&store, ["name"])
        .observer(&screen)
        .options(ChangeOptions::NEW)
        .registry(registry.clone())
        .observer_callback(|screen: &Screen, _| {
            screen.refreshes.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    store.set("name", "ada");
    assert_eq!(screen.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(store.observer_count("name"), 1);

    drop(screen);

    assert_eq!(store.observer_count("name"), 0);
    assert!(registry.all_for_observer(screen_id).is_empty());
    assert!(!observation.is_registered());
    store.set("name", "grace");
}

#[test]
fn test_auto_remove_disabled_keeps_observation_until_removed() {
    let control = Control::new();
    let registry = Arc::new(Registry::new());
    let screen = Arc::new(Screen::default());
    let calls = counter();
    let c = calls.clone();

    let observation = ControlEventObservation::builder(&control, ControlEvents::TOUCH_UP_INSIDE)
        .observer(&screen)
        .auto_remove(false)
        .registry(registry.clone())
        .callback(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    drop(screen);
    assert!(observation.is_registered());
    control.send_actions(ControlEvents::TOUCH_UP_INSIDE);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    observation.remove();
    assert_eq!(control.action_count(), 0);
}

#[test]
fn test_destroying_observed_object_removes_observation() {
    let registry = Arc::new(Registry::new());
    let screen = Arc::new(Screen::default());
    let store = PropertyStore::new();
    let observation = KeyPathObservation::builder(&store, ["title", "subtitle"])
        .observer(&screen)
        .registry(registry.clone())
        .callback(|_| {})
        .build()
        .unwrap();

    assert_eq!(registry.all_for_observer(screen.object_id()).len(), 1);
    drop(store);
    assert!(!observation.is_registered());
    assert!(registry.all_for_observer(screen.object_id()).is_empty());
}

// =============================================================================
// Registry
// =============================================================================

#[test]
fn test_registered_iff_findable() {
    let center = Arc::new(LocalBroadcastCenter::new());
    let registry = Arc::new(Registry::new());
    let screen = Arc::new(Screen::default());
    let poster = Arc::new(Screen::default());

    let observations: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|name| {
            NotificationObservation::from_poster(center.clone(), name, &poster)
                .observer(&screen)
                .registry(registry.clone())
                .callback(|_| {})
                .build()
                .unwrap()
        })
        .collect();

    observations[1].remove();

    for observation in &observations {
        let found = registry
            .find(Some(screen.object_id()), Some(poster.object_id()), |entry| entry.id() == observation.id())
            .is_some();
        assert_eq!(found, observation.is_registered());
    }
    assert!(NotificationObservation::remove_for_in(&registry, Some(screen.object_id()), None, "c"));
    assert!(!NotificationObservation::remove_for_in(&registry, Some(screen.object_id()), None, "b"));
    assert_eq!(registry.len(), 1);
    assert_eq!(center.handler_count("a"), 1);
}

#[test]
fn test_lifecycle_events_are_published() {
    let collector = Arc::new(InMemoryEventCollector::new());
    let registry = Arc::new(Registry::with_publisher(collector.clone()));
    let center: Arc<dyn BroadcastCenter> = Arc::new(LocalBroadcastCenter::new());
    let screen = Arc::new(Screen::default());

    let observation = NotificationObservation::builder(center, "refresh")
        .observer(&screen)
        .registry(registry)
        .callback(|_| {})
        .build()
        .unwrap();
    drop(screen);

    let events = collector.events_for_observation(observation.id().as_u64());
    assert_eq!(events.len(), 2);
    assert_matches!(events[0], ObservationEvent::Registered { .. });
    assert_matches!(events[1], ObservationEvent::Removed { .. });
}

// =============================================================================
// Dispatch
// =============================================================================

#[test]
fn test_queued_callbacks_run_in_post_order() {
    let center = Arc::new(LocalBroadcastCenter::new());
    let queue = Arc::new(SerialQueue::new("ui").unwrap());
    let screen = Arc::new(Screen::default());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let s = seen.clone();

    let _observation = NotificationObservation::builder(center.clone(), "tick")
        .observer(&screen)
        .on_queue(queue.clone())
        .registry(Arc::new(Registry::new()))
        .callback(move |o| {
            let n = o.notification().unwrap();
            s.lock().push(n.user_info.clone());
        })
        .build()
        .unwrap();

    for i in 0..5 {
        center.post(Notification::new("tick").with_user_info(json!(i)));
    }
    queue.flush();

    let expected: Vec<_> = (0..5).map(|i| Some(json!(i))).collect();
    assert_eq!(*seen.lock(), expected);
}

#[test]
fn test_runtime_queue_delivery() {
    tokio_test::block_on(async {
        let center = Arc::new(LocalBroadcastCenter::new());
        let screen = Arc::new(Screen::default());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = parking_lot::Mutex::new(Some(tx));

        let _observation = NotificationObservation::builder(center.clone(), "ready")
            .observer(&screen)
            .on_queue(Arc::new(RuntimeQueue::current("runtime").unwrap()))
            .registry(Arc::new(Registry::new()))
            .callback(move |o| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(o.notification().map(|n| n.name.clone()));
                }
            })
            .build()
            .unwrap();

        center.post(Notification::new("ready"));
        assert_eq!(rx.await.unwrap(), Some("ready".to_string()));
    });
}
