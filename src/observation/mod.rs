//! Observation Engine
//!
//! One [`Observation`] is one active subscription tying an event source to a
//! callback. The base engine owns everything that is the same for every kind
//! of trigger:
//!
//! - validation at construction ([`ObservationBuilder::build`])
//! - registration in the [`Registry`] and destruction hooks on both anchors
//! - idempotent, re-entrant [`Observation::remove`]
//! - dispatch of callbacks, inline or on a [`WorkQueue`]
//!
//! Kind-specific behaviour lives behind [`ObservationKind`]: how to attach to
//! and detach from the real primitive, and what a trigger carries.
//!
//! # Lifecycle
//!
//! ```text
//!  build() ──▶ register() ──▶ [triggers ──▶ invoke]* ──▶ remove() ──▶ inert
//!                  │                                        ▲
//!                  └── disposers on observer / object ──────┘
//! ```

pub mod control_event;
pub mod group;
pub mod key_path;
pub mod notification;
#[cfg(test)]
mod proptest;
pub mod registry;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, trace, warn};

use crate::domain::events::{ObservationEvent, RemovalReason};
use crate::domain::lifeline::{Anchor, DisposerToken, Lifecycle, ObjectId};
use crate::domain::ports::WorkQueue;
use crate::error::{Error, Result};

pub use control_event::{ControlEventKind, ControlEventObservation, ControlTrigger};
pub use group::{GroupKind, GroupObservation};
pub use key_path::{KeyPathKind, KeyPathObservation};
pub use notification::{NotificationKind, NotificationObservation};
pub use registry::{Registry, RegistryEntry};

static NEXT_OBSERVATION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an observation, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObservationId(u64);

impl ObservationId {
    fn next() -> Self {
        Self(NEXT_OBSERVATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obs#{}", self.0)
    }
}

// =============================================================================
// Kind Contract
// =============================================================================

/// Adapter between the base engine and one underlying primitive.
pub trait ObservationKind: Send + Sync + Sized + 'static {
    /// Fields populated for the duration of one callback.
    type Trigger: Send + Sync + 'static;

    /// Short name used in logs and events.
    const NAME: &'static str;

    /// Hook the real primitive so that triggers reach
    /// [`Observation::invoke_on_queue_after`].
    fn register_internal(observation: &Arc<Observation<Self>>) -> Result<()>;

    /// Unhook the real primitive. Must tolerate a source that is already gone.
    fn deregister_internal(observation: &Observation<Self>);
}

// =============================================================================
// Callback & Dispatch Target
// =============================================================================

pub type PlainCallback<K> = Arc<dyn Fn(&Observation<K>) + Send + Sync>;
pub type ObserverCallback<K> =
    Arc<dyn Fn(&(dyn Any + Send + Sync), &Observation<K>) + Send + Sync>;

/// The one callback of an observation.
pub enum Callback<K: ObservationKind> {
    /// Receives only the observation.
    Plain(PlainCallback<K>),
    /// Receives the (still alive) observer and the observation.
    WithObserver {
        observer_type: TypeId,
        callback: ObserverCallback<K>,
    },
}

impl<K: ObservationKind> Callback<K> {
    pub fn plain(f: impl Fn(&Observation<K>) + Send + Sync + 'static) -> Self {
        Callback::Plain(Arc::new(f))
    }

    pub fn with_observer<O: Any + Send + Sync>(
        f: impl Fn(&O, &Observation<K>) + Send + Sync + 'static,
    ) -> Self {
        Callback::WithObserver {
            observer_type: TypeId::of::<O>(),
            callback: Arc::new(move |observer: &(dyn Any + Send + Sync), observation: &Observation<K>| {
                if let Some(observer) = observer.downcast_ref::<O>() {
                    f(observer, observation);
                }
            }),
        }
    }

    pub fn is_observer_aware(&self) -> bool {
        matches!(self, Callback::WithObserver { .. })
    }
}

impl<K: ObservationKind> Clone for Callback<K> {
    fn clone(&self) -> Self {
        match self {
            Callback::Plain(cb) => Callback::Plain(cb.clone()),
            Callback::WithObserver {
                observer_type,
                callback,
            } => Callback::WithObserver {
                observer_type: *observer_type,
                callback: callback.clone(),
            },
        }
    }
}

/// Where callbacks run.
#[derive(Clone, Default)]
pub enum DispatchTarget {
    /// On whatever thread the trigger happened.
    #[default]
    Unspecified,
    /// As one job per trigger on the given queue.
    Queue(Arc<dyn WorkQueue>),
}

impl fmt::Debug for DispatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchTarget::Unspecified => write!(f, "Unspecified"),
            DispatchTarget::Queue(queue) => write!(f, "Queue({})", queue.label()),
        }
    }
}

// =============================================================================
// Observation
// =============================================================================

#[derive(Default)]
struct LifecycleState {
    registered: bool,
    /// Set once removed; a retired observation never registers again
    retired: bool,
    hooks: Vec<(Anchor, DisposerToken)>,
}

/// One active subscription.
///
/// Created through an [`ObservationBuilder`]; kept alive by the registry
/// while registered. Handles held by callers are advisory.
pub struct Observation<K: ObservationKind> {
    id: ObservationId,
    kind: K,
    observer: Option<Anchor>,
    object: Option<Anchor>,
    callback: Callback<K>,
    dispatch: DispatchTarget,
    registry: Arc<Registry>,
    registered: AtomicBool,
    auto_remove: AtomicBool,
    lifecycle: Mutex<LifecycleState>,
    trigger: RwLock<Option<Arc<K::Trigger>>>,
    /// Makes setup + invoke of one trigger a single unit
    delivery: ReentrantMutex<()>,
    this: Weak<Self>,
}

impl<K: ObservationKind> Observation<K> {
    pub fn id(&self) -> ObservationId {
        self.id
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn observer(&self) -> Option<&Anchor> {
        self.observer.as_ref()
    }

    /// The observee.
    pub fn object(&self) -> Option<&Anchor> {
        self.object.as_ref()
    }

    pub fn observer_as<O: Any + Send + Sync>(&self) -> Option<Arc<O>> {
        self.observer.as_ref()?.downcast::<O>()
    }

    pub fn object_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.object.as_ref()?.downcast::<T>()
    }

    pub fn callback(&self) -> &Callback<K> {
        &self.callback
    }

    pub fn dispatch_target(&self) -> &DispatchTarget {
        &self.dispatch
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn auto_remove(&self) -> bool {
        self.auto_remove.load(Ordering::SeqCst)
    }

    /// Fields of the trigger being delivered. `None` outside a callback.
    pub fn trigger(&self) -> Option<Arc<K::Trigger>> {
        self.trigger.read().clone()
    }

    /// Turn automatic removal on destruction of either anchor on or off.
    pub fn set_auto_remove(&self, enabled: bool) {
        let mut state = self.lifecycle.lock();
        let previous = self.auto_remove.swap(enabled, Ordering::SeqCst);
        if !state.registered || previous == enabled {
            return;
        }
        if enabled {
            state.hooks = self.install_hooks();
        } else {
            for (anchor, token) in std::mem::take(&mut state.hooks) {
                anchor.remove_disposer(token);
            }
        }
    }

    /// Insert into the registry, install destruction hooks and hook the primitive.
    ///
    /// Called once by [`ObservationBuilder::build`]; calling again is a no-op.
    pub fn register(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.lifecycle.lock();
            if state.registered || state.retired {
                return Ok(());
            }
            self.registry.insert(self.clone());
            if self.auto_remove() {
                state.hooks = self.install_hooks();
            }
            state.registered = true;
            self.registered.store(true, Ordering::SeqCst);
        }

        // outside the lock: some primitives fire synchronously while attaching
        if let Err(err) = K::register_internal(self) {
            warn!(
                observation_id = %self.id,
                kind = K::NAME,
                error = %err,
                "Failed to hook primitive, rolling back"
            );
            self.teardown(RemovalReason::Rollback, false);
            return Err(err);
        }

        // a concurrent remove() may have run before the primitive was attached
        if !self.is_registered() {
            K::deregister_internal(self);
            return Ok(());
        }

        debug!(
            observation_id = %self.id,
            kind = K::NAME,
            observer = ?self.observer_id(),
            object = ?self.object_id(),
            "Observation registered"
        );
        self.registry.publish(ObservationEvent::registered(
            self.id.as_u64(),
            K::NAME,
            self.observer_id().map(|id| id.as_u64()),
            self.object_id().map(|id| id.as_u64()),
        ));
        Ok(())
    }

    /// Stop observing. Idempotent and safe to call from inside the callback.
    ///
    /// A trigger already executing its callback on another thread finishes;
    /// triggers that start afterwards are dropped.
    pub fn remove(&self) {
        self.teardown(RemovalReason::Explicit, true);
    }

    pub(crate) fn remove_because(&self, reason: RemovalReason) {
        self.teardown(reason, true);
    }

    fn teardown(&self, reason: RemovalReason, deregister: bool) {
        let hooks = {
            let mut state = self.lifecycle.lock();
            if !state.registered {
                return;
            }
            state.registered = false;
            state.retired = true;
            self.registered.store(false, Ordering::SeqCst);
            std::mem::take(&mut state.hooks)
        };

        if deregister {
            K::deregister_internal(self);
        }
        let removed = self
            .registry
            .remove(self.id, self.observer_id(), self.object_id());
        for (anchor, token) in hooks {
            anchor.remove_disposer(token);
        }

        debug!(observation_id = %self.id, kind = K::NAME, %reason, "Observation removed");
        self.registry
            .publish(ObservationEvent::removed(self.id.as_u64(), K::NAME, reason));
        drop(removed);
    }

    fn install_hooks(&self) -> Vec<(Anchor, DisposerToken)> {
        let mut hooks = Vec::with_capacity(2);
        let mut install = |anchor: &Anchor, reason: RemovalReason| {
            let this = self.this.clone();
            let token = anchor.add_disposer(move || {
                if let Some(observation) = this.upgrade() {
                    observation.remove_because(reason);
                }
            });
            match token {
                Some(token) => hooks.push((anchor.clone(), token)),
                None => trace!(observation_id = %self.id, anchor = %anchor.id(), "Anchor already finalised"),
            }
        };

        if let Some(observer) = &self.observer {
            install(observer, RemovalReason::ObserverDestroyed);
        }
        if let Some(object) = &self.object {
            if self.observer.as_ref().map(Anchor::id) != Some(object.id()) {
                install(object, RemovalReason::ObjectDestroyed);
            }
        }
        hooks
    }

    /// Run the callback synchronously with the current trigger fields.
    pub fn invoke(&self) {
        match &self.callback {
            Callback::Plain(callback) => callback(self),
            Callback::WithObserver { callback, .. } => {
                match self.observer.as_ref().and_then(Anchor::upgrade) {
                    Some(observer) => callback(&*observer, self),
                    None => trace!(observation_id = %self.id, "Observer gone, callback skipped"),
                }
            }
        }
    }

    /// Deliver one trigger: `setup` produces its fields, then the callback runs.
    ///
    /// With no dispatch queue both happen before this returns. With a queue they
    /// are enqueued together as one job.
    pub fn invoke_on_queue_after<F>(self: &Arc<Self>, setup: F)
    where
        F: FnOnce() -> K::Trigger + Send + 'static,
    {
        match &self.dispatch {
            DispatchTarget::Unspecified => self.deliver(setup),
            DispatchTarget::Queue(queue) => {
                let this = Arc::clone(self);
                queue.enqueue(Box::new(move || this.deliver(setup)));
            }
        }
    }

    fn deliver<F>(&self, setup: F)
    where
        F: FnOnce() -> K::Trigger,
    {
        let _unit = self.delivery.lock();
        if !self.is_registered() {
            trace!(observation_id = %self.id, kind = K::NAME, "Trigger after removal dropped");
            return;
        }
        let fields = Arc::new(setup());
        // nested triggers on the same thread restore the outer fields afterwards
        let outer = self.trigger.write().replace(fields);
        let _restore = RestoreTrigger {
            slot: &self.trigger,
            outer,
        };
        self.invoke();
    }

    fn observer_id(&self) -> Option<ObjectId> {
        self.observer.as_ref().map(Anchor::id)
    }

    fn object_id(&self) -> Option<ObjectId> {
        self.object.as_ref().map(Anchor::id)
    }
}

/// Puts the enclosing trigger back when a delivery ends, unwinding included.
struct RestoreTrigger<'a, T> {
    slot: &'a RwLock<Option<Arc<T>>>,
    outer: Option<Arc<T>>,
}

impl<T> Drop for RestoreTrigger<'_, T> {
    fn drop(&mut self) {
        *self.slot.write() = self.outer.take();
    }
}

impl<K: ObservationKind> fmt::Debug for Observation<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observation")
            .field("id", &self.id)
            .field("kind", &K::NAME)
            .field("observer", &self.observer)
            .field("object", &self.object)
            .field("dispatch", &self.dispatch)
            .field("registered", &self.is_registered())
            .field("auto_remove", &self.auto_remove())
            .finish()
    }
}

impl<K: ObservationKind> Drop for Observation<K> {
    fn drop(&mut self) {
        trace!(observation_id = %self.id, kind = K::NAME, "Observation dropped");
    }
}

impl<K: ObservationKind> RegistryEntry for Observation<K> {
    fn id(&self) -> ObservationId {
        self.id
    }

    fn kind_name(&self) -> &'static str {
        K::NAME
    }

    fn observer_id(&self) -> Option<ObjectId> {
        Observation::observer_id(self)
    }

    fn object_id(&self) -> Option<ObjectId> {
        Observation::object_id(self)
    }

    fn is_registered(&self) -> bool {
        Observation::is_registered(self)
    }

    fn remove(&self) {
        Observation::remove(self);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Collects and validates the parameters of a new observation.
///
/// Typed variants provide the entry points, e.g. `KeyPathObservation::builder`.
pub struct ObservationBuilder<K: ObservationKind> {
    kind: K,
    observer: Option<Anchor>,
    object: Option<Anchor>,
    callback: Option<Callback<K>>,
    dispatch: Option<DispatchTarget>,
    auto_remove: bool,
    registry: Option<Arc<Registry>>,
    problems: Vec<String>,
}

impl<K: ObservationKind> ObservationBuilder<K> {
    pub fn new(kind: K) -> Self {
        Self {
            kind,
            observer: None,
            object: None,
            callback: None,
            dispatch: None,
            auto_remove: true,
            registry: None,
            problems: Vec::new(),
        }
    }

    pub fn observer<O: Lifecycle>(mut self, observer: &Arc<O>) -> Self {
        self.observer = Some(Anchor::new(observer));
        self
    }

    /// Set the observee.
    pub fn object<T: Lifecycle>(mut self, object: &Arc<T>) -> Self {
        self.object = Some(Anchor::new(object));
        self
    }

    /// Run callbacks on `queue` instead of inline.
    pub fn on_queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        if self.dispatch.is_some() {
            self.problems
                .push("more than one dispatch queue supplied".to_string());
        }
        self.dispatch = Some(DispatchTarget::Queue(queue));
        self
    }

    pub fn callback(self, f: impl Fn(&Observation<K>) + Send + Sync + 'static) -> Self {
        self.with_callback(Callback::plain(f))
    }

    /// Callback that also receives the observer, which must be of type `O`.
    pub fn observer_callback<O: Lifecycle>(
        self,
        f: impl Fn(&O, &Observation<K>) + Send + Sync + 'static,
    ) -> Self {
        self.with_callback(Callback::with_observer(f))
    }

    pub fn with_callback(mut self, callback: Callback<K>) -> Self {
        if self.callback.is_some() {
            self.problems
                .push("more than one callback supplied".to_string());
        }
        self.callback = Some(callback);
        self
    }

    pub fn auto_remove(mut self, enabled: bool) -> Self {
        self.auto_remove = enabled;
        self
    }

    /// Register in `registry` instead of the process-wide one.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub(crate) fn problem(mut self, problem: impl Into<String>) -> Self {
        self.problems.push(problem.into());
        self
    }

    pub(crate) fn kind_mut(&mut self) -> &mut K {
        &mut self.kind
    }

    /// Validate, create and register the observation.
    pub fn build(self) -> Result<Arc<Observation<K>>> {
        if !self.problems.is_empty() {
            return Err(Error::invalid(self.problems.join("; ")));
        }
        let callback = self
            .callback
            .ok_or_else(|| Error::invalid("no callback supplied"))?;
        if self.observer.is_none() && self.object.is_none() {
            return Err(Error::invalid("observer and object are both absent"));
        }
        if let Callback::WithObserver { observer_type, .. } = &callback {
            match &self.observer {
                None => {
                    return Err(Error::invalid(
                        "observer-aware callback requires an observer",
                    ))
                }
                Some(observer) if observer.type_id() != *observer_type => {
                    return Err(Error::invalid(format!(
                        "observer-aware callback does not accept observer type {}",
                        observer.type_name()
                    )))
                }
                Some(_) => {}
            }
        }

        let registry = self.registry.unwrap_or_else(Registry::global);
        let observation = Arc::new_cyclic(|this| Observation {
            id: ObservationId::next(),
            kind: self.kind,
            observer: self.observer,
            object: self.object,
            callback,
            dispatch: self.dispatch.unwrap_or_default(),
            registry,
            registered: AtomicBool::new(false),
            auto_remove: AtomicBool::new(self.auto_remove),
            lifecycle: Mutex::new(LifecycleState::default()),
            trigger: RwLock::new(None),
            delivery: ReentrantMutex::new(()),
            this: this.clone(),
        });
        observation.register()?;
        Ok(observation)
    }
}

// =============================================================================
// Tests
// =============================================================================
