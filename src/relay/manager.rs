//! Group Notification Manager
//!
//! Relays named notifications between processes that share a group
//! container. Posts are appended to the group's durable store and announced
//! through a payload-free [`WakeupSignal`]; on wakeup every process reads the
//! store and hands new entries to its local subscribers.
//!
//! ```text
//!   process A                      group container                 process B
//!  ┌──────────┐   append + rename  ┌────────────────┐   read       ┌──────────┐
//!  │  post()  │ ─────────────────▶ │ lifewatch/     │ ───────────▶ │ deliver  │
//!  └──────────┘                    │   <group>.json │              │ _pending │
//!       │          signal(group)   └────────────────┘   wakeup     └──────────┘
//!       └──────────────────────────────────────────────────────────────▲
//! ```
//!
//! Delivery modes per subscription:
//! - **latest-only**: on each wakeup the newest entry, if it is newer than the
//!   last one delivered
//! - **reliable**: every entry since the checkpoint, in one ordered batch; the
//!   checkpoint survives unsubscription when retained, so a later resubscribe
//!   catches up on what was missed
//!
//! Each mode keeps its own cursor in the subscriber record, so latest-only
//! subscriptions of an app never disturb its reliable checkpoint.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, trace, warn};

use super::config::RelayConfig;
use super::store::{GroupStore, PostedEntry, StoreSnapshot};
use crate::domain::events::ObservationEvent;
use crate::domain::ports::{
    EventPublisher, GroupContainerProvider, HandlerToken, Payload, WakeupHandler, WakeupSignal,
};
use crate::error::{Error, Result};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Types
// =============================================================================

/// Handle of one local subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// How a subscription receives posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Only the newest entry per wakeup
    #[default]
    LatestOnly,
    /// Every entry, in order, with a durable checkpoint
    Reliable,
}

impl DeliveryMode {
    pub fn is_reliable(&self) -> bool {
        matches!(self, DeliveryMode::Reliable)
    }
}

/// What a group subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupDelivery {
    pub group: String,
    pub name: String,
    pub mode: DeliveryMode,
    /// Oldest first; a single entry for latest-only subscriptions
    pub entries: Vec<PostedEntry>,
}

impl GroupDelivery {
    /// Payload of the newest entry.
    pub fn payload(&self) -> Option<&Payload> {
        self.entries.last()?.payload.as_ref()
    }

    /// Post time of the newest entry.
    pub fn posted_at(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|entry| entry.posted_at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type GroupHandler = Arc<dyn Fn(&GroupDelivery) + Send + Sync>;

struct LocalSubscription {
    id: SubscriptionId,
    mode: DeliveryMode,
    handler: GroupHandler,
}

struct RegisteredGroup {
    store: Arc<GroupStore>,
    wakeup: HandlerToken,
}

type SubscriptionKey = (String, String);

// =============================================================================
// Manager
// =============================================================================

/// Cross-process notification relay for one application.
pub struct GroupNotificationManager {
    config: RelayConfig,
    containers: Arc<dyn GroupContainerProvider>,
    wakeup: Arc<dyn WakeupSignal>,
    groups: RwLock<HashMap<String, RegisteredGroup>>,
    default_group: RwLock<Option<String>>,
    /// (group, name) → local subscriptions
    subscriptions: DashMap<SubscriptionKey, Vec<LocalSubscription>>,
    suspended: AtomicBool,
    posts: AtomicU64,
    /// Held by the thread currently delivering
    delivering: Mutex<()>,
    /// Groups whose delivery was requested while another delivery ran
    deferred: Mutex<HashSet<String>>,
    publisher: RwLock<Option<Arc<dyn EventPublisher>>>,
    this: Weak<Self>,
}

impl GroupNotificationManager {
    pub fn new(
        config: RelayConfig,
        containers: Arc<dyn GroupContainerProvider>,
        wakeup: Arc<dyn WakeupSignal>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            containers,
            wakeup,
            groups: RwLock::new(HashMap::new()),
            default_group: RwLock::new(None),
            subscriptions: DashMap::new(),
            suspended: AtomicBool::new(false),
            posts: AtomicU64::new(0),
            delivering: Mutex::new(()),
            deferred: Mutex::new(HashSet::new()),
            publisher: RwLock::new(None),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn app_identifier(&self) -> &str {
        &self.config.app_identifier
    }

    pub fn set_publisher(&self, publisher: Arc<dyn EventPublisher>) {
        *self.publisher.write() = Some(publisher);
    }

    // =========================================================================
    // Groups
    // =========================================================================

    /// Start using `group`. It also becomes the default group.
    #[instrument(skip(self), fields(app = %self.config.app_identifier))]
    pub fn register_group(&self, group: &str) -> Result<()> {
        let container = self.containers.container_for(group)?;
        let store = GroupStore::open(
            &container,
            group,
            self.config.lock_timeout,
            self.config.stale_lock_after,
        )?;

        {
            let mut groups = self.groups.write();
            if !groups.contains_key(group) {
                let this = self.this.clone();
                let handler: WakeupHandler = Arc::new(move |group: &str| {
                    if let Some(manager) = this.upgrade() {
                        manager.handle_wakeup(group);
                    }
                });
                let wakeup = self.wakeup.subscribe(group, handler);
                groups.insert(
                    group.to_string(),
                    RegisteredGroup {
                        store: Arc::new(store),
                        wakeup,
                    },
                );
            }
        }
        *self.default_group.write() = Some(group.to_string());

        info!(group, container = %container.display(), "Group registered");
        self.publish(ObservationEvent::group_registered(group));
        Ok(())
    }

    /// Stop using `group`. Local subscriptions to it go inert; durable
    /// subscriber records stay so reliable state can be resumed later.
    pub fn deregister_group(&self, group: &str) -> bool {
        let Some(registered) = self.groups.write().remove(group) else {
            return false;
        };
        self.wakeup.unsubscribe(registered.wakeup);
        self.subscriptions.retain(|(g, _), _| g != group);
        {
            let mut default_group = self.default_group.write();
            if default_group.as_deref() == Some(group) {
                *default_group = None;
            }
        }

        info!(group, "Group deregistered");
        self.publish(ObservationEvent::group_deregistered(group));
        true
    }

    /// The most recently registered group still registered.
    pub fn default_group(&self) -> Option<String> {
        self.default_group.read().clone()
    }

    pub fn is_registered(&self, group: &str) -> bool {
        self.groups.read().contains_key(group)
    }

    /// Whether this process may use `group` at all.
    pub fn is_valid_group(&self, group: &str) -> bool {
        self.containers.container_for(group).is_ok()
    }

    fn store_for(&self, group: &str) -> Result<Arc<GroupStore>> {
        self.groups
            .read()
            .get(group)
            .map(|registered| registered.store.clone())
            .ok_or_else(|| Error::NotEntitled {
                group: group.to_string(),
            })
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribe to the newest post of `name` on each wakeup.
    pub fn subscribe(&self, group: &str, name: &str, handler: GroupHandler) -> Result<SubscriptionId> {
        self.add_subscription(group, name, DeliveryMode::LatestOnly, handler)
    }

    /// Subscribe to every post of `name`, resuming retained state if any.
    pub fn subscribe_reliable(&self, group: &str, name: &str, handler: GroupHandler) -> Result<SubscriptionId> {
        self.add_subscription(group, name, DeliveryMode::Reliable, handler)
    }

    #[instrument(skip(self, handler), fields(app = %self.config.app_identifier))]
    pub fn add_subscription(
        &self,
        group: &str,
        name: &str,
        mode: DeliveryMode,
        handler: GroupHandler,
    ) -> Result<SubscriptionId> {
        if name.is_empty() {
            return Err(Error::invalid("notification name must not be empty"));
        }
        let store = self.store_for(group)?;
        let key = (group.to_string(), name.to_string());
        let first_of_mode = self
            .subscriptions
            .get(&key)
            .map_or(true, |subs| subs.iter().all(|sub| sub.mode != mode));
        let app = self.config.app_identifier.as_str();

        let resumed = store.update(|state| {
            let head = state.head_seq(name);
            let cursor = state.checkpoint(app, name).and_then(|checkpoint| checkpoint.cursor(mode));
            match cursor {
                // retained reliable state: keep the cursor, catch up below
                Some(_) if mode.is_reliable() => Ok(first_of_mode),
                Some(_) if !first_of_mode => Ok(false),
                _ => {
                    state.set_cursor(app, name, mode, head);
                    Ok(false)
                }
            }
        })?;

        let id = SubscriptionId::next();
        self.subscriptions.entry(key).or_default().push(LocalSubscription {
            id,
            mode,
            handler,
        });

        debug!(group, name, ?mode, resumed, "Subscribed");
        self.publish(ObservationEvent::group_subscribed(
            group,
            name,
            mode.is_reliable(),
            resumed,
        ));

        if resumed && !self.is_suspended() {
            self.deliver_pending(group);
        }
        Ok(id)
    }

    /// Drop a local subscription.
    ///
    /// With `retain_state` a reliable subscription keeps its durable
    /// checkpoint, so posts made meanwhile are delivered on resubscribe.
    #[instrument(skip(self), fields(app = %self.config.app_identifier))]
    pub fn unsubscribe(&self, id: SubscriptionId, retain_state: bool) -> bool {
        let mut found = None;
        for mut entry in self.subscriptions.iter_mut() {
            if let Some(position) = entry.value().iter().position(|sub| sub.id == id) {
                let removed = entry.value_mut().remove(position);
                let last_of_mode = entry.value().iter().all(|sub| sub.mode != removed.mode);
                found = Some((entry.key().clone(), removed.mode, last_of_mode));
                break;
            }
        }
        let Some(((group, name), mode, last_of_mode)) = found else {
            return false;
        };
        self.subscriptions
            .remove_if(&(group.clone(), name.clone()), |_, subs| subs.is_empty());

        let retained = retain_state && mode.is_reliable() && last_of_mode;
        let app = self.config.app_identifier.as_str();
        if last_of_mode && !retained {
            if let Ok(store) = self.store_for(&group) {
                let result = store.update(|state| {
                    state.clear_cursor(app, &name, mode);
                    state.prune(&name);
                    Ok(())
                });
                if let Err(e) = result {
                    warn!(group, name, error = %e, "Failed to update subscriber record");
                }
            }
        }

        debug!(group, name, retained, "Unsubscribed");
        self.publish(ObservationEvent::group_unsubscribed(&group, &name, retained));
        true
    }

    /// Number of local subscriptions to `name` in `group`.
    pub fn subscription_count(&self, group: &str, name: &str) -> usize {
        self.subscriptions
            .get(&(group.to_string(), name.to_string()))
            .map_or(0, |subs| subs.len())
    }

    // =========================================================================
    // Posting
    // =========================================================================

    /// Append a notification to `group` and wake every process using it.
    ///
    /// Returns the sequence number of the new entry.
    #[instrument(skip(self, payload), fields(app = %self.config.app_identifier))]
    pub fn post(&self, group: &str, name: &str, payload: Option<Payload>) -> Result<u64> {
        if name.is_empty() {
            return Err(Error::invalid("notification name must not be empty"));
        }
        let store = self.store_for(group)?;
        let permit = self.config.permit_posts_without_subscribers;
        let frequency = u64::from(self.config.cleanup_frequency);
        let count = self.posts.fetch_add(1, Ordering::Relaxed) + 1;
        let cleanup = frequency > 0 && count % frequency == 0;

        let seq = store.update(|state| {
            if !permit && !state.has_subscribers(name) {
                return Err(Error::NoSubscribers {
                    group: group.to_string(),
                    name: name.to_string(),
                });
            }
            let seq = state.append(name, payload, Utc::now());
            if cleanup {
                let pruned = state.prune_all();
                if pruned > 0 {
                    trace!(group, pruned, "Pruned delivered entries");
                }
            }
            Ok(seq)
        })?;

        debug!(group, name, seq, "Posted");
        self.publish(ObservationEvent::group_posted(group, name, seq));
        self.wakeup.signal(group)?;
        Ok(seq)
    }

    /// [`post`](Self::post) to the default group.
    pub fn post_default(&self, name: &str, payload: Option<Payload>) -> Result<u64> {
        let group = self.default_group().ok_or_else(|| Error::NotEntitled {
            group: String::new(),
        })?;
        self.post(&group, name, payload)
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Entry point for the wakeup signal.
    pub fn handle_wakeup(&self, group: &str) {
        if self.is_suspended() {
            trace!(group, "Suspended, wakeup ignored");
            return;
        }
        self.deliver_pending(group);
    }

    /// Hand every pending entry of `group` to local subscribers.
    ///
    /// Only one thread delivers at a time. A request made meanwhile, including
    /// one from inside a subscriber, is picked up by the delivering thread
    /// before it returns. Returns how many entries this call delivered.
    pub fn deliver_pending(&self, group: &str) -> usize {
        self.deferred.lock().insert(group.to_string());
        let mut delivered = 0;
        loop {
            {
                let Some(_delivering) = self.delivering.try_lock() else {
                    return delivered;
                };
                loop {
                    let groups: Vec<String> = self.deferred.lock().drain().collect();
                    if groups.is_empty() {
                        break;
                    }
                    for group in groups {
                        match self.deliver_group(&group) {
                            Ok(count) => delivered += count,
                            Err(e) => warn!(group, error = %e, "Delivery failed"),
                        }
                    }
                }
            }
            if self.deferred.lock().is_empty() {
                return delivered;
            }
        }
    }

    #[instrument(skip(self), fields(app = %self.config.app_identifier))]
    fn deliver_group(&self, group: &str) -> Result<usize> {
        let store = self.store_for(group)?;
        let state = store.read()?;
        let app = self.config.app_identifier.as_str();
        let names: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.key().0 == group)
            .map(|entry| entry.key().1.clone())
            .collect();

        let mut delivered = 0;
        for name in names {
            let Some(checkpoint) = state.checkpoint(app, &name) else {
                continue;
            };
            // handlers are cloned out so none runs while the table is locked
            let handlers: Vec<(DeliveryMode, GroupHandler)> = self
                .subscriptions
                .get(&(group.to_string(), name.clone()))
                .map(|subs| subs.iter().map(|sub| (sub.mode, sub.handler.clone())).collect())
                .unwrap_or_default();

            for mode in [DeliveryMode::Reliable, DeliveryMode::LatestOnly] {
                let Some(cursor) = checkpoint.cursor(mode) else {
                    continue;
                };
                let targets: Vec<&GroupHandler> = handlers
                    .iter()
                    .filter(|(m, _)| *m == mode)
                    .map(|(_, handler)| handler)
                    .collect();
                if targets.is_empty() {
                    continue;
                }
                let pending = state.entries_after(&name, cursor);
                let (Some(first_seq), Some(last_seq)) =
                    (pending.first().map(|e| e.seq), pending.last().map(|e| e.seq))
                else {
                    continue;
                };
                let count = pending.len();
                let entries = match mode {
                    DeliveryMode::Reliable => pending,
                    DeliveryMode::LatestOnly => pending.into_iter().last().into_iter().collect(),
                };
                let delivery = GroupDelivery {
                    group: group.to_string(),
                    name: name.clone(),
                    mode,
                    entries,
                };

                // every handler runs even if an earlier one panics
                let failed = targets
                    .iter()
                    .filter(|handler| catch_unwind(AssertUnwindSafe(|| handler(&delivery))).is_err())
                    .count();
                if failed > 0 {
                    error!(group, name, ?mode, failed, first_seq, last_seq, "Subscriber panicked; entries stay pending");
                    continue;
                }

                store.update(|state| {
                    state.advance(app, &name, mode, last_seq);
                    state.prune(&name);
                    Ok(())
                })?;

                delivered += delivery.len();
                debug!(group, name, ?mode, first_seq, last_seq, count, "Delivered");
                self.publish(ObservationEvent::group_delivered(
                    group,
                    &name,
                    first_seq,
                    last_seq,
                    delivery.len(),
                ));
            }
        }
        Ok(delivered)
    }

    /// Ignore wakeups until [`resume`](Self::resume).
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
        debug!(app = %self.config.app_identifier, "Relay suspended");
    }

    /// Accept wakeups again and deliver everything that piled up.
    pub fn resume(&self) -> usize {
        self.suspended.store(false, Ordering::SeqCst);
        debug!(app = %self.config.app_identifier, "Relay resumed");
        let groups: Vec<String> = self.groups.read().keys().cloned().collect();
        groups.iter().map(|group| self.deliver_pending(group)).sum()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Snapshot of the durable state of `group`.
    pub fn inspect(&self, group: &str) -> Result<StoreSnapshot> {
        self.store_for(group)?.read()
    }

    fn publish(&self, event: ObservationEvent) {
        let publisher = self.publisher.read().clone();
        if let Some(publisher) = publisher {
            if let Err(e) = publisher.publish(event) {
                warn!(error = %e, "Failed to publish relay event");
            }
        }
    }
}

impl Drop for GroupNotificationManager {
    fn drop(&mut self) {
        for (_, registered) in self.groups.get_mut().drain() {
            self.wakeup.unsubscribe(registered.wakeup);
        }
    }
}

impl std::fmt::Debug for GroupNotificationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupNotificationManager")
            .field("app", &self.config.app_identifier)
            .field("groups", &self.groups.read().len())
            .field("subscriptions", &self.subscriptions.len())
            .field("suspended", &self.is_suspended())
            .finish()
    }
}
