//! Observations of cross-process group notifications.
//!
//! A group observation always has an observer; there is no observee. The
//! subscription lives in a [`GroupNotificationManager`], which may deliver on
//! the thread that handled the wakeup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Observation, ObservationBuilder, ObservationKind, Registry};
use crate::domain::lifeline::ObjectId;
use crate::error::Result;
use crate::relay::{DeliveryMode, GroupDelivery, GroupHandler, GroupNotificationManager, SubscriptionId};

pub type GroupObservation = Observation<GroupKind>;

pub struct GroupKind {
    group: String,
    name: String,
    mode: DeliveryMode,
    manager: Arc<GroupNotificationManager>,
    subscription: Mutex<Option<SubscriptionId>>,
    /// Keep the durable checkpoint when the subscription is dropped
    retain_state: AtomicBool,
}

impl GroupKind {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }
}

impl ObservationKind for GroupKind {
    type Trigger = GroupDelivery;
    const NAME: &'static str = "group";

    fn register_internal(observation: &Arc<Observation<Self>>) -> Result<()> {
        let kind = observation.kind();
        let this = Arc::downgrade(observation);
        let handler: GroupHandler = Arc::new(move |delivery: &GroupDelivery| {
            if let Some(observation) = this.upgrade() {
                let delivery = delivery.clone();
                observation.invoke_on_queue_after(move || delivery);
            }
        });
        let id = kind
            .manager
            .add_subscription(&kind.group, &kind.name, kind.mode, handler)?;
        *kind.subscription.lock() = Some(id);
        Ok(())
    }

    fn deregister_internal(observation: &Observation<Self>) {
        let kind = observation.kind();
        if let Some(id) = kind.subscription.lock().take() {
            let retain = kind.retain_state.load(Ordering::SeqCst);
            kind.manager.unsubscribe(id, retain);
        }
    }
}

impl Observation<GroupKind> {
    /// Start building an observation of `name` in `group`, or in the
    /// manager's default group when `group` is `None`.
    ///
    /// An observer is required.
    pub fn builder(
        manager: &Arc<GroupNotificationManager>,
        group: Option<&str>,
        name: impl Into<String>,
        mode: DeliveryMode,
    ) -> ObservationBuilder<GroupKind> {
        let name = name.into();
        let group = group
            .map(str::to_string)
            .or_else(|| manager.default_group());
        let mut problems = Vec::new();
        if name.is_empty() {
            problems.push("group notification name must not be empty");
        }
        if group.is_none() {
            problems.push("no group given and no default group registered");
        }
        let mut builder = ObservationBuilder::new(GroupKind {
            group: group.unwrap_or_default(),
            name,
            mode,
            manager: manager.clone(),
            subscription: Mutex::new(None),
            retain_state: AtomicBool::new(false),
        });
        for problem in problems {
            builder = builder.problem(problem);
        }
        builder
    }

    pub fn group(&self) -> &str {
        self.kind().group()
    }

    pub fn name(&self) -> &str {
        self.kind().name()
    }

    pub fn is_reliable(&self) -> bool {
        self.kind().mode().is_reliable()
    }

    /// The batch being delivered. `None` outside a callback.
    pub fn delivery(&self) -> Option<Arc<GroupDelivery>> {
        self.trigger()
    }

    /// Remove while keeping reliable state, so that a later reliable
    /// observation of the same name receives what was posted meanwhile.
    pub fn pause(&self) {
        self.kind().retain_state.store(true, Ordering::SeqCst);
        self.remove();
    }

    /// Remove the first observation of `name` by `observer`, in `group` or any group.
    pub fn remove_for(observer: ObjectId, group: Option<&str>, name: &str) -> bool {
        Self::remove_for_in(&Registry::global(), observer, group, name)
    }

    pub fn remove_for_in(registry: &Registry, observer: ObjectId, group: Option<&str>, name: &str) -> bool {
        let matched = registry.find_typed::<GroupKind>(Some(observer), None, |o| {
            o.name() == name && group.map_or(true, |group| o.group() == group)
        });
        match matched {
            Some(observation) => {
                observation.remove();
                true
            }
            None => false,
        }
    }
}
