//! Observations of named notifications on a [`BroadcastCenter`].
//!
//! Three addressing modes, all through the same builder:
//!
//! | observer | poster | delivered                                  |
//! |----------|--------|--------------------------------------------|
//! | set      | set    | posts of `name` by `poster`, to `observer` |
//! | set      | -      | posts of `name` by anyone, to `observer`   |
//! | -        | set    | posts of `name` by `poster`, anonymous     |

use std::sync::Arc;

use parking_lot::Mutex;

use super::{Observation, ObservationBuilder, ObservationKind, Registry};
use crate::domain::lifeline::{Anchor, Lifecycle, ObjectId};
use crate::domain::ports::{BroadcastCenter, HandlerToken, Notification, NotificationHandler};
use crate::error::Result;

pub type NotificationObservation = Observation<NotificationKind>;

pub struct NotificationKind {
    name: String,
    center: Arc<dyn BroadcastCenter>,
    token: Mutex<Option<HandlerToken>>,
}

impl NotificationKind {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ObservationKind for NotificationKind {
    type Trigger = Notification;
    const NAME: &'static str = "notification";

    fn register_internal(observation: &Arc<Observation<Self>>) -> Result<()> {
        let kind = observation.kind();
        let this = Arc::downgrade(observation);
        let handler: NotificationHandler = Arc::new(move |notification: &Notification| {
            if let Some(observation) = this.upgrade() {
                let notification = notification.clone();
                observation.invoke_on_queue_after(move || notification);
            }
        });
        let poster = observation.object().map(Anchor::id);
        let token = kind.center.add_handler(&kind.name, poster, handler);
        *kind.token.lock() = Some(token);
        Ok(())
    }

    fn deregister_internal(observation: &Observation<Self>) {
        let kind = observation.kind();
        if let Some(token) = kind.token.lock().take() {
            kind.center.remove_handler(token);
        }
    }
}

impl Observation<NotificationKind> {
    /// Start building an observation of `name` posts on `center`.
    ///
    /// Add `.object(&poster)` to only receive posts from that poster.
    pub fn builder(
        center: Arc<dyn BroadcastCenter>,
        name: impl Into<String>,
    ) -> ObservationBuilder<NotificationKind> {
        let name = name.into();
        let empty = name.is_empty();
        let builder = ObservationBuilder::new(NotificationKind {
            name,
            center,
            token: Mutex::new(None),
        });
        if empty {
            builder.problem("notification name must not be empty")
        } else {
            builder
        }
    }

    /// Convenience for the poster-filtered modes.
    pub fn from_poster<T: Lifecycle>(
        center: Arc<dyn BroadcastCenter>,
        name: impl Into<String>,
        poster: &Arc<T>,
    ) -> ObservationBuilder<NotificationKind> {
        Self::builder(center, name).object(poster)
    }

    pub fn name(&self) -> &str {
        self.kind().name()
    }

    /// The notification being delivered. `None` outside a callback.
    pub fn notification(&self) -> Option<Arc<Notification>> {
        self.trigger()
    }

    /// Remove the first observation of `name` matching the given participants.
    pub fn remove_for(observer: Option<ObjectId>, poster: Option<ObjectId>, name: &str) -> bool {
        Self::remove_for_in(&Registry::global(), observer, poster, name)
    }

    pub fn remove_for_in(
        registry: &Registry,
        observer: Option<ObjectId>,
        poster: Option<ObjectId>,
        name: &str,
    ) -> bool {
        match registry.find_typed::<NotificationKind>(observer, poster, |o| o.name() == name) {
            Some(observation) => {
                observation.remove();
                true
            }
            None => false,
        }
    }
}
