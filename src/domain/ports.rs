//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the collaborator abstractions (ports) the observation
//! engine and the group relay depend on. The engine never generates change
//! notifications, dispatches UI events or talks to other processes itself;
//! adapters implement these traits to provide the real primitives.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Observation Engine / Relay                   │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │ ChangeObservable │ BroadcastCenter │ ControlEvent…  │    │
//! │  │ GroupContainerProvider │ WakeupSignal │ WorkQueue   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Adapters (Impls)                          │
//! │  PropertyStore │ LocalBroadcastCenter │ Control │ …         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::ObservationEvent;
use super::lifeline::{Anchor, Lifecycle, ObjectId};
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Opaque payload carried by notifications and change records.
pub type Payload = serde_json::Value;

static NEXT_HANDLER_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Handle for a callback attached to one of the underlying primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerToken(u64);

impl HandlerToken {
    /// Allocate a process-unique token.
    pub fn next() -> Self {
        Self(NEXT_HANDLER_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

// =============================================================================
// Key-Value Change Observation
// =============================================================================

bitflags! {
    /// What a change record should carry and when it is produced.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChangeOptions: u8 {
        /// Include the new value.
        const NEW = 1 << 0;
        /// Include the old value.
        const OLD = 1 << 1;
        /// Fire once immediately on attach with the current value.
        const INITIAL = 1 << 2;
        /// Fire an extra record before each change.
        const PRIOR = 1 << 3;
    }
}

/// Kind of change described by a [`Change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Setting,
    Insertion,
    Removal,
    Replacement,
}

/// One change record delivered by a [`ChangeObservable`].
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub key_path: String,
    pub kind: ChangeKind,
    pub prior: bool,
    pub old: Option<Payload>,
    pub new: Option<Payload>,
    pub indexes: Option<Vec<usize>>,
}

pub type ChangeHandler = Arc<dyn Fn(&Change) + Send + Sync>;

/// Object that can report changes to its attributes by key path.
pub trait ChangeObservable: Lifecycle {
    fn add_change_handler(
        &self,
        key_path: &str,
        options: ChangeOptions,
        handler: ChangeHandler,
    ) -> HandlerToken;

    fn remove_change_handler(&self, token: HandlerToken) -> bool;
}

// =============================================================================
// Broadcast Notifications
// =============================================================================

/// A named, centrally dispatched event.
#[derive(Debug, Clone)]
pub struct Notification {
    pub name: String,
    pub poster: Option<Anchor>,
    pub user_info: Option<Payload>,
}

impl Notification {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            poster: None,
            user_info: None,
        }
    }

    pub fn with_poster<T: Lifecycle>(mut self, poster: &Arc<T>) -> Self {
        self.poster = Some(Anchor::new(poster));
        self
    }

    pub fn with_user_info(mut self, user_info: Payload) -> Self {
        self.user_info = Some(user_info);
        self
    }

    pub fn poster_id(&self) -> Option<ObjectId> {
        self.poster.as_ref().map(Anchor::id)
    }
}

pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Publish/subscribe by name with an optional poster filter.
pub trait BroadcastCenter: Send + Sync {
    /// Subscribe to `name`; when `poster` is set only its posts are delivered.
    fn add_handler(
        &self,
        name: &str,
        poster: Option<ObjectId>,
        handler: NotificationHandler,
    ) -> HandlerToken;

    fn remove_handler(&self, token: HandlerToken) -> bool;

    fn post(&self, notification: Notification);
}

// =============================================================================
// Control Events
// =============================================================================

bitflags! {
    /// Control event bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ControlEvents: u32 {
        const TOUCH_DOWN = 1 << 0;
        const TOUCH_DOWN_REPEAT = 1 << 1;
        const TOUCH_DRAG_INSIDE = 1 << 2;
        const TOUCH_DRAG_OUTSIDE = 1 << 3;
        const TOUCH_UP_INSIDE = 1 << 6;
        const TOUCH_UP_OUTSIDE = 1 << 7;
        const TOUCH_CANCEL = 1 << 8;
        const VALUE_CHANGED = 1 << 12;
        const PRIMARY_ACTION_TRIGGERED = 1 << 13;
        const EDITING_DID_BEGIN = 1 << 16;
        const EDITING_CHANGED = 1 << 17;
        const EDITING_DID_END = 1 << 18;
        const ALL_TOUCH_EVENTS = 0x0000_0FFF;
        const ALL_EDITING_EVENTS = 0x000F_0000;
    }
}

/// Raw record of one control event.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlEvent {
    /// Events that fired, intersected with the subscription mask
    pub events: ControlEvents,
    pub sender: ObjectId,
    pub timestamp: DateTime<Utc>,
}

pub type ControlHandler = Arc<dyn Fn(&ControlEvent) + Send + Sync>;

/// A control that can run actions for an event bitmask.
pub trait ControlEventSource: Lifecycle {
    fn add_action(&self, events: ControlEvents, handler: ControlHandler) -> HandlerToken;

    fn remove_action(&self, token: HandlerToken) -> bool;
}

// =============================================================================
// Cross-Process Group Relay
// =============================================================================

/// Resolves a group identifier to its shared storage directory.
pub trait GroupContainerProvider: Send + Sync {
    /// Fails with [`crate::Error::NotEntitled`] if this process may not use the group.
    fn container_for(&self, group: &str) -> Result<PathBuf>;
}

pub type WakeupHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifier-scoped, payload-free "something changed" signal between processes.
pub trait WakeupSignal: Send + Sync {
    fn subscribe(&self, group: &str, handler: WakeupHandler) -> HandlerToken;

    fn unsubscribe(&self, token: HandlerToken) -> bool;

    fn signal(&self, group: &str) -> Result<()>;
}

// =============================================================================
// Dispatch Destinations
// =============================================================================

/// Unit of work handed to a [`WorkQueue`].
pub type Job = Box<dyn FnOnce() + Send>;

/// Destination queue on which observation callbacks can run.
pub trait WorkQueue: Send + Sync {
    fn enqueue(&self, job: Job);

    fn label(&self) -> &str;
}

// =============================================================================
// Event Publishing
// =============================================================================

/// Sink for lifecycle audit events.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: ObservationEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_tokens_are_unique() {
        let a = HandlerToken::next();
        let b = HandlerToken::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_change_options() {
        let opts = ChangeOptions::NEW | ChangeOptions::OLD;
        assert!(opts.contains(ChangeOptions::NEW));
        assert!(!opts.contains(ChangeOptions::PRIOR));
        assert_eq!(ChangeOptions::default(), ChangeOptions::empty());
    }

    #[test]
    fn test_control_event_groups() {
        assert!(ControlEvents::ALL_TOUCH_EVENTS.contains(ControlEvents::TOUCH_UP_INSIDE));
        assert!(ControlEvents::ALL_EDITING_EVENTS.contains(ControlEvents::EDITING_CHANGED));
        assert!(!ControlEvents::ALL_TOUCH_EVENTS.intersects(ControlEvents::EDITING_DID_END));
    }

    #[test]
    fn test_notification_builder() {
        let n = Notification::new("ready").with_user_info(serde_json::json!({"ok": true}));
        assert_eq!(n.name, "ready");
        assert!(n.poster.is_none());
        assert_eq!(n.poster_id(), None);
        assert_eq!(n.user_info.unwrap()["ok"], true);
    }
}
