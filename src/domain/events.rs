//! Domain Events
//!
//! Immutable records of lifecycle transitions: observations being registered
//! and torn down, and group notifications moving through the relay.
//!
//! # Usage
//!
//! Events are used for:
//! - Audit logging of automatic teardown
//! - Asserting lifecycle behaviour in tests
//! - Tooling that watches a relay
//!
//! # Example
//!
//! ```ignore
//! let event = ObservationEvent::removed(42, "key_path", RemovalReason::ObserverDestroyed);
//! publisher.publish(event)?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why an observation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalReason {
    /// `remove()` was called, directly or through a lookup helper.
    Explicit,
    /// The observer was destroyed.
    ObserverDestroyed,
    /// The observed object was destroyed.
    ObjectDestroyed,
    /// Hooking up the underlying primitive failed during registration.
    Rollback,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovalReason::Explicit => write!(f, "explicit"),
            RemovalReason::ObserverDestroyed => write!(f, "observer destroyed"),
            RemovalReason::ObjectDestroyed => write!(f, "object destroyed"),
            RemovalReason::Rollback => write!(f, "rollback"),
        }
    }
}

/// Domain event representing a lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ObservationEvent {
    // =========================================================================
    // Observation Events
    // =========================================================================
    /// An observation became active.
    Registered {
        observation_id: u64,
        kind: String,
        observer: Option<u64>,
        object: Option<u64>,
        timestamp: DateTime<Utc>,
    },

    /// An observation was torn down.
    Removed {
        observation_id: u64,
        kind: String,
        reason: RemovalReason,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Group Relay Events
    // =========================================================================
    /// A group container was registered with the relay.
    GroupRegistered {
        group: String,
        timestamp: DateTime<Utc>,
    },

    /// A group was deregistered; its local subscriptions went inert.
    GroupDeregistered {
        group: String,
        timestamp: DateTime<Utc>,
    },

    /// A local subscription was added.
    GroupSubscribed {
        group: String,
        name: String,
        reliable: bool,
        /// Retained reliable state was picked up again
        resumed: bool,
        timestamp: DateTime<Utc>,
    },

    /// A local subscription was dropped.
    GroupUnsubscribed {
        group: String,
        name: String,
        retained: bool,
        timestamp: DateTime<Utc>,
    },

    /// A notification was appended to the durable store.
    GroupPosted {
        group: String,
        name: String,
        seq: u64,
        timestamp: DateTime<Utc>,
    },

    /// A batch of entries was handed to local subscribers and checkpointed.
    GroupDelivered {
        group: String,
        name: String,
        first_seq: u64,
        last_seq: u64,
        count: usize,
        timestamp: DateTime<Utc>,
    },
}

impl ObservationEvent {
    /// Get the event type as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            ObservationEvent::Registered { .. } => "Registered",
            ObservationEvent::Removed { .. } => "Removed",
            ObservationEvent::GroupRegistered { .. } => "GroupRegistered",
            ObservationEvent::GroupDeregistered { .. } => "GroupDeregistered",
            ObservationEvent::GroupSubscribed { .. } => "GroupSubscribed",
            ObservationEvent::GroupUnsubscribed { .. } => "GroupUnsubscribed",
            ObservationEvent::GroupPosted { .. } => "GroupPosted",
            ObservationEvent::GroupDelivered { .. } => "GroupDelivered",
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ObservationEvent::Registered { timestamp, .. }
            | ObservationEvent::Removed { timestamp, .. }
            | ObservationEvent::GroupRegistered { timestamp, .. }
            | ObservationEvent::GroupDeregistered { timestamp, .. }
            | ObservationEvent::GroupSubscribed { timestamp, .. }
            | ObservationEvent::GroupUnsubscribed { timestamp, .. }
            | ObservationEvent::GroupPosted { timestamp, .. }
            | ObservationEvent::GroupDelivered { timestamp, .. } => *timestamp,
        }
    }

    /// Observation id, for observation events.
    pub fn observation_id(&self) -> Option<u64> {
        match self {
            ObservationEvent::Registered { observation_id, .. }
            | ObservationEvent::Removed { observation_id, .. } => Some(*observation_id),
            _ => None,
        }
    }

    /// Group identifier, for relay events.
    pub fn group(&self) -> Option<&str> {
        match self {
            ObservationEvent::GroupRegistered { group, .. }
            | ObservationEvent::GroupDeregistered { group, .. }
            | ObservationEvent::GroupSubscribed { group, .. }
            | ObservationEvent::GroupUnsubscribed { group, .. }
            | ObservationEvent::GroupPosted { group, .. }
            | ObservationEvent::GroupDelivered { group, .. } => Some(group),
            _ => None,
        }
    }

    // =========================================================================
    // Factory Methods
    // =========================================================================

    pub fn registered(
        observation_id: u64,
        kind: &str,
        observer: Option<u64>,
        object: Option<u64>,
    ) -> Self {
        ObservationEvent::Registered {
            observation_id,
            kind: kind.to_string(),
            observer,
            object,
            timestamp: Utc::now(),
        }
    }

    pub fn removed(observation_id: u64, kind: &str, reason: RemovalReason) -> Self {
        ObservationEvent::Removed {
            observation_id,
            kind: kind.to_string(),
            reason,
            timestamp: Utc::now(),
        }
    }

    pub fn group_registered(group: &str) -> Self {
        ObservationEvent::GroupRegistered {
            group: group.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn group_deregistered(group: &str) -> Self {
        ObservationEvent::GroupDeregistered {
            group: group.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn group_subscribed(group: &str, name: &str, reliable: bool, resumed: bool) -> Self {
        ObservationEvent::GroupSubscribed {
            group: group.to_string(),
            name: name.to_string(),
            reliable,
            resumed,
            timestamp: Utc::now(),
        }
    }

    pub fn group_unsubscribed(group: &str, name: &str, retained: bool) -> Self {
        ObservationEvent::GroupUnsubscribed {
            group: group.to_string(),
            name: name.to_string(),
            retained,
            timestamp: Utc::now(),
        }
    }

    pub fn group_posted(group: &str, name: &str, seq: u64) -> Self {
        ObservationEvent::GroupPosted {
            group: group.to_string(),
            name: name.to_string(),
            seq,
            timestamp: Utc::now(),
        }
    }

    pub fn group_delivered(group: &str, name: &str, first_seq: u64, last_seq: u64, count: usize) -> Self {
        ObservationEvent::GroupDelivered {
            group: group.to_string(),
            name: name.to_string(),
            first_seq,
            last_seq,
            count,
            timestamp: Utc::now(),
        }
    }
}
