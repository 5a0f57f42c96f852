// These are public API re-exports - they may not be used internally yet
#![allow(unused_imports)]

//! Domain Layer
//!
//! This module contains the vocabulary shared by the observation engine, the
//! group relay and the adapters.
//!
//! # Architecture
//!
//! The domain layer is organized into:
//!
//! - **Lifeline** (`lifeline.rs`) - Object identity, destruction hooks, weak anchors
//! - **Ports** (`ports.rs`) - Trait abstractions for the underlying primitives
//! - **Events** (`events.rs`) - Lifecycle events for audit and tests
//!
//! # Usage
//!
//! ```ignore
//! use lifewatch::domain::lifeline::{Lifecycle, Lifeline};
//! use lifewatch::domain::ports::ChangeObservable;
//!
//! // Participating types embed a lifeline
//! struct Model {
//!     lifeline: Lifeline,
//! }
//!
//! impl Lifecycle for Model {
//!     fn lifeline(&self) -> &Lifeline {
//!         &self.lifeline
//!     }
//! }
//! ```

pub mod events;
pub mod lifeline;
pub mod ports;

// Re-export commonly used types
pub use events::{ObservationEvent, RemovalReason};
pub use lifeline::{Anchor, DisposerToken, Lifecycle, Lifeline, ObjectId};
pub use ports::{
    // Port traits
    BroadcastCenter,
    // Value objects
    Change,
    ChangeHandler,
    ChangeKind,
    ChangeObservable,
    ChangeOptions,
    ControlEvent,
    ControlEventSource,
    ControlEvents,
    ControlHandler,
    EventPublisher,
    GroupContainerProvider,
    HandlerToken,
    Job,
    Notification,
    NotificationHandler,
    Payload,
    WakeupHandler,
    WakeupSignal,
    WorkQueue,
};
