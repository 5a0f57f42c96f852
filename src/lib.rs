//! lifewatch - Lifecycle-Safe Observations
//!
//! Observations over property changes, broadcast notifications, control
//! events and cross-process group notifications that clean themselves up
//! when the objects they involve go away.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  build()   ┌──────────────┐  hooks   ┌──────────────┐
//! │ Observation  │──────────▶│   Registry   │◀─────────│   Lifeline   │
//! │   Builder    │           │ (observer ×  │  remove  │ (observer /  │
//! └──────────────┘           │   object)    │          │   object)    │
//!        │                   └──────────────┘          └──────────────┘
//!        │ attach
//!        ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ ChangeObservable │ BroadcastCenter │ ControlEventSource │  Relay  │
//! └──────────────────────────────────────────────────────────────────┘
//!                                                            │
//!                                           GroupStore + WakeupSignal
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`dispatch`] - Work queues for deferred callback delivery
//! - [`domain`] - Lifelines, ports and lifecycle events
//! - [`error`] - Error types
//! - [`observation`] - The observation engine and its four kinds
//! - [`relay`] - Cross-process group notification relay

pub mod adapters;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod observation;
pub mod relay;

// Re-export commonly used types
pub use domain::{Lifecycle, Lifeline, ObjectId, ObservationEvent, RemovalReason};
pub use error::{Error, Result};
pub use observation::{
    Callback, ControlEventObservation, DispatchTarget, GroupObservation, KeyPathObservation,
    NotificationObservation, Observation, ObservationBuilder, ObservationId, ObservationKind,
    Registry,
};
pub use relay::{DeliveryMode, GroupDelivery, GroupNotificationManager, RelayConfig};
