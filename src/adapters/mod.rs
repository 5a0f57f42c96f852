//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  ChangeObservable │ BroadcastCenter │ ControlEventSource   │ │
//! │  │  GroupContainerProvider │ WakeupSignal │ EventPublisher    │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ PropertyStore │ LocalBroadcastCenter │ Control             │ │
//! │  │ DirectoryContainerProvider │ InProcessWakeup │ PollingWakeup│ │
//! │  │ LoggingEventPublisher │ EventLogWriter │ FanoutEventPublisher│ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use lifewatch::adapters::{DirectoryContainerProvider, InProcessWakeup};
//! use lifewatch::relay::{GroupNotificationManager, RelayConfig};
//!
//! let containers = Arc::new(DirectoryContainerProvider::permissive("/var/lib/lifewatch"));
//! let manager = GroupNotificationManager::new(
//!     RelayConfig::for_app("widget"),
//!     containers,
//!     Arc::new(InProcessWakeup::new()),
//! );
//! manager.register_group("group.example")?;
//! ```

mod broadcast;
mod container;
mod control;
mod property_store;
mod wakeup;

#[allow(unused_imports)]
pub use broadcast::LocalBroadcastCenter;
#[allow(unused_imports)]
pub use container::DirectoryContainerProvider;
#[allow(unused_imports)]
pub use control::Control;
#[allow(unused_imports)]
pub use property_store::PropertyStore;
#[allow(unused_imports)]
pub use wakeup::{InProcessWakeup, PollingConfig, PollingWakeup};

// Re-export event publishers for convenience
mod event_publisher;
#[allow(unused_imports)]
pub use event_publisher::{EventLogWriter, FanoutEventPublisher, InMemoryEventCollector, LoggingEventPublisher};
