//! Cross-Process Group Relay
//!
//! Named notifications shared by every process entitled to a group
//! container: a durable JSON store per group plus a wakeup signal.

mod config;
mod manager;
pub mod store;

#[allow(unused_imports)]
pub use config::{default_app_identifier, RelayConfig};
#[allow(unused_imports)]
pub use manager::{
    DeliveryMode, GroupDelivery, GroupHandler, GroupNotificationManager, SubscriptionId,
};
#[allow(unused_imports)]
pub use store::{Checkpoint, GroupStore, NotificationLog, PostedEntry, StoreSnapshot, STORE_DIR};
