//! Dispatch Destinations
//!
//! [`WorkQueue`] implementations observations can deliver their callbacks on.
//!
//! - [`SerialQueue`]: one dedicated worker thread, jobs run in FIFO order
//! - [`RuntimeQueue`]: jobs run concurrently on a tokio runtime's blocking pool

mod runtime;
mod serial;

#[allow(unused_imports)]
pub use runtime::RuntimeQueue;
#[allow(unused_imports)]
pub use serial::SerialQueue;

#[allow(unused_imports)]
pub use crate::domain::ports::{Job, WorkQueue};
