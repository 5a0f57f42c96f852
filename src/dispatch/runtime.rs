//! Work queue on a tokio runtime.

use tokio::runtime::Handle;

use crate::domain::ports::{Job, WorkQueue};
use crate::error::{Error, Result};

/// Runs each job on the runtime's blocking pool. Jobs may run concurrently;
/// observations serialise their own deliveries.
#[derive(Debug, Clone)]
pub struct RuntimeQueue {
    label: String,
    handle: Handle,
}

impl RuntimeQueue {
    pub fn new(label: impl Into<String>, handle: Handle) -> Self {
        Self {
            label: label.into(),
            handle,
        }
    }

    /// Queue on the runtime the caller is running in.
    pub fn current(label: impl Into<String>) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Internal(format!("no tokio runtime: {e}")))?;
        Ok(Self::new(label, handle))
    }
}

impl WorkQueue for RuntimeQueue {
    fn enqueue(&self, job: Job) {
        // the JoinHandle is not needed; panics stay inside the task
        drop(self.handle.spawn_blocking(job));
    }

    fn label(&self) -> &str {
        &self.label
    }
}
