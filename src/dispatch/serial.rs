//! Serial work queue backed by a dedicated thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use tracing::{debug, error, warn};

use crate::domain::ports::{Job, WorkQueue};
use crate::error::{Error, Result};

/// FIFO queue with one worker thread.
///
/// The worker stops once the queue is dropped and the jobs already
/// enqueued have run.
pub struct SerialQueue {
    label: String,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl SerialQueue {
    pub fn new(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let (sender, receiver) = channel::unbounded::<Job>();
        let thread_label = label.clone();
        let worker = thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                for job in receiver {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!(queue = %thread_label, "Job panicked");
                    }
                }
                debug!(queue = %thread_label, "Serial queue worker stopped");
            })
            .map_err(|e| Error::Internal(format!("failed to spawn queue worker {label}: {e}")))?;

        Ok(Self {
            label,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Block until every job enqueued before this call has run.
    ///
    /// Must not be called from a job on this queue.
    pub fn flush(&self) {
        let (done, wait) = channel::bounded::<()>(1);
        self.enqueue(Box::new(move || {
            let _ = done.send(());
        }));
        let _ = wait.recv();
    }
}

impl WorkQueue for SerialQueue {
    fn enqueue(&self, job: Job) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(job).is_err() {
            warn!(queue = %self.label, "Queue worker gone, job dropped");
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            // the last handle can be released by a job on the worker itself
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue").field("label", &self.label).finish()
    }
}
