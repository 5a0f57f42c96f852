//! Wakeup Signals
//!
//! Payload-free "group changed" signals between relay instances.
//!
//! - [`InProcessWakeup`]: synchronous fan-out among managers sharing the
//!   instance; several managers on one `InProcessWakeup` behave like
//!   several processes on one machine
//! - [`PollingWakeup`]: real cross-process signal; `signal` bumps a counter
//!   file in the group container and a tokio task polls the counters

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::domain::ports::{GroupContainerProvider, HandlerToken, WakeupHandler, WakeupSignal};
use crate::error::Result;
use crate::relay::STORE_DIR;

/// group → handlers
#[derive(Default)]
struct HandlerTable {
    groups: RwLock<HashMap<String, Vec<(HandlerToken, WakeupHandler)>>>,
}

impl HandlerTable {
    fn add(&self, group: &str, handler: WakeupHandler) -> HandlerToken {
        let token = HandlerToken::next();
        self.groups
            .write()
            .entry(group.to_string())
            .or_default()
            .push((token, handler));
        token
    }

    fn remove(&self, token: HandlerToken) -> bool {
        let mut groups = self.groups.write();
        let mut removed = false;
        groups.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(t, _)| *t != token);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    fn handlers(&self, group: &str) -> Vec<WakeupHandler> {
        self.groups
            .read()
            .get(group)
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    fn groups(&self) -> Vec<String> {
        self.groups.read().keys().cloned().collect()
    }

    fn fire(&self, group: &str) {
        for handler in self.handlers(group) {
            handler(group);
        }
    }
}

// =============================================================================
// In-Process
// =============================================================================

/// Synchronous wakeup: `signal` runs every handler of the group before returning.
#[derive(Default)]
pub struct InProcessWakeup {
    table: HandlerTable,
    signals: AtomicU64,
}

impl InProcessWakeup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of signals sent so far.
    pub fn signal_count(&self) -> u64 {
        self.signals.load(Ordering::Relaxed)
    }
}

impl WakeupSignal for InProcessWakeup {
    fn subscribe(&self, group: &str, handler: WakeupHandler) -> HandlerToken {
        self.table.add(group, handler)
    }

    fn unsubscribe(&self, token: HandlerToken) -> bool {
        self.table.remove(token)
    }

    fn signal(&self, group: &str) -> Result<()> {
        self.signals.fetch_add(1, Ordering::Relaxed);
        trace!(group, "Wakeup");
        self.table.fire(group);
        Ok(())
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Polling wakeup configuration.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// How often counter files are checked
    pub interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
        }
    }
}

/// Cross-process wakeup through a counter file per group.
///
/// ```text
/// <container>/lifewatch/<group>.signal     decimal counter, replaced atomically
/// ```
pub struct PollingWakeup {
    containers: Arc<dyn GroupContainerProvider>,
    table: Arc<HandlerTable>,
    cancel: CancellationToken,
}

impl PollingWakeup {
    /// Create the signal and start its polling task on `runtime`.
    pub fn spawn(
        containers: Arc<dyn GroupContainerProvider>,
        config: PollingConfig,
        runtime: &Handle,
    ) -> Arc<Self> {
        let wakeup = Arc::new(Self {
            containers: containers.clone(),
            table: Arc::new(HandlerTable::default()),
            cancel: CancellationToken::new(),
        });

        let table = wakeup.table.clone();
        let cancel = wakeup.cancel.clone();
        runtime.spawn(async move {
            let mut seen: HashMap<String, u64> = HashMap::new();
            let mut ticker = tokio::time::interval(config.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for group in table.groups() {
                    let Ok(path) = signal_path(containers.as_ref(), &group) else {
                        continue;
                    };
                    let current = read_counter(&path);
                    let previous = *seen.entry(group.clone()).or_insert(current);
                    if current == previous {
                        continue;
                    }
                    seen.insert(group.clone(), current);
                    trace!(group, current, "Counter changed");
                    let table = table.clone();
                    // handlers do blocking file I/O and run user callbacks
                    if let Err(e) = tokio::task::spawn_blocking(move || table.fire(&group)).await {
                        warn!(error = %e, "Wakeup handler failed");
                    }
                }
            }
            debug!("Polling wakeup stopped");
        });
        wakeup
    }

    /// Stop polling. Handlers are no longer called afterwards.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl WakeupSignal for PollingWakeup {
    fn subscribe(&self, group: &str, handler: WakeupHandler) -> HandlerToken {
        self.table.add(group, handler)
    }

    fn unsubscribe(&self, token: HandlerToken) -> bool {
        self.table.remove(token)
    }

    fn signal(&self, group: &str) -> Result<()> {
        let path = signal_path(self.containers.as_ref(), group)?;
        let next = read_counter(&path).wrapping_add(1);
        // unique per call: several threads of one process may signal at once
        let tmp = path.with_extension(format!("signal.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, next.to_string())?;
        fs::rename(&tmp, &path)?;
        trace!(group, next, "Wakeup signalled");
        Ok(())
    }
}

impl Drop for PollingWakeup {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn signal_path(containers: &dyn GroupContainerProvider, group: &str) -> Result<PathBuf> {
    let dir = containers.container_for(group)?.join(STORE_DIR);
    fs::create_dir_all(&dir)?;
    Ok(dir.join(format!("{group}.signal")))
}

fn read_counter(path: &Path) -> u64 {
    match fs::read_to_string(path) {
        Ok(text) => text.trim().parse().unwrap_or(0),
        Err(e) if e.kind() == ErrorKind::NotFound => 0,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read wakeup counter");
            0
        }
    }
}
