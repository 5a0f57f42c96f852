//! Event Sinks
//!
//! `EventPublisher` adapters: the tracing log, an append-only JSON-lines
//! event log, a fan-out over several sinks, and an in-memory collector used
//! by tests.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::domain::events::{ObservationEvent, RemovalReason};
use crate::domain::ports::EventPublisher;
use crate::error::Result;

// =============================================================================
// Tracing
// =============================================================================

/// Writes events to the tracing system.
///
/// Teardowns nobody asked for explicitly, resumed reliable subscriptions and
/// deregistered groups are logged at info; the steady stream of posts and
/// deliveries stays at debug unless `verbose`.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    verbose: bool,
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log every event at info.
    pub fn verbose() -> Self {
        Self { verbose: true }
    }

    fn is_notable(event: &ObservationEvent) -> bool {
        match event {
            ObservationEvent::Removed { reason, .. } => *reason != RemovalReason::Explicit,
            ObservationEvent::GroupSubscribed { resumed, .. } => *resumed,
            ObservationEvent::GroupDeregistered { .. } => true,
            _ => false,
        }
    }
}

impl EventPublisher for LoggingEventPublisher {
    fn publish(&self, event: ObservationEvent) -> Result<()> {
        let event_type = event.event_type();
        let json = serde_json::to_string(&event)?;

        if self.verbose || Self::is_notable(&event) {
            info!(event_type, event = %json, "Lifecycle event");
        } else {
            debug!(event_type, event = %json, "Lifecycle event");
        }
        Ok(())
    }
}

// =============================================================================
// JSON Lines Log
// =============================================================================

/// Appends each event as one JSON object per line.
#[derive(Debug)]
pub struct EventLogWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl EventLogWriter {
    /// Open `path` for appending, creating it if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventPublisher for EventLogWriter {
    fn publish(&self, event: ObservationEvent) -> Result<()> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        // one write per line so concurrent writers never interleave inside it
        self.file.lock().write_all(&line)?;
        Ok(())
    }
}

// =============================================================================
// Fan-out
// =============================================================================

/// Hands every event to each of its sinks.
///
/// A failing sink does not keep the event from the others; the first error
/// is returned once all sinks have been tried.
#[derive(Default)]
pub struct FanoutEventPublisher {
    sinks: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventPublisher>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for FanoutEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutEventPublisher")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl EventPublisher for FanoutEventPublisher {
    fn publish(&self, event: ObservationEvent) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event.clone()) {
                warn!(event_type = event.event_type(), error = %e, "Event sink failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

// =============================================================================
// In-Memory
// =============================================================================

/// Keeps every event for later inspection.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: RwLock<Vec<ObservationEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservationEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<ObservationEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Events concerning one observation.
    pub fn events_for_observation(&self, observation_id: u64) -> Vec<ObservationEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.observation_id() == Some(observation_id))
            .cloned()
            .collect()
    }
}

impl EventPublisher for InMemoryEventCollector {
    fn publish(&self, event: ObservationEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    struct FailingSink;

    impl EventPublisher for FailingSink {
        fn publish(&self, _event: ObservationEvent) -> Result<()> {
            Err(Error::Internal("sink offline".to_string()))
        }
    }

    #[test]
    fn test_notable_events() {
        assert!(LoggingEventPublisher::is_notable(&ObservationEvent::removed(
            1,
            "key_path",
            RemovalReason::ObserverDestroyed
        )));
        assert!(!LoggingEventPublisher::is_notable(&ObservationEvent::removed(
            1,
            "key_path",
            RemovalReason::Explicit
        )));
        assert!(LoggingEventPublisher::is_notable(&ObservationEvent::group_subscribed(
            "group.test",
            "sync",
            true,
            true
        )));
        assert!(!LoggingEventPublisher::is_notable(&ObservationEvent::group_posted(
            "group.test",
            "sync",
            1
        )));

        LoggingEventPublisher::verbose()
            .publish(ObservationEvent::group_registered("group.test"))
            .unwrap();
    }

    #[test]
    fn test_event_log_appends_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        {
            let log = EventLogWriter::open(&path).unwrap();
            log.publish(ObservationEvent::group_posted("group.test", "sync", 1)).unwrap();
        }
        let log = EventLogWriter::open(&path).unwrap();
        assert_eq!(log.path(), path.as_path());
        log.publish(ObservationEvent::removed(7, "notification", RemovalReason::ObjectDestroyed))
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let events: Vec<ObservationEvent> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type(), "GroupPosted");
        assert_eq!(events[1].observation_id(), Some(7));
    }

    #[test]
    fn test_in_memory_collector() {
        let collector = InMemoryEventCollector::new();
        assert!(collector.is_empty());

        collector
            .publish(ObservationEvent::registered(1, "key_path", Some(2), Some(3)))
            .unwrap();
        collector
            .publish(ObservationEvent::removed(1, "key_path", RemovalReason::ObjectDestroyed))
            .unwrap();
        collector
            .publish(ObservationEvent::group_posted("group.test", "sync", 1))
            .unwrap();

        assert_eq!(collector.len(), 3);
        assert_eq!(collector.events_of_type("Removed").len(), 1);
        assert_eq!(collector.events_for_observation(1).len(), 2);

        collector.clear();
        assert!(collector.is_empty());
    }

    #[test]
    fn test_fanout_reaches_sinks_after_failure() {
        let before = Arc::new(InMemoryEventCollector::new());
        let after = Arc::new(InMemoryEventCollector::new());
        let fanout = FanoutEventPublisher::new()
            .with(before.clone())
            .with(Arc::new(FailingSink))
            .with(after.clone());
        assert_eq!(fanout.len(), 3);

        let result = fanout.publish(ObservationEvent::group_registered("group.test"));
        assert_matches!(result, Err(Error::Internal(_)));
        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 1);

        assert!(FanoutEventPublisher::new()
            .publish(ObservationEvent::group_registered("group.test"))
            .is_ok());
    }
}
