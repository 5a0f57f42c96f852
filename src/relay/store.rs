//! Durable Group Store
//!
//! Shared state of one group, kept as a single JSON document inside the
//! group container:
//!
//! ```text
//! <container>/lifewatch/<group>.json        state
//! <container>/lifewatch/<group>.json.lock   held by the writer
//! ```
//!
//! Every mutation is read-modify-write under the lock file, and the new
//! document replaces the old one by atomic rename. Readers never take the
//! lock: they always see either the previous or the next complete document.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};
use uuid::Uuid;

use super::manager::DeliveryMode;
use crate::domain::ports::Payload;
use crate::error::{Error, Result};

/// Directory inside a group container that holds relay files.
pub const STORE_DIR: &str = "lifewatch";

/// Current document version.
pub const STORE_VERSION: u32 = 2;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(5);

// =============================================================================
// Document
// =============================================================================

/// One posted notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostedEntry {
    pub seq: u64,
    pub payload: Option<Payload>,
    pub posted_at: DateTime<Utc>,
}

/// Entries of one notification name, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationLog {
    pub next_seq: u64,
    pub entries: Vec<PostedEntry>,
}

impl Default for NotificationLog {
    fn default() -> Self {
        Self {
            next_seq: 1,
            entries: Vec::new(),
        }
    }
}

/// Subscription record of one application for one name.
///
/// Each delivery mode keeps its own cursor: the highest sequence number
/// handed to subscribers of that mode. A missing cursor means the app has
/// no subscription of that mode, live or retained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliable: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<u64>,
}

impl Checkpoint {
    pub fn cursor(&self, mode: DeliveryMode) -> Option<u64> {
        match mode {
            DeliveryMode::Reliable => self.reliable,
            DeliveryMode::LatestOnly => self.latest,
        }
    }

    fn cursor_mut(&mut self, mode: DeliveryMode) -> &mut Option<u64> {
        match mode {
            DeliveryMode::Reliable => &mut self.reliable,
            DeliveryMode::LatestOnly => &mut self.latest,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.reliable.is_none() && self.latest.is_none()
    }

    /// Oldest sequence number either cursor still depends on.
    fn floor(&self) -> Option<u64> {
        self.reliable.into_iter().chain(self.latest).min()
    }
}

/// Full durable state of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    #[serde(default)]
    pub notifications: BTreeMap<String, NotificationLog>,
    /// app identifier → name → checkpoint
    #[serde(default)]
    pub subscribers: BTreeMap<String, BTreeMap<String, Checkpoint>>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            notifications: BTreeMap::new(),
            subscribers: BTreeMap::new(),
        }
    }
}

impl StoreSnapshot {
    /// Sequence number of the newest entry ever posted under `name`, 0 if none.
    pub fn head_seq(&self, name: &str) -> u64 {
        self.notifications
            .get(name)
            .map_or(0, |log| log.next_seq.saturating_sub(1))
    }

    /// Whether any application holds a subscriber record for `name`.
    pub fn has_subscribers(&self, name: &str) -> bool {
        self.subscribers
            .values()
            .any(|names| names.get(name).is_some_and(|checkpoint| !checkpoint.is_empty()))
    }

    pub fn checkpoint(&self, app: &str, name: &str) -> Option<Checkpoint> {
        self.subscribers.get(app)?.get(name).copied()
    }

    pub fn entries(&self, name: &str) -> &[PostedEntry] {
        self.notifications
            .get(name)
            .map(|log| log.entries.as_slice())
            .unwrap_or(&[])
    }

    /// Entries of `name` newer than `after`, oldest first.
    pub fn entries_after(&self, name: &str, after: u64) -> Vec<PostedEntry> {
        self.entries(name)
            .iter()
            .filter(|entry| entry.seq > after)
            .cloned()
            .collect()
    }

    pub(crate) fn append(&mut self, name: &str, payload: Option<Payload>, posted_at: DateTime<Utc>) -> u64 {
        let log = self.notifications.entry(name.to_string()).or_default();
        let seq = log.next_seq;
        log.next_seq += 1;
        log.entries.push(PostedEntry {
            seq,
            payload,
            posted_at,
        });
        seq
    }

    /// Move the `mode` cursor of `app` for `name` forward to `seq`. Never
    /// moves back and never creates a cursor.
    pub(crate) fn advance(&mut self, app: &str, name: &str, mode: DeliveryMode, seq: u64) {
        if let Some(cursor) = self
            .subscribers
            .get_mut(app)
            .and_then(|names| names.get_mut(name))
            .and_then(|checkpoint| checkpoint.cursor_mut(mode).as_mut())
        {
            *cursor = (*cursor).max(seq);
        }
    }

    pub(crate) fn set_cursor(&mut self, app: &str, name: &str, mode: DeliveryMode, seq: u64) {
        let checkpoint = self
            .subscribers
            .entry(app.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default();
        *checkpoint.cursor_mut(mode) = Some(seq);
    }

    /// Forget the `mode` cursor; the record goes once no cursor is left.
    pub(crate) fn clear_cursor(&mut self, app: &str, name: &str, mode: DeliveryMode) {
        let Some(names) = self.subscribers.get_mut(app) else {
            return;
        };
        if let Some(checkpoint) = names.get_mut(name) {
            *checkpoint.cursor_mut(mode) = None;
            if checkpoint.is_empty() {
                names.remove(name);
            }
        }
        if names.is_empty() {
            self.subscribers.remove(app);
        }
    }

    /// Drop entries of `name` every subscriber has already received.
    ///
    /// With no subscriber left nothing can ever consume them, so all go.
    pub(crate) fn prune(&mut self, name: &str) -> usize {
        let floor = self
            .subscribers
            .values()
            .filter_map(|names| names.get(name))
            .filter_map(Checkpoint::floor)
            .min();
        let Some(log) = self.notifications.get_mut(name) else {
            return 0;
        };
        let before = log.entries.len();
        match floor {
            Some(floor) => log.entries.retain(|entry| entry.seq > floor),
            None => log.entries.clear(),
        }
        before - log.entries.len()
    }

    pub(crate) fn prune_all(&mut self) -> usize {
        let names: Vec<String> = self.notifications.keys().cloned().collect();
        names.iter().map(|name| self.prune(name)).sum()
    }
}

// =============================================================================
// File Lock
// =============================================================================

/// Exclusive lock file, removed on drop.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(path: &Path, timeout: Duration, stale_after: Duration) -> Result<Self> {
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    // owner pid is informational only
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if Self::is_stale(path, stale_after) && Self::break_stale(path, stale_after) {
                        continue;
                    }
                    if started.elapsed() >= timeout {
                        return Err(Error::StoreLocked {
                            path: path.to_path_buf(),
                        });
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Take an abandoned lock out of the way.
    ///
    /// The lock is renamed to a name private to this caller, so of several
    /// processes breaking the same lock only one succeeds; the rest see it gone
    /// and go back to `create_new`. If what was moved turns out to be a fresh
    /// lock taken after the staleness check, it is linked back in place.
    fn break_stale(path: &Path, stale_after: Duration) -> bool {
        let aside = path.with_extension(format!("lock.{}.stale", Uuid::new_v4().simple()));
        if let Err(e) = fs::rename(path, &aside) {
            trace!(path = %path.display(), error = %e, "Stale lock already taken over");
            return e.kind() == ErrorKind::NotFound;
        }
        if Self::is_stale(&aside, stale_after) {
            warn!(path = %path.display(), "Broke stale store lock");
        } else if let Err(e) = fs::hard_link(&aside, path) {
            warn!(path = %path.display(), error = %e, "Failed to put back a live store lock");
        }
        if let Err(e) = fs::remove_file(&aside) {
            warn!(path = %aside.display(), error = %e, "Failed to remove broken store lock");
        }
        true
    }

    fn is_stale(path: &Path, stale_after: Duration) -> bool {
        fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > stale_after)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release store lock");
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Handle on the durable state file of one group.
pub struct GroupStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    stale_lock_after: Duration,
    /// Serialises writers within this process before the file lock
    local: Mutex<()>,
}

impl GroupStore {
    /// Open (creating the directory if needed) the store of `group` in `container`.
    pub fn open(container: &Path, group: &str, lock_timeout: Duration, stale_lock_after: Duration) -> Result<Self> {
        let dir = container.join(STORE_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{group}.json"));
        let lock_path = dir.join(format!("{group}.json.lock"));
        Ok(Self {
            path,
            lock_path,
            lock_timeout,
            stale_lock_after,
            local: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state; a missing file reads as empty.
    pub fn read(&self) -> Result<StoreSnapshot> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoreSnapshot::default()),
            Err(e) => return Err(e.into()),
        };
        let snapshot: StoreSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| Error::StoreCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        if snapshot.version > STORE_VERSION {
            return Err(Error::StoreCorrupt {
                path: self.path.clone(),
                reason: format!("unsupported version {}", snapshot.version),
            });
        }
        Ok(snapshot)
    }

    /// Read-modify-write under the lock. Nothing is written if `f` fails.
    pub fn update<T>(&self, f: impl FnOnce(&mut StoreSnapshot) -> Result<T>) -> Result<T> {
        let _local = self.local.lock();
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout, self.stale_lock_after)?;
        let mut snapshot = self.read()?;
        let out = f(&mut snapshot)?;
        self.write(&snapshot)?;
        Ok(out)
    }

    fn write(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", std::process::id()));
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        trace!(path = %self.path.display(), "Store written");
        Ok(())
    }
}

impl std::fmt::Debug for GroupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupStore").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> GroupStore {
        GroupStore::open(dir.path(), "group.test", Duration::from_millis(50), Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let snapshot = store(&dir).read().unwrap();
        assert_eq!(snapshot, StoreSnapshot::default());
        assert_eq!(snapshot.head_seq("sync"), 0);
    }

    #[test]
    fn test_update_persists_and_sequences() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let first = store.update(|s| Ok(s.append("sync", Some(json!(1)), Utc::now()))).unwrap();
        let second = store.update(|s| Ok(s.append("sync", None, Utc::now()))).unwrap();
        assert_eq!((first, second), (1, 2));

        let reopened = GroupStore::open(dir.path(), "group.test", Duration::from_millis(50), Duration::from_secs(60)).unwrap();
        let snapshot = reopened.read().unwrap();
        assert_eq!(snapshot.head_seq("sync"), 2);
        assert_eq!(snapshot.entries_after("sync", 1).len(), 1);
        assert!(!dir.path().join(STORE_DIR).join("group.test.json.lock").exists());
    }

    #[test]
    fn test_failed_update_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let result: Result<()> = store.update(|s| {
            s.append("sync", None, Utc::now());
            Err(Error::Internal("abort".to_string()))
        });
        assert!(result.is_err());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_held_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::write(dir.path().join(STORE_DIR).join("group.test.json.lock"), "1").unwrap();
        let result = store.update(|_| Ok(()));
        assert_matches!(result, Err(Error::StoreLocked { .. }));
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let store = GroupStore::open(dir.path(), "group.test", Duration::from_millis(200), Duration::ZERO).unwrap();
        fs::write(dir.path().join(STORE_DIR).join("group.test.json.lock"), "1").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(store.update(|_| Ok(())).is_ok());
        assert_eq!(fs::read_dir(dir.path().join(STORE_DIR)).unwrap().count(), 1);
    }

    #[test]
    fn test_live_lock_is_put_back() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("group.test.json.lock");
        fs::write(&lock, "4242").unwrap();

        // judged stale a moment ago, but fresh by the time it is moved
        assert!(FileLock::break_stale(&lock, Duration::from_secs(60)));
        assert_eq!(fs::read_to_string(&lock).unwrap(), "4242");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        fs::remove_file(&lock).unwrap();
        assert!(FileLock::break_stale(&lock, Duration::from_secs(60)));
        assert!(!lock.exists());
    }

    #[test]
    fn test_racing_writers_break_stale_lock_once() {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join(STORE_DIR);
        fs::create_dir_all(&store_dir).unwrap();
        fs::write(store_dir.join("group.test.json.lock"), "1").unwrap();
        std::thread::sleep(Duration::from_millis(250));

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let root = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    let store = GroupStore::open(&root, "group.test", Duration::from_secs(5), Duration::from_millis(200)).unwrap();
                    store.update(|s| Ok(s.append("sync", None, Utc::now()))).unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let snapshot = store(&dir).read().unwrap();
        assert_eq!(snapshot.head_seq("sync"), 8);
        assert_eq!(snapshot.entries("sync").len(), 8);
    }

    #[test]
    fn test_corrupt_file_reported() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::write(store.path(), "{not json").unwrap();
        assert_matches!(store.read(), Err(Error::StoreCorrupt { .. }));
    }

    #[test]
    fn test_prune_keeps_entries_someone_still_needs() {
        let mut s = StoreSnapshot::default();
        for i in 0..4 {
            s.append("sync", Some(json!(i)), Utc::now());
        }
        s.set_cursor("a", "sync", DeliveryMode::Reliable, 1);
        s.set_cursor("b", "sync", DeliveryMode::LatestOnly, 3);

        assert_eq!(s.prune("sync"), 1);
        assert_eq!(s.entries("sync").first().map(|e| e.seq), Some(2));

        s.advance("a", "sync", DeliveryMode::Reliable, 4);
        s.advance("a", "sync", DeliveryMode::Reliable, 2);
        assert_eq!(s.checkpoint("a", "sync").unwrap().reliable, Some(4));
        assert_eq!(s.prune("sync"), 2);

        s.clear_cursor("a", "sync", DeliveryMode::Reliable);
        s.clear_cursor("b", "sync", DeliveryMode::LatestOnly);
        assert!(s.subscribers.is_empty());
        assert_eq!(s.prune_all(), 1);
        assert_eq!(s.head_seq("sync"), 4);
    }

    #[test]
    fn test_cursors_of_one_app_are_independent() {
        let mut s = StoreSnapshot::default();
        for i in 0..3 {
            s.append("sync", Some(json!(i)), Utc::now());
        }
        s.set_cursor("a", "sync", DeliveryMode::Reliable, 1);
        s.set_cursor("a", "sync", DeliveryMode::LatestOnly, 3);
        s.advance("a", "sync", DeliveryMode::LatestOnly, 5);

        let checkpoint = s.checkpoint("a", "sync").unwrap();
        assert_eq!(checkpoint.cursor(DeliveryMode::Reliable), Some(1));
        assert_eq!(checkpoint.cursor(DeliveryMode::LatestOnly), Some(5));
        assert_eq!(s.prune("sync"), 1);

        s.clear_cursor("a", "sync", DeliveryMode::LatestOnly);
        assert!(s.has_subscribers("sync"));
        assert_eq!(s.checkpoint("a", "sync").unwrap().reliable, Some(1));
        // advancing a cursor the app never had creates nothing
        s.advance("a", "sync", DeliveryMode::LatestOnly, 3);
        assert_eq!(s.checkpoint("a", "sync").unwrap().latest, None);
    }

    #[test]
    fn test_checkpoint_document_omits_missing_cursors() {
        let checkpoint = Checkpoint {
            reliable: Some(2),
            latest: None,
        };
        assert_eq!(serde_json::to_value(checkpoint).unwrap(), json!({"reliable": 2}));
        let parsed: Checkpoint = serde_json::from_value(json!({"latest": 7})).unwrap();
        assert_eq!(parsed.cursor(DeliveryMode::LatestOnly), Some(7));
        assert_eq!(parsed.reliable, None);
    }
}
