//! Property Store
//!
//! A key/value object holding JSON values that reports changes by key path,
//! implementing the [`ChangeObservable`] port. Keys are opaque strings; a
//! dotted key such as `"account.name"` is one key, not a traversal.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::domain::lifeline::{Lifecycle, Lifeline};
use crate::domain::ports::{
    Change, ChangeHandler, ChangeKind, ChangeObservable, ChangeOptions, HandlerToken, Payload,
};

struct Registration {
    token: HandlerToken,
    options: ChangeOptions,
    handler: ChangeHandler,
}

/// Observable key/value object.
#[derive(Default)]
pub struct PropertyStore {
    lifeline: Lifeline,
    values: RwLock<BTreeMap<String, Payload>>,
    /// key path → handlers, in attach order
    handlers: RwLock<BTreeMap<String, Vec<Registration>>>,
}

impl PropertyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, key: &str) -> Option<Payload> {
        self.values.read().get(key).cloned()
    }

    /// Set a value, notifying observers of `key` with a Setting change.
    pub fn set(&self, key: &str, value: impl Into<Payload>) {
        let value = value.into();
        let old = self.get(key);
        self.notify_prior(key, ChangeKind::Setting, old.as_ref(), None);
        self.values.write().insert(key.to_string(), value.clone());
        self.notify(key, ChangeKind::Setting, old, Some(value), None);
    }

    /// Remove a value. Reported as a Setting change to no value.
    pub fn unset(&self, key: &str) -> Option<Payload> {
        let old = self.get(key)?;
        self.notify_prior(key, ChangeKind::Setting, Some(&old), None);
        self.values.write().remove(key);
        self.notify(key, ChangeKind::Setting, Some(old.clone()), None, None);
        Some(old)
    }

    /// Insert into the array stored at `key`. Returns false if `key` does not
    /// hold an array or `index` is out of bounds.
    pub fn insert_at(&self, key: &str, index: usize, value: impl Into<Payload>) -> bool {
        let value = value.into();
        let fits = matches!(self.get(key), Some(Payload::Array(items)) if index <= items.len());
        if !fits {
            return false;
        }
        self.notify_prior(key, ChangeKind::Insertion, None, Some(index));
        {
            let mut values = self.values.write();
            if let Some(Payload::Array(items)) = values.get_mut(key) {
                items.insert(index.min(items.len()), value.clone());
            }
        }
        self.notify(key, ChangeKind::Insertion, None, Some(value), Some(index));
        true
    }

    /// Remove from the array stored at `key`.
    pub fn remove_at(&self, key: &str, index: usize) -> Option<Payload> {
        let old = match self.get(key) {
            Some(Payload::Array(items)) => items.get(index).cloned()?,
            _ => return None,
        };
        self.notify_prior(key, ChangeKind::Removal, Some(&old), Some(index));
        {
            let mut values = self.values.write();
            if let Some(Payload::Array(items)) = values.get_mut(key) {
                if index < items.len() {
                    items.remove(index);
                }
            }
        }
        self.notify(key, ChangeKind::Removal, Some(old.clone()), None, Some(index));
        Some(old)
    }

    /// Replace an element of the array stored at `key`.
    pub fn replace_at(&self, key: &str, index: usize, value: impl Into<Payload>) -> Option<Payload> {
        let value = value.into();
        let old = match self.get(key) {
            Some(Payload::Array(items)) => items.get(index).cloned()?,
            _ => return None,
        };
        self.notify_prior(key, ChangeKind::Replacement, Some(&old), Some(index));
        {
            let mut values = self.values.write();
            if let Some(Payload::Array(items)) = values.get_mut(key) {
                if let Some(slot) = items.get_mut(index) {
                    *slot = value.clone();
                }
            }
        }
        self.notify(key, ChangeKind::Replacement, Some(old.clone()), Some(value), Some(index));
        Some(old)
    }

    /// Number of change handlers attached to `key`.
    pub fn observer_count(&self, key: &str) -> usize {
        self.handlers.read().get(key).map_or(0, Vec::len)
    }

    fn matching(&self, key: &str, wanted: impl Fn(ChangeOptions) -> bool) -> Vec<(ChangeOptions, ChangeHandler)> {
        self.handlers
            .read()
            .get(key)
            .into_iter()
            .flatten()
            .filter(|r| wanted(r.options))
            .map(|r| (r.options, r.handler.clone()))
            .collect()
    }

    fn notify_prior(&self, key: &str, kind: ChangeKind, old: Option<&Payload>, index: Option<usize>) {
        for (options, handler) in self.matching(key, |o| o.contains(ChangeOptions::PRIOR)) {
            handler(&Change {
                key_path: key.to_string(),
                kind,
                prior: true,
                old: old.filter(|_| options.contains(ChangeOptions::OLD)).cloned(),
                new: None,
                indexes: index.map(|i| vec![i]),
            });
        }
    }

    fn notify(&self, key: &str, kind: ChangeKind, old: Option<Payload>, new: Option<Payload>, index: Option<usize>) {
        let handlers = self.matching(key, |_| true);
        if handlers.is_empty() {
            return;
        }
        trace!(object = %self.object_id(), key, handlers = handlers.len(), "Notifying change");
        for (options, handler) in handlers {
            handler(&Change {
                key_path: key.to_string(),
                kind,
                prior: false,
                old: old.clone().filter(|_| options.contains(ChangeOptions::OLD)),
                new: new.clone().filter(|_| options.contains(ChangeOptions::NEW)),
                indexes: index.map(|i| vec![i]),
            });
        }
    }
}

impl Lifecycle for PropertyStore {
    fn lifeline(&self) -> &Lifeline {
        &self.lifeline
    }
}

impl ChangeObservable for PropertyStore {
    fn add_change_handler(&self, key_path: &str, options: ChangeOptions, handler: ChangeHandler) -> HandlerToken {
        let token = HandlerToken::next();
        self.handlers
            .write()
            .entry(key_path.to_string())
            .or_default()
            .push(Registration {
                token,
                options,
                handler: handler.clone(),
            });

        if options.contains(ChangeOptions::INITIAL) {
            handler(&Change {
                key_path: key_path.to_string(),
                kind: ChangeKind::Setting,
                prior: false,
                old: None,
                new: self.get(key_path).filter(|_| options.contains(ChangeOptions::NEW)),
                indexes: None,
            });
        }
        token
    }

    fn remove_change_handler(&self, token: HandlerToken) -> bool {
        let removed = {
            let mut handlers = self.handlers.write();
            let mut removed = None;
            handlers.retain(|_, registrations| {
                if let Some(position) = registrations.iter().position(|r| r.token == token) {
                    removed = Some(registrations.remove(position));
                }
                !registrations.is_empty()
            });
            removed
        };
        removed.is_some()
    }
}

impl std::fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyStore")
            .field("id", &self.object_id())
            .field("keys", &self.values.read().len())
            .finish()
    }
}
