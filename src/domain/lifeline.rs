//! Object Identity and Destruction Hooks
//!
//! Every object that can take part in an observation (as observer or as
//! observee) embeds a [`Lifeline`]. The lifeline gives the object a stable
//! identity and a list of disposers that run exactly once when the object is
//! dropped. Observations refer to participants through an [`Anchor`], which
//! never keeps the participant alive.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use lifewatch::domain::lifeline::{Anchor, Lifecycle, Lifeline};
//!
//! struct Player {
//!     lifeline: Lifeline,
//! }
//!
//! impl Lifecycle for Player {
//!     fn lifeline(&self) -> &Lifeline {
//!         &self.lifeline
//!     }
//! }
//!
//! let player = Arc::new(Player { lifeline: Lifeline::new() });
//! let anchor = Anchor::new(&player);
//! assert!(anchor.is_alive());
//! drop(player);
//! assert!(!anchor.is_alive());
//! ```

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Identity
// =============================================================================

/// Identity of a participating object.
///
/// Allocated from a process-wide counter and never reused, so a stale id can
/// never alias a newer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Handle returned when installing a disposer, used to uninstall it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisposerToken(u64);

/// Callback run when the owning object is destroyed.
pub type Disposer = Box<dyn FnOnce() + Send>;

// =============================================================================
// Disposer List
// =============================================================================

struct DisposerList {
    owner: ObjectId,
    next_token: AtomicU64,
    /// `None` once the owner has been finalised
    hooks: Mutex<Option<BTreeMap<u64, Disposer>>>,
}

impl DisposerList {
    fn new(owner: ObjectId) -> Self {
        Self {
            owner,
            next_token: AtomicU64::new(1),
            hooks: Mutex::new(Some(BTreeMap::new())),
        }
    }

    fn add(&self, disposer: Disposer) -> Option<DisposerToken> {
        let mut hooks = self.hooks.lock();
        let hooks = hooks.as_mut()?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        hooks.insert(token, disposer);
        Some(DisposerToken(token))
    }

    fn remove(&self, token: DisposerToken) -> bool {
        let removed = {
            let mut hooks = self.hooks.lock();
            hooks.as_mut().and_then(|h| h.remove(&token.0))
        };
        // dropped outside the lock: a disposer may own the last reference to something
        removed.is_some()
    }

    fn len(&self) -> usize {
        self.hooks.lock().as_ref().map_or(0, BTreeMap::len)
    }

    fn finalize(&self) {
        let hooks = self.hooks.lock().take();
        let Some(hooks) = hooks else {
            return;
        };
        trace!(object = %self.owner, disposers = hooks.len(), "Running disposers");
        for (_, disposer) in hooks {
            disposer();
        }
    }
}

// =============================================================================
// Lifeline
// =============================================================================

/// Identity plus destruction hooks, embedded in each participating object.
///
/// Dropping the lifeline (normally because its owner is dropped) closes the
/// disposer list and runs every installed disposer exactly once, on the
/// dropping thread.
pub struct Lifeline {
    id: ObjectId,
    disposers: Arc<DisposerList>,
}

impl Lifeline {
    pub fn new() -> Self {
        let id = ObjectId::next();
        Self {
            id,
            disposers: Arc::new(DisposerList::new(id)),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Install a disposer. Returns `None` if the owner is already being destroyed.
    pub fn add_disposer(&self, disposer: impl FnOnce() + Send + 'static) -> Option<DisposerToken> {
        self.disposers.add(Box::new(disposer))
    }

    pub fn remove_disposer(&self, token: DisposerToken) -> bool {
        self.disposers.remove(token)
    }

    /// Number of disposers still waiting for the owner's destruction.
    pub fn disposer_count(&self) -> usize {
        self.disposers.len()
    }
}

impl Default for Lifeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifeline")
            .field("id", &self.id)
            .field("disposers", &self.disposers.len())
            .finish()
    }
}

impl Drop for Lifeline {
    fn drop(&mut self) {
        self.disposers.finalize();
    }
}

/// Capability of an object to take part in observations.
pub trait Lifecycle: Any + Send + Sync {
    fn lifeline(&self) -> &Lifeline;

    fn object_id(&self) -> ObjectId {
        self.lifeline().id()
    }
}

// =============================================================================
// Anchor
// =============================================================================

/// Non-owning reference to a participating object.
#[derive(Clone)]
pub struct Anchor {
    id: ObjectId,
    type_id: TypeId,
    type_name: &'static str,
    target: Weak<dyn Any + Send + Sync>,
    disposers: Weak<DisposerList>,
}

impl Anchor {
    pub fn new<T: Lifecycle>(object: &Arc<T>) -> Self {
        let weak: Weak<T> = Arc::downgrade(object);
        let target: Weak<dyn Any + Send + Sync> = weak;
        let lifeline = object.lifeline();
        Self {
            id: lifeline.id(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            target,
            disposers: Arc::downgrade(&lifeline.disposers),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// `TypeId` of the concrete object type this anchor was made from.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }

    pub fn upgrade(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.target.upgrade()
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.upgrade()?.downcast::<T>().ok()
    }

    pub(crate) fn add_disposer(&self, disposer: impl FnOnce() + Send + 'static) -> Option<DisposerToken> {
        self.disposers.upgrade()?.add(Box::new(disposer))
    }

    pub(crate) fn remove_disposer(&self, token: DisposerToken) -> bool {
        match self.disposers.upgrade() {
            Some(list) => list.remove(token),
            None => false,
        }
    }
}

impl PartialEq for Anchor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Anchor {}

impl fmt::Debug for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Anchor")
            .field("id", &self.id)
            .field("type", &self.type_name)
            .field("alive", &self.is_alive())
            .finish()
    }
}
