//! Per-session action registry.
//!
//! Widgets register callbacks under opaque ids; the client invokes them by
//! passing the id back in a later request. Ids come from a process-wide
//! monotonic counter and are never reused while registered, so a stale id
//! from an old page render can never alias a newer callback.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::AppError;
use crate::session::SessionCx;

pub type ActionId = u64;

/// An action callback with its captured context.
pub type ActionFn = Arc<dyn Fn(&mut SessionCx<'_>) -> Result<(), AppError> + Send + Sync>;

static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Map from action id to callback, owned by one session.
#[derive(Default)]
pub struct ActionRegistry {
    entries: BTreeMap<ActionId, ActionFn>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback under a fresh, strictly increasing id.
    pub fn register(&mut self, callback: ActionFn) -> ActionId {
        let id = NEXT_ACTION_ID.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, callback);
        id
    }

    /// Look up the callback for an id, if still registered.
    pub fn get(&self, id: ActionId) -> Option<ActionFn> {
        self.entries.get(&id).map(Arc::clone)
    }

    /// Remove an action. Returns false if the id was not registered.
    pub fn unregister(&mut self, id: ActionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Currently registered ids, in increasing order.
    pub fn ids(&self) -> Vec<ActionId> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
