//! Listener registry shared by vars and computed nodes.
//!
//! Registrations live in a slab so that each one gets a stable key the caller
//! hands back to unsubscribe. Dispatch never iterates the slab directly: it
//! takes a snapshot of the `Rc`s first, so a listener may register or remove
//! listeners (including itself) or read values while being notified.

use slab::Slab;
use std::fmt;
use std::rc::Rc;

/// Handle returned when registering a listener; pass it back to unregister.
///
/// Keys are only meaningful for the node and listener kind that issued them.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ListenerKey(usize);

impl ListenerKey {
    fn new(index: usize) -> Self {
        Self(index)
    }

    fn index(self) -> usize {
        self.0
    }
}

/// A set of listeners of one kind
pub struct ListenerSet<F: ?Sized> {
    entries: Slab<Rc<F>>,
}

impl<F: ?Sized> ListenerSet<F> {
    /// Create an empty set
    pub const fn new() -> Self {
        Self {
            entries: Slab::new(),
        }
    }

    /// Register a listener
    pub fn insert(&mut self, listener: Rc<F>) -> ListenerKey {
        ListenerKey::new(self.entries.insert(listener))
    }

    /// Unregister a listener. Returns false if the key was not registered.
    pub fn remove(&mut self, key: ListenerKey) -> bool {
        self.entries.try_remove(key.index()).is_some()
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no listener is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every registration
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Clone out the current listeners for dispatch
    pub fn snapshot(&self) -> Vec<Rc<F>> {
        self.entries.iter().map(|(_, l)| l.clone()).collect()
    }
}

impl<F: ?Sized> Default for ListenerSet<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> fmt::Debug for ListenerSet<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.entries.len())
            .finish()
    }
}
