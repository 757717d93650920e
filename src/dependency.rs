//! What a computed node needs from the values it depends on.

use crate::error::Result;
use crate::listeners::ListenerKey;
use std::rc::Rc;

/// Callback registered on a dependency. Notifications carry no payload.
pub type Callback = Rc<dyn Fn()>;

/// The three kinds of notification a dependency sends
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ListenerKind {
    /// The value changed
    Change,
    /// The value is about to change and should be treated as out of date
    Stale,
    /// The dependency was disposed
    Dispose,
}

/// An upstream observable a computed node can depend on
///
/// A node never owns its dependencies: it registers callbacks while it needs
/// them and removes them again with the returned keys. One dependency may be
/// shared by any number of nodes.
///
/// Implementations must deliver callbacks on the realm the node lives in and
/// must tolerate a callback unsubscribing itself while it is being invoked.
pub trait Dependency {
    /// Register a callback for value changes
    fn subscribe_change(&self, callback: Callback) -> Result<ListenerKey>;

    /// Remove a change callback
    fn unsubscribe_change(&self, key: ListenerKey) -> Result<()>;

    /// Register a callback for staleness
    fn subscribe_stale(&self, callback: Callback) -> Result<ListenerKey>;

    /// Remove a stale callback
    fn unsubscribe_stale(&self, key: ListenerKey) -> Result<()>;

    /// Register a callback for disposal
    fn subscribe_dispose(&self, callback: Callback) -> Result<ListenerKey>;

    /// Remove a dispose callback
    fn unsubscribe_dispose(&self, key: ListenerKey) -> Result<()>;

    /// Register a callback for the given kind of notification
    fn subscribe(&self, kind: ListenerKind, callback: Callback) -> Result<ListenerKey> {
        match kind {
            ListenerKind::Change => self.subscribe_change(callback),
            ListenerKind::Stale => self.subscribe_stale(callback),
            ListenerKind::Dispose => self.subscribe_dispose(callback),
        }
    }

    /// Remove a callback of the given kind
    fn unsubscribe(&self, kind: ListenerKind, key: ListenerKey) -> Result<()> {
        match kind {
            ListenerKind::Change => self.unsubscribe_change(key),
            ListenerKind::Stale => self.unsubscribe_stale(key),
            ListenerKind::Dispose => self.unsubscribe_dispose(key),
        }
    }
}

/// A dependency that also exposes its current value
///
/// Compute functions read their inputs through this.
pub trait ObservableValue<T>: Dependency {
    /// Current value
    fn value(&self) -> Result<T>;
}
