//! Settable observable values.

use crate::dependency::{Callback, Dependency, ListenerKind, ObservableValue};
use crate::error::{Error, Result};
use crate::listeners::{ListenerKey, ListenerSet};
use crate::realm::{NodeId, Realm};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A settable observable value
///
/// `Var` is the usual leaf of a dependency graph: compute functions read it,
/// and setting it notifies everything listening for changes. The value lives
/// in the var; clones of the handle share it.
///
/// # Example
/// ```ignore
/// let realm = Realm::new();
/// let first = Var::new(&realm, String::from("a"));
/// let last = Var::new(&realm, String::from("b"));
///
/// let full = {
///     let (first, last) = (first.clone(), last.clone());
///     Computed::builder(&realm)
///         .dependency(first.clone())
///         .dependency(last.clone())
///         .build(move || Ok(first.get()? + &last.get()?))
/// };
///
/// assert_eq!(full.get_value()?, "ab");
/// first.set("c".into())?;
/// assert_eq!(full.get_value()?, "cb");
/// ```
pub struct Var<T> {
    inner: Rc<VarInner<T>>,
}

struct VarInner<T> {
    id: NodeId,
    realm: Realm,
    state: RefCell<VarState<T>>,
}

struct VarState<T> {
    value: T,
    stale: bool,
    disposed: bool,
    change: ListenerSet<dyn Fn()>,
    stale_listeners: ListenerSet<dyn Fn()>,
    dispose: ListenerSet<dyn Fn()>,
}

impl<T> VarState<T> {
    fn listeners(&mut self, kind: ListenerKind) -> &mut ListenerSet<dyn Fn()> {
        match kind {
            ListenerKind::Change => &mut self.change,
            ListenerKind::Stale => &mut self.stale_listeners,
            ListenerKind::Dispose => &mut self.dispose,
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            Err(Error::Disposed { node: "var" })
        } else {
            Ok(())
        }
    }
}

impl<T> Var<T> {
    /// Create a var holding `value`
    pub fn new(realm: &Realm, value: T) -> Self {
        Self {
            inner: Rc::new(VarInner {
                id: realm.next_node_id(),
                realm: realm.clone(),
                state: RefCell::new(VarState {
                    value,
                    stale: false,
                    disposed: false,
                    change: ListenerSet::new(),
                    stale_listeners: ListenerSet::new(),
                    dispose: ListenerSet::new(),
                }),
            }),
        }
    }

    /// Identifier of this var within its realm
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// The realm this var belongs to
    pub fn realm(&self) -> &Realm {
        &self.inner.realm
    }

    /// Current value
    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        let state = self.inner.state.borrow();
        state.ensure_live()?;
        Ok(state.value.clone())
    }

    /// Replace the value, notifying change listeners if it differs
    ///
    /// Setting a value also ends staleness.
    pub fn set(&self, value: T) -> Result<()>
    where
        T: PartialEq,
    {
        let listeners = {
            let mut state = self.inner.state.borrow_mut();
            state.ensure_live()?;
            state.stale = false;
            if state.value == value {
                return Ok(());
            }
            state.value = value;
            state.change.snapshot()
        };
        tracing::trace!(node = %self.inner.id, listeners = listeners.len(), "var changed");
        for listener in listeners {
            listener();
        }
        Ok(())
    }

    /// Announce that the value is out of date and a new one is coming
    ///
    /// Stale listeners are notified once; repeated calls before the next
    /// [`set`](Self::set) do nothing.
    pub fn mark_stale(&self) -> Result<()> {
        let listeners = {
            let mut state = self.inner.state.borrow_mut();
            state.ensure_live()?;
            if state.stale {
                return Ok(());
            }
            state.stale = true;
            state.stale_listeners.snapshot()
        };
        for listener in listeners {
            listener();
        }
        Ok(())
    }

    /// True between [`mark_stale`](Self::mark_stale) and the next `set`
    pub fn is_stale(&self) -> Result<bool> {
        let state = self.inner.state.borrow();
        state.ensure_live()?;
        Ok(state.stale)
    }

    /// Dispose the var
    ///
    /// Dispose listeners are notified, then every registration is dropped.
    /// Any later operation fails with [`Error::Disposed`].
    pub fn dispose(&self) -> Result<()> {
        let listeners = {
            let mut state = self.inner.state.borrow_mut();
            state.ensure_live()?;
            state.disposed = true;
            state.dispose.snapshot()
        };
        tracing::debug!(node = %self.inner.id, "var disposed");
        for listener in listeners {
            listener();
        }
        let mut state = self.inner.state.borrow_mut();
        state.change.clear();
        state.stale_listeners.clear();
        state.dispose.clear();
        Ok(())
    }

    /// True once [`dispose`](Self::dispose) was called
    pub fn is_disposed(&self) -> bool {
        self.inner.state.borrow().disposed
    }

    /// Number of callbacks currently registered for `kind`
    pub fn listener_count(&self, kind: ListenerKind) -> usize {
        let state = self.inner.state.borrow();
        match kind {
            ListenerKind::Change => state.change.len(),
            ListenerKind::Stale => state.stale_listeners.len(),
            ListenerKind::Dispose => state.dispose.len(),
        }
    }

    fn add(&self, kind: ListenerKind, callback: Callback) -> Result<ListenerKey> {
        let mut state = self.inner.state.borrow_mut();
        state.ensure_live()?;
        Ok(state.listeners(kind).insert(callback))
    }

    fn remove(&self, kind: ListenerKind, key: ListenerKey) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        state.ensure_live()?;
        state.listeners(kind).remove(key);
        Ok(())
    }
}

impl<T> Clone for Var<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Var<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Var")
            .field("id", &self.inner.id)
            .field("stale", &state.stale)
            .field("disposed", &state.disposed)
            .finish_non_exhaustive()
    }
}

impl<T> Dependency for Var<T> {
    fn subscribe_change(&self, callback: Callback) -> Result<ListenerKey> {
        self.add(ListenerKind::Change, callback)
    }

    fn unsubscribe_change(&self, key: ListenerKey) -> Result<()> {
        self.remove(ListenerKind::Change, key)
    }

    fn subscribe_stale(&self, callback: Callback) -> Result<ListenerKey> {
        self.add(ListenerKind::Stale, callback)
    }

    fn unsubscribe_stale(&self, key: ListenerKey) -> Result<()> {
        self.remove(ListenerKind::Stale, key)
    }

    fn subscribe_dispose(&self, callback: Callback) -> Result<ListenerKey> {
        self.add(ListenerKind::Dispose, callback)
    }

    fn unsubscribe_dispose(&self, key: ListenerKey) -> Result<()> {
        self.remove(ListenerKind::Dispose, key)
    }
}

impl<T: Clone> ObservableValue<T> for Var<T> {
    fn value(&self) -> Result<T> {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counter() -> (Rc<Cell<usize>>, Callback) {
        let count = Rc::new(Cell::new(0));
        let count_clone = count.clone();
        (count, Rc::new(move || count_clone.set(count_clone.get() + 1)))
    }

    #[test]
    fn set_notifies_only_on_actual_change() {
        let realm = Realm::new();
        let var = Var::new(&realm, 1);
        let (count, callback) = counter();
        var.subscribe_change(callback).unwrap();

        var.set(1).unwrap();
        assert_eq!(count.get(), 0);

        var.set(2).unwrap();
        assert_eq!(count.get(), 1);
        assert_eq!(var.get().unwrap(), 2);
    }

    #[test]
    fn stale_fires_once_until_next_set() {
        let realm = Realm::new();
        let var = Var::new(&realm, "x");
        let (count, callback) = counter();
        var.subscribe_stale(callback).unwrap();

        var.mark_stale().unwrap();
        var.mark_stale().unwrap();
        assert_eq!(count.get(), 1);
        assert!(var.is_stale().unwrap());

        var.set("y").unwrap();
        assert!(!var.is_stale().unwrap());
        var.mark_stale().unwrap();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn unsubscribe_stops_notifications_and_updates_counts() {
        let realm = Realm::new();
        let var = Var::new(&realm, 0);
        let (count, callback) = counter();
        let key = var.subscribe_change(callback).unwrap();
        assert_eq!(var.listener_count(ListenerKind::Change), 1);
        assert_eq!(var.listener_count(ListenerKind::Stale), 0);

        var.unsubscribe_change(key).unwrap();
        assert_eq!(var.listener_count(ListenerKind::Change), 0);
        var.set(5).unwrap();
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let realm = Realm::new();
        let var = Var::new(&realm, 0);
        let key_slot: Rc<Cell<Option<ListenerKey>>> = Rc::default();
        let (count, _) = counter();

        let key = {
            let handle = var.clone();
            let slot = key_slot.clone();
            let count = count.clone();
            var.subscribe_change(Rc::new(move || {
                count.set(count.get() + 1);
                if let Some(key) = slot.get() {
                    handle.unsubscribe_change(key).unwrap();
                }
            }))
            .unwrap()
        };
        key_slot.set(Some(key));

        var.set(1).unwrap();
        var.set(2).unwrap();
        assert_eq!(count.get(), 1);
        assert_eq!(var.listener_count(ListenerKind::Change), 0);
    }

    #[test]
    fn dispose_notifies_then_rejects_everything() {
        let realm = Realm::new();
        let var = Var::new(&realm, 0);
        let (count, callback) = counter();
        var.subscribe_dispose(callback).unwrap();
        var.subscribe_change(Rc::new(|| {})).unwrap();

        var.dispose().unwrap();
        assert_eq!(count.get(), 1);
        assert!(var.is_disposed());
        assert_eq!(var.listener_count(ListenerKind::Change), 0);
        assert_eq!(var.listener_count(ListenerKind::Dispose), 0);

        assert!(var.get().unwrap_err().is_disposed());
        assert!(var.set(1).unwrap_err().is_disposed());
        assert!(var.dispose().unwrap_err().is_disposed());
        assert!(
            var.subscribe_change(Rc::new(|| {}))
                .unwrap_err()
                .is_disposed()
        );
    }
}
