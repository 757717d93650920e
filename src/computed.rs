//! Computed nodes: memoized values derived from a fixed dependency list.
//!
//! A node moves through [`NodeState`]. It registers on its dependencies only
//! while it is clean and has a change, value-change or stale listener; a
//! dependency change makes it dirty and drops those registrations until the
//! next read.

use crate::dependency::{Callback, Dependency, ListenerKind, ObservableValue};
use crate::error::{BoxError, Error, Result};
use crate::listeners::{ListenerKey, ListenerSet};
use crate::realm::{NodeId, Realm, TaskKey};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

/// Where a computed node is in its lifecycle
///
/// A node is subscribed to its dependencies exactly when it is clean and has
/// at least one change, value-change or stale listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Never computed
    Uninitialized,
    /// A dependency changed since the last computation
    Dirty,
    /// Cached value is current and dependencies are being listened to
    CleanSubscribed,
    /// Cached value is current but nobody downstream is listening
    CleanUnsubscribed,
    /// Terminal
    Disposed,
}

impl NodeState {
    /// True if the next read has to run the compute function
    pub fn is_dirty(self) -> bool {
        matches!(self, NodeState::Uninitialized | NodeState::Dirty)
    }

    /// True while the node holds change/stale registrations on its dependencies
    pub fn is_subscribed(self) -> bool {
        self == NodeState::CleanSubscribed
    }
}

/// Payload of a value-change notification
///
/// The new value is not computed when the notification fires. Calling
/// [`new_value`](Self::new_value) recomputes it on demand, so listeners that
/// never look at it cost nothing.
pub struct ValueChangeEvent<T> {
    old_value: T,
    node: Weak<Node<T>>,
}

impl<T: Clone + 'static> ValueChangeEvent<T> {
    /// The value cached before the dependency changed
    pub fn old_value(&self) -> &T {
        &self.old_value
    }

    /// Compute (or return the already computed) new value
    pub fn new_value(&self) -> Result<T> {
        let node = self
            .node
            .upgrade()
            .ok_or(Error::Disposed { node: "computed" })?;
        node.get_value()
    }
}

impl<T: fmt::Debug> fmt::Debug for ValueChangeEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueChangeEvent")
            .field("old_value", &self.old_value)
            .finish_non_exhaustive()
    }
}

type ComputeFn<T> = Box<dyn FnMut() -> Result<T, BoxError>>;
type ValueListener<T> = dyn Fn(&ValueChangeEvent<T>);

/// Registrations held on one dependency while subscribed
struct Subscription {
    dependency: usize,
    change: ListenerKey,
    stale: ListenerKey,
}

struct Node<T> {
    id: NodeId,
    realm: Realm,
    value_type: Option<&'static str>,
    dispose_with_dependencies: bool,
    dependencies: Vec<Rc<dyn Dependency>>,
    compute: RefCell<ComputeFn<T>>,
    /// Set while the compute function runs; guards against cycles
    computing: Cell<bool>,
    core: RefCell<NodeCore<T>>,
}

struct NodeCore<T> {
    state: NodeState,
    /// Only meaningful while clean
    cached: Option<T>,
    stale: bool,
    subscriptions: Vec<Subscription>,
    /// Dispose registrations, held for the node's whole life
    dispose_keys: Vec<(usize, ListenerKey)>,
    change: ListenerSet<dyn Fn()>,
    value_change: ListenerSet<ValueListener<T>>,
    stale_listeners: ListenerSet<dyn Fn()>,
    dispose: ListenerSet<dyn Fn()>,
}

impl<T> NodeCore<T> {
    fn is_observed(&self) -> bool {
        !self.change.is_empty() || !self.value_change.is_empty() || !self.stale_listeners.is_empty()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state == NodeState::Disposed {
            Err(Error::Disposed { node: "computed" })
        } else {
            Ok(())
        }
    }
}

/// Resets the computing flag, also when the compute function panics
struct ComputingGuard<'a>(&'a Cell<bool>);

impl<'a> ComputingGuard<'a> {
    fn new(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for ComputingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Registrations made for a recomputation that has not finished yet.
/// Released on drop unless committed, so a failed or panicking compute
/// leaves nothing registered upstream.
struct PendingSubscriptions<'a, T> {
    node: &'a Node<T>,
    subscriptions: Vec<Subscription>,
}

impl<T> PendingSubscriptions<'_, T> {
    fn commit(mut self) -> Vec<Subscription> {
        std::mem::take(&mut self.subscriptions)
    }
}

impl<T> Drop for PendingSubscriptions<'_, T> {
    fn drop(&mut self) {
        self.node.release(&self.subscriptions);
    }
}

// Teardown only touches dependencies, so it works for any T (and from Drop).
impl<T> Node<T> {
    fn release(&self, subscriptions: &[Subscription]) {
        for subscription in subscriptions {
            let dependency = &self.dependencies[subscription.dependency];
            let change = dependency.unsubscribe(ListenerKind::Change, subscription.change);
            let stale = dependency.unsubscribe(ListenerKind::Stale, subscription.stale);
            if let Err(err) = change.and(stale) {
                tracing::trace!(node = %self.id, %err, "dependency rejected unsubscribe");
            }
        }
        if !subscriptions.is_empty() {
            tracing::trace!(node = %self.id, "unsubscribed from dependencies");
        }
    }

    fn release_dispose_keys(&self, keys: &[(usize, ListenerKey)]) {
        for &(index, key) in keys {
            if let Err(err) = self.dependencies[index].unsubscribe(ListenerKind::Dispose, key) {
                tracing::trace!(node = %self.id, %err, "dependency rejected unsubscribe");
            }
        }
    }
}

impl<T: Clone + 'static> Node<T> {
    fn get_value(self: &Rc<Self>) -> Result<T> {
        {
            let mut core = self.core.borrow_mut();
            core.ensure_live()?;
            match core.state {
                NodeState::CleanUnsubscribed if core.is_observed() => {
                    // Nothing tracked the dependencies while nobody listened,
                    // so the cache may be behind. Refresh it without notifying.
                    cov_mark::hit!(refresh_on_observe);
                    core.state = NodeState::Dirty;
                    core.cached = None;
                }
                NodeState::CleanSubscribed | NodeState::CleanUnsubscribed => {
                    if let Some(value) = &core.cached {
                        return Ok(value.clone());
                    }
                }
                _ => {}
            }
        }
        self.recompute()
    }

    fn recompute(self: &Rc<Self>) -> Result<T> {
        if self.computing.get() {
            cov_mark::hit!(computed_cycle_detected);
            tracing::warn!(node = %self.id, "value read during its own computation");
            return Err(Error::Cycle { node: self.id });
        }
        let _depth = self.realm.enter_compute()?;
        let _computing = ComputingGuard::new(&self.computing);

        // An observed node registers upstream before computing, so computed
        // dependencies are brought up to date before they are read.
        let observed = self.core.borrow().is_observed();
        let pending = if observed {
            Some(self.subscribe_dependencies()?)
        } else {
            None
        };

        tracing::trace!(node = %self.id, "recomputing");
        let value = {
            let mut compute = self.compute.borrow_mut();
            (*compute)().map_err(Error::Compute)?
        };

        let mut core = self.core.borrow_mut();
        // The compute function may have disposed the node
        core.ensure_live()?;
        core.cached = Some(value.clone());
        core.stale = false;
        if let Some(pending) = pending {
            core.subscriptions = pending.commit();
            core.state = NodeState::CleanSubscribed;
        } else {
            core.state = NodeState::CleanUnsubscribed;
        }
        Ok(value)
    }

    fn callback(self: &Rc<Self>, handler: fn(&Rc<Self>)) -> Callback {
        let weak = Rc::downgrade(self);
        Rc::new(move || {
            if let Some(node) = weak.upgrade() {
                handler(&node);
            }
        })
    }

    fn subscribe_dependencies(self: &Rc<Self>) -> Result<PendingSubscriptions<'_, T>> {
        let mut pending = PendingSubscriptions {
            node: self.as_ref(),
            subscriptions: Vec::with_capacity(self.dependencies.len()),
        };
        for (index, dependency) in self.dependencies.iter().enumerate() {
            let change = dependency.subscribe(ListenerKind::Change, self.callback(Self::handle_change))?;
            let stale = match dependency.subscribe(ListenerKind::Stale, self.callback(Self::handle_stale)) {
                Ok(stale) => stale,
                Err(err) => {
                    if let Err(rollback) = dependency.unsubscribe(ListenerKind::Change, change) {
                        tracing::trace!(node = %self.id, err = %rollback, "dependency rejected unsubscribe");
                    }
                    return Err(err);
                }
            };
            pending.subscriptions.push(Subscription {
                dependency: index,
                change,
                stale,
            });
        }
        tracing::trace!(
            node = %self.id,
            dependencies = pending.subscriptions.len(),
            "subscribed to dependencies"
        );
        Ok(pending)
    }

    fn handle_change(self: &Rc<Self>) {
        assert!(
            !self.computing.get(),
            "{} was notified of a dependency change while computing its value",
            self.id
        );
        let (subscriptions, old_value) = {
            let mut core = self.core.borrow_mut();
            if core.state.is_dirty() || core.state == NodeState::Disposed {
                cov_mark::hit!(change_ignored_while_dirty);
                return;
            }
            let Some(old_value) = core.cached.take() else {
                return;
            };
            core.state = NodeState::Dirty;
            (std::mem::take(&mut core.subscriptions), old_value)
        };
        tracing::debug!(node = %self.id, "dependency changed");

        // No live notifications are needed until the next pull
        self.release(&subscriptions);

        let event = ValueChangeEvent {
            old_value,
            node: Rc::downgrade(self),
        };
        let (change, value_change) = {
            let core = self.core.borrow();
            (core.change.snapshot(), core.value_change.snapshot())
        };
        for listener in change {
            listener();
        }
        for listener in value_change {
            listener(&event);
        }
    }

    fn handle_stale(self: &Rc<Self>) {
        assert!(
            !self.computing.get(),
            "{} was notified of a stale dependency while computing its value",
            self.id
        );
        let listeners = {
            let mut core = self.core.borrow_mut();
            if core.state.is_dirty() || core.state == NodeState::Disposed || core.stale {
                cov_mark::hit!(stale_ignored);
                return;
            }
            core.stale = true;
            core.stale_listeners.snapshot()
        };
        for listener in listeners {
            listener();
        }
    }

    fn handle_dependency_disposed(self: &Rc<Self>) {
        if self.core.borrow().state == NodeState::Disposed {
            return;
        }
        tracing::debug!(node = %self.id, "dependency disposed");
        let _ = self.dispose();
    }

    fn is_stale(self: &Rc<Self>) -> Result<bool> {
        self.get_value()?;
        Ok(self.core.borrow().stale)
    }

    fn add_listener<R>(self: &Rc<Self>, insert: impl FnOnce(&mut NodeCore<T>) -> R) -> Result<R> {
        let key = {
            let mut core = self.core.borrow_mut();
            core.ensure_live()?;
            insert(&mut core)
        };
        let weak = Rc::downgrade(self);
        self.realm.exec_keyed(TaskKey::Observe(self.id), move || {
            if let Some(node) = weak.upgrade() {
                node.start_observing();
            }
        });
        Ok(key)
    }

    fn remove_listener(self: &Rc<Self>, remove: impl FnOnce(&mut NodeCore<T>) -> bool) -> Result<()> {
        let lapsed = {
            let mut core = self.core.borrow_mut();
            core.ensure_live()?;
            let removed = remove(&mut core);
            if removed && !core.is_observed() && core.state.is_subscribed() {
                core.state = NodeState::CleanUnsubscribed;
                Some(std::mem::take(&mut core.subscriptions))
            } else {
                None
            }
        };
        if let Some(subscriptions) = lapsed {
            cov_mark::hit!(last_listener_removed);
            self.release(&subscriptions);
        }
        Ok(())
    }

    /// Make sure an observed node is listening upstream
    fn start_observing(self: &Rc<Self>) {
        let idle = {
            let core = self.core.borrow();
            !core.is_observed() || matches!(core.state, NodeState::CleanSubscribed | NodeState::Disposed)
        };
        if idle {
            return;
        }
        let started = self.get_value().map(drop);
        if let Err(err) = started {
            tracing::warn!(node = %self.id, %err, "could not start observing dependencies");
        }
    }

    fn dispose(self: &Rc<Self>) -> Result<()> {
        let (subscriptions, dispose_keys, listeners) = {
            let mut core = self.core.borrow_mut();
            core.ensure_live()?;
            core.state = NodeState::Disposed;
            core.cached = None;
            core.stale = false;
            (
                std::mem::take(&mut core.subscriptions),
                std::mem::take(&mut core.dispose_keys),
                core.dispose.snapshot(),
            )
        };
        tracing::debug!(node = %self.id, "computed disposed");
        self.release(&subscriptions);
        self.release_dispose_keys(&dispose_keys);
        for listener in listeners {
            listener();
        }

        let mut core = self.core.borrow_mut();
        core.change.clear();
        core.value_change.clear();
        core.stale_listeners.clear();
        core.dispose.clear();
        Ok(())
    }
}

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        let subscriptions = std::mem::take(&mut core.subscriptions);
        let dispose_keys = std::mem::take(&mut core.dispose_keys);
        self.release(&subscriptions);
        self.release_dispose_keys(&dispose_keys);
    }
}

/// Memoized value derived from a fixed list of dependencies
///
/// The compute function runs lazily: never at construction, and afterwards
/// only when the value is read while dirty. Repeated reads of a clean node
/// return the cached value.
///
/// # How it works
/// - The node listens to its dependencies only while it is clean *and*
///   something downstream listens to it. Adding the first listener makes the
///   node pull its value once so that it starts listening. A value cached
///   while nobody listened is recomputed at that point, since no change
///   notifications reached it in the meantime.
/// - When a dependency changes, the node becomes dirty, drops its upstream
///   registrations and notifies its change and value-change listeners. The
///   value-change event carries the old value and an accessor that
///   recomputes the new one on demand, so a burst of changes costs one
///   recomputation at the next read.
/// - A dependency going stale only flags the node as stale.
/// - Removing the last listener drops the upstream registrations right away.
///
/// Dependencies are declared up front; reads performed by the compute
/// function are not tracked.
///
/// # Example
/// ```ignore
/// let realm = Realm::new();
/// let voltage = Var::new(&realm, 12.0);
/// let current = Var::new(&realm, 2.0);
///
/// let power = {
///     let (voltage, current) = (voltage.clone(), current.clone());
///     Computed::builder(&realm)
///         .dependency(voltage.clone())
///         .dependency(current.clone())
///         .value_type("watts")
///         .build(move || Ok::<_, Error>(voltage.get()? * current.get()?))
/// };
///
/// power.add_value_change_listener(|event| {
///     println!("power was {}", event.old_value());
/// })?;
///
/// voltage.set(24.0)?;              // listener fires, nothing recomputed yet
/// assert_eq!(power.get_value()?, 48.0);
/// ```
pub struct Computed<T> {
    node: Rc<Node<T>>,
}

impl<T: Clone + 'static> Computed<T> {
    /// Create a node over a homogeneous list of dependencies
    ///
    /// Use [`Computed::builder`] to mix dependency types or set options.
    pub fn new<D, E, F>(realm: &Realm, dependencies: impl IntoIterator<Item = D>, f: F) -> Self
    where
        D: Dependency + 'static,
        E: Into<BoxError>,
        F: FnMut() -> Result<T, E> + 'static,
    {
        Self::builder(realm).dependencies(dependencies).build(f)
    }

    /// Start configuring a node
    pub fn builder(realm: &Realm) -> ComputedBuilder<T> {
        ComputedBuilder::new(realm)
    }

    /// Current value, recomputing first if dirty
    ///
    /// A failing compute function leaves the node dirty, so the next call
    /// tries again.
    pub fn get_value(&self) -> Result<T> {
        self.node.get_value()
    }

    /// Whether a dependency reported itself stale since the last computation
    ///
    /// Brings the value up to date first.
    pub fn is_stale(&self) -> Result<bool> {
        self.node.is_stale()
    }

    /// Listen for changes (no payload)
    pub fn add_change_listener(&self, listener: impl Fn() + 'static) -> Result<ListenerKey> {
        let listener: Rc<dyn Fn()> = Rc::new(listener);
        self.node.add_listener(|core| core.change.insert(listener))
    }

    /// Stop listening for changes
    pub fn remove_change_listener(&self, key: ListenerKey) -> Result<()> {
        self.node.remove_listener(|core| core.change.remove(key))
    }

    /// Listen for value changes
    pub fn add_value_change_listener(
        &self,
        listener: impl Fn(&ValueChangeEvent<T>) + 'static,
    ) -> Result<ListenerKey> {
        let listener: Rc<ValueListener<T>> = Rc::new(listener);
        self.node.add_listener(|core| core.value_change.insert(listener))
    }

    /// Stop listening for value changes
    pub fn remove_value_change_listener(&self, key: ListenerKey) -> Result<()> {
        self.node.remove_listener(|core| core.value_change.remove(key))
    }

    /// Listen for staleness
    pub fn add_stale_listener(&self, listener: impl Fn() + 'static) -> Result<ListenerKey> {
        let listener: Rc<dyn Fn()> = Rc::new(listener);
        self.node.add_listener(|core| core.stale_listeners.insert(listener))
    }

    /// Stop listening for staleness
    pub fn remove_stale_listener(&self, key: ListenerKey) -> Result<()> {
        self.node.remove_listener(|core| core.stale_listeners.remove(key))
    }

    /// Get notified when this node is disposed
    ///
    /// Dispose listeners do not count as observers: they never make the node
    /// subscribe upstream.
    pub fn add_dispose_listener(&self, listener: impl Fn() + 'static) -> Result<ListenerKey> {
        let mut core = self.node.core.borrow_mut();
        core.ensure_live()?;
        Ok(core.dispose.insert(Rc::new(listener)))
    }

    /// Remove a dispose listener
    pub fn remove_dispose_listener(&self, key: ListenerKey) -> Result<()> {
        let mut core = self.node.core.borrow_mut();
        core.ensure_live()?;
        core.dispose.remove(key);
        Ok(())
    }

    /// Dispose the node
    ///
    /// Drops every upstream registration, notifies dispose listeners and
    /// clears all listeners. Every later operation fails with
    /// [`Error::Disposed`].
    pub fn dispose(&self) -> Result<()> {
        self.node.dispose()
    }
}

impl<T> Computed<T> {
    /// Identifier within the realm
    pub fn id(&self) -> NodeId {
        self.node.id
    }

    /// The realm this node belongs to
    pub fn realm(&self) -> &Realm {
        &self.node.realm
    }

    /// Descriptive tag for the value, if one was given. Never enforced.
    pub fn value_type(&self) -> Option<&'static str> {
        self.node.value_type
    }

    /// Current lifecycle state
    pub fn state(&self) -> NodeState {
        self.node.core.borrow().state
    }

    /// True if the next read recomputes
    pub fn is_dirty(&self) -> bool {
        self.state().is_dirty()
    }

    /// True once disposed
    pub fn is_disposed(&self) -> bool {
        self.state() == NodeState::Disposed
    }

    /// Number of declared dependencies
    pub fn dependency_count(&self) -> usize {
        self.node.dependencies.len()
    }
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.node.id)
            .field("state", &self.state())
            .field("value_type", &self.node.value_type)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> Dependency for Computed<T> {
    fn subscribe_change(&self, callback: Callback) -> Result<ListenerKey> {
        self.node.add_listener(|core| core.change.insert(callback))
    }

    fn unsubscribe_change(&self, key: ListenerKey) -> Result<()> {
        self.remove_change_listener(key)
    }

    fn subscribe_stale(&self, callback: Callback) -> Result<ListenerKey> {
        self.node.add_listener(|core| core.stale_listeners.insert(callback))
    }

    fn unsubscribe_stale(&self, key: ListenerKey) -> Result<()> {
        self.remove_stale_listener(key)
    }

    fn subscribe_dispose(&self, callback: Callback) -> Result<ListenerKey> {
        let mut core = self.node.core.borrow_mut();
        core.ensure_live()?;
        Ok(core.dispose.insert(callback))
    }

    fn unsubscribe_dispose(&self, key: ListenerKey) -> Result<()> {
        self.remove_dispose_listener(key)
    }
}

impl<T: Clone + 'static> ObservableValue<T> for Computed<T> {
    fn value(&self) -> Result<T> {
        self.get_value()
    }
}

/// Builder for [`Computed`]
///
/// The value type is fixed by the compute function passed to
/// [`build`](Self::build).
pub struct ComputedBuilder<T> {
    realm: Realm,
    dependencies: Vec<Rc<dyn Dependency>>,
    value_type: Option<&'static str>,
    dispose_with_dependencies: bool,
    _value: PhantomData<fn() -> T>,
}

impl<T: Clone + 'static> ComputedBuilder<T> {
    /// Start a builder for a node in `realm`
    pub fn new(realm: &Realm) -> Self {
        Self {
            realm: realm.clone(),
            dependencies: Vec::new(),
            value_type: None,
            dispose_with_dependencies: false,
            _value: PhantomData,
        }
    }

    /// Append a dependency
    pub fn dependency(mut self, dependency: impl Dependency + 'static) -> Self {
        self.dependencies.push(Rc::new(dependency));
        self
    }

    /// Append an already shared dependency
    pub fn shared_dependency(mut self, dependency: Rc<dyn Dependency>) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Append several dependencies of one type
    pub fn dependencies<D: Dependency + 'static>(
        mut self,
        dependencies: impl IntoIterator<Item = D>,
    ) -> Self {
        self.dependencies.extend(
            dependencies
                .into_iter()
                .map(|d| Rc::new(d) as Rc<dyn Dependency>),
        );
        self
    }

    /// Attach a descriptive tag for the value type
    pub fn value_type(mut self, tag: &'static str) -> Self {
        self.value_type = Some(tag);
        self
    }

    /// Dispose the node as soon as any dependency is disposed
    pub fn dispose_with_dependencies(mut self, enabled: bool) -> Self {
        self.dispose_with_dependencies = enabled;
        self
    }

    /// Create the node. The compute function does not run yet.
    pub fn build<E, F>(self, mut f: F) -> Computed<T>
    where
        E: Into<BoxError>,
        F: FnMut() -> Result<T, E> + 'static,
    {
        let node = Rc::new(Node {
            id: self.realm.next_node_id(),
            realm: self.realm,
            value_type: self.value_type,
            dispose_with_dependencies: self.dispose_with_dependencies,
            dependencies: self.dependencies,
            compute: RefCell::new(Box::new(move || f().map_err(Into::into))),
            computing: Cell::new(false),
            core: RefCell::new(NodeCore {
                state: NodeState::Uninitialized,
                cached: None,
                stale: false,
                subscriptions: Vec::new(),
                dispose_keys: Vec::new(),
                change: ListenerSet::new(),
                value_change: ListenerSet::new(),
                stale_listeners: ListenerSet::new(),
                dispose: ListenerSet::new(),
            }),
        });

        if node.dispose_with_dependencies {
            let mut keys = Vec::with_capacity(node.dependencies.len());
            let mut dependency_gone = false;
            for (index, dependency) in node.dependencies.iter().enumerate() {
                let on_dispose = node.callback(Node::<T>::handle_dependency_disposed);
                match dependency.subscribe(ListenerKind::Dispose, on_dispose) {
                    Ok(key) => keys.push((index, key)),
                    Err(_) => dependency_gone = true,
                }
            }
            node.core.borrow_mut().dispose_keys = keys;
            if dependency_gone {
                tracing::debug!(node = %node.id, "created over a disposed dependency");
                let _ = node.dispose();
            }
        }

        tracing::trace!(
            node = %node.id,
            dependencies = node.dependencies.len(),
            "computed created"
        );
        Computed { node }
    }
}
