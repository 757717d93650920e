//! The realm: the single serialized execution context nodes live in.
//!
//! Every var and computed node belongs to one [`Realm`]. All state changes,
//! listener dispatch and dependency (un)subscription happen on the thread that
//! owns the realm; the handle is `!Send`, so the type system keeps nodes on it.
//!
//! Work that originates elsewhere reaches the realm in one of two ways:
//!
//! - [`Realm::exec`] / [`Realm::exec_keyed`] run a task right away, unless a
//!   [`Realm::batch`] is open, in which case the task is queued and runs when
//!   the outermost batch closes.
//! - [`Realm::mailbox`] hands out a `Send` [`Mailbox`] that other threads post
//!   messages into. Messages are delivered on the realm thread by
//!   [`Realm::flush`].
//!
//! ```ignore
//! let realm = Realm::new();
//! let input = Var::new(&realm, 0);
//!
//! let setter = input.clone();
//! let mailbox = realm.mailbox(move |v: i32| {
//!     let _ = setter.set(v);
//! });
//!
//! let remote = mailbox.clone();
//! std::thread::spawn(move || remote.post(42)).join().unwrap();
//!
//! realm.flush();
//! assert_eq!(input.get()?, 42);
//! ```

use crate::error::{Error, Result};
use crate::hash::FixedHashBuilder;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Default limit for recomputations nested inside each other.
///
/// A chain of computed nodes that are all dirty recomputes recursively, one
/// level per node, when the last one is read.
pub const DEFAULT_MAX_DEPTH: usize = 128;

/// Identifier of a node within its realm, used in logs, errors and task keys.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(u32);

impl NodeId {
    /// Create a NodeId from a raw value
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw value
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Key for a deferred task. Keyed tasks are queued at most once per batch.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum TaskKey {
    /// Check whether a node has to start observing its dependencies
    Observe(NodeId),
    /// A task queued through [`Realm::exec`]; never deduplicated
    Anonymous(u64),
}

type Task = Box<dyn FnOnce()>;

/// A queue that other threads feed and the realm drains
trait Inbox {
    fn has_pending(&self) -> bool;
    fn deliver(&self) -> usize;
}

struct MailboxInbox<M, H> {
    queue: Arc<Mutex<VecDeque<M>>>,
    handler: H,
}

impl<M, H: Fn(M)> Inbox for MailboxInbox<M, H> {
    fn has_pending(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    fn deliver(&self) -> usize {
        // Take the messages first so handlers never run under the lock and
        // posting threads are not blocked by slow handlers.
        let messages: Vec<M> = self.queue.lock().drain(..).collect();
        let count = messages.len();
        for message in messages {
            (self.handler)(message);
        }
        count
    }
}

struct RealmInner {
    max_depth: usize,
    next_node: Cell<u32>,
    next_task: Cell<u64>,
    compute_depth: Cell<usize>,
    batch_depth: Cell<usize>,
    queue: RefCell<IndexMap<TaskKey, Task, FixedHashBuilder>>,
    inboxes: RefCell<Vec<Rc<dyn Inbox>>>,
}

/// Handle to a serialized execution context
///
/// Cloning is cheap; clones refer to the same realm.
#[derive(Clone)]
pub struct Realm {
    inner: Rc<RealmInner>,
}

impl Realm {
    /// Create a realm with default settings
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Configure a realm before creating it
    pub fn builder() -> RealmBuilder {
        RealmBuilder::new()
    }

    /// Maximum number of nested recomputations
    pub fn max_depth(&self) -> usize {
        self.inner.max_depth
    }

    /// Run `task` on the realm
    ///
    /// Runs immediately unless a batch is open; then it runs when the
    /// outermost batch closes.
    pub fn exec(&self, task: impl FnOnce() + 'static) {
        if self.is_batching() {
            let id = self.inner.next_task.get();
            self.inner.next_task.set(id + 1);
            self.inner
                .queue
                .borrow_mut()
                .insert(TaskKey::Anonymous(id), Box::new(task));
        } else {
            task();
        }
    }

    /// Like [`exec`](Self::exec), but a task whose key is already queued is
    /// dropped instead of queued a second time.
    pub fn exec_keyed(&self, key: TaskKey, task: impl FnOnce() + 'static) {
        if !self.is_batching() {
            task();
            return;
        }
        let mut queue = self.inner.queue.borrow_mut();
        if queue.contains_key(&key) {
            cov_mark::hit!(realm_keyed_task_deduplicated);
            tracing::trace!(?key, "realm task already queued");
        } else {
            queue.insert(key, Box::new(task));
        }
    }

    /// Run `f` with task execution deferred until the outermost batch ends
    ///
    /// Tasks queued during the batch run in the order they were first queued.
    /// If `f` panics, queued tasks stay queued until the next
    /// [`flush`](Self::flush).
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.batch_depth.set(self.inner.batch_depth.get() + 1);
        let _guard = BatchGuard { realm: self };
        f()
    }

    /// True while inside [`batch`](Self::batch)
    pub fn is_batching(&self) -> bool {
        self.inner.batch_depth.get() > 0
    }

    /// True if queued tasks or undelivered mailbox messages exist
    pub fn has_pending(&self) -> bool {
        !self.inner.queue.borrow().is_empty()
            || self
                .inner
                .inboxes
                .borrow()
                .iter()
                .any(|inbox| inbox.has_pending())
    }

    /// Deliver mailbox messages and run queued tasks until nothing is left
    ///
    /// Returns the number of messages and tasks processed. Inside a batch only
    /// mailbox messages are delivered; tasks wait for the batch to end.
    pub fn flush(&self) -> usize {
        let mut processed = 0;
        loop {
            let inboxes = self.inner.inboxes.borrow().clone();
            let mut round = 0;
            for inbox in inboxes {
                round += inbox.deliver();
            }
            round += self.run_queued();
            if round == 0 {
                break;
            }
            processed += round;
        }
        processed
    }

    /// Create a channel other threads use to hand messages to the realm
    ///
    /// `handler` runs on the realm thread, once per message, during
    /// [`flush`](Self::flush).
    pub fn mailbox<M, H>(&self, handler: H) -> Mailbox<M>
    where
        M: Send + 'static,
        H: Fn(M) + 'static,
    {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        self.inner.inboxes.borrow_mut().push(Rc::new(MailboxInbox {
            queue: queue.clone(),
            handler,
        }));
        Mailbox { queue }
    }

    pub(crate) fn next_node_id(&self) -> NodeId {
        let id = self.inner.next_node.get();
        self.inner.next_node.set(id + 1);
        NodeId(id)
    }

    /// Account for one level of recomputation; released when the guard drops.
    pub(crate) fn enter_compute(&self) -> Result<DepthGuard<'_>> {
        let depth = self.inner.compute_depth.get();
        if depth >= self.inner.max_depth {
            return Err(Error::DepthExceeded {
                limit: self.inner.max_depth,
            });
        }
        self.inner.compute_depth.set(depth + 1);
        Ok(DepthGuard { realm: &self.inner })
    }

    fn run_queued(&self) -> usize {
        if self.is_batching() {
            return 0;
        }
        let mut ran = 0;
        loop {
            // The borrow ends before the task runs; tasks may queue more work.
            let next = self.inner.queue.borrow_mut().shift_remove_index(0);
            let Some((key, task)) = next else {
                break;
            };
            tracing::trace!(?key, "running deferred realm task");
            task();
            ran += 1;
        }
        ran
    }
}

impl Default for Realm {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("max_depth", &self.inner.max_depth)
            .field("batch_depth", &self.inner.batch_depth.get())
            .field("queued", &self.inner.queue.borrow().len())
            .finish()
    }
}

/// Builder for [`Realm`]
#[derive(Debug, Clone)]
pub struct RealmBuilder {
    max_depth: usize,
}

impl RealmBuilder {
    /// Start from the defaults
    pub fn new() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Limit for nested recomputations (clamped to at least 1)
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Create the realm
    pub fn build(self) -> Realm {
        Realm {
            inner: Rc::new(RealmInner {
                max_depth: self.max_depth,
                next_node: Cell::new(0),
                next_task: Cell::new(0),
                compute_depth: Cell::new(0),
                batch_depth: Cell::new(0),
                queue: RefCell::new(IndexMap::with_hasher(FixedHashBuilder)),
                inboxes: RefCell::new(Vec::new()),
            }),
        }
    }
}

impl Default for RealmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle for posting messages into a realm
///
/// Created by [`Realm::mailbox`].
pub struct Mailbox<M> {
    queue: Arc<Mutex<VecDeque<M>>>,
}

impl<M> Mailbox<M> {
    /// Queue a message for delivery on the realm thread
    pub fn post(&self, message: M) {
        self.queue.lock().push_back(message);
    }

    /// Number of messages waiting for delivery
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<M> fmt::Debug for Mailbox<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Closes a batch and runs queued tasks, also when unwinding.
struct BatchGuard<'a> {
    realm: &'a Realm,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let inner = &self.realm.inner;
        inner.batch_depth.set(inner.batch_depth.get().saturating_sub(1));
        if inner.batch_depth.get() == 0 && !std::thread::panicking() {
            self.realm.run_queued();
        }
    }
}

/// Releases one level of recomputation depth, also when unwinding.
pub(crate) struct DepthGuard<'a> {
    realm: &'a RealmInner,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        let depth = self.realm.compute_depth.get();
        self.realm.compute_depth.set(depth.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_runs_immediately_outside_batch() {
        let realm = Realm::new();
        let ran = Rc::new(Cell::new(false));
        let ran_clone = ran.clone();
        realm.exec(move || ran_clone.set(true));
        assert!(ran.get());
        assert!(!realm.has_pending());
    }

    #[test]
    fn batch_defers_until_outermost_exit() {
        let realm = Realm::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        realm.batch(|| {
            let o = order.clone();
            realm.exec(move || o.borrow_mut().push(1));
            realm.batch(|| {
                let o = order.clone();
                realm.exec(move || o.borrow_mut().push(2));
            });
            // Inner batch closing must not run anything
            assert!(order.borrow().is_empty());
            assert!(realm.has_pending());
        });

        assert_eq!(*order.borrow(), vec![1, 2]);
        assert!(!realm.has_pending());
    }

    #[test]
    fn keyed_tasks_are_deduplicated_within_a_batch() {
        cov_mark::check!(realm_keyed_task_deduplicated);
        let realm = Realm::new();
        let count = Rc::new(Cell::new(0));
        let key = TaskKey::Observe(NodeId::new(3));

        realm.batch(|| {
            for _ in 0..5 {
                let count = count.clone();
                realm.exec_keyed(key, move || count.set(count.get() + 1));
            }
        });

        assert_eq!(count.get(), 1);
    }

    #[test]
    fn batch_returns_value() {
        let realm = Realm::new();
        assert_eq!(realm.batch(|| 42), 42);
    }

    #[test]
    fn depth_guard_enforces_limit_and_releases() {
        let realm = Realm::builder().max_depth(2).build();
        let first = realm.enter_compute().unwrap();
        let second = realm.enter_compute().unwrap();
        let err = realm.enter_compute().err().unwrap();
        assert!(matches!(err, Error::DepthExceeded { limit: 2 }));
        drop(second);
        drop(first);
        assert!(realm.enter_compute().is_ok());
    }

    #[test]
    fn max_depth_is_clamped() {
        assert_eq!(Realm::builder().max_depth(0).build().max_depth(), 1);
    }

    #[test]
    fn mailbox_delivers_posts_from_other_threads_on_flush() {
        let realm = Realm::new();
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        let mailbox = realm.mailbox(move |n: u32| sink.borrow_mut().push(n));

        let handles: Vec<_> = (0..4)
            .map(|n| {
                let mailbox = mailbox.clone();
                std::thread::spawn(move || mailbox.post(n))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Nothing is delivered until the realm flushes
        assert!(received.borrow().is_empty());
        assert!(realm.has_pending());

        assert_eq!(realm.flush(), 4);
        let mut got = received.borrow().clone();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert_eq!(mailbox.pending(), 0);
    }

    #[test]
    fn node_ids_are_unique_per_realm() {
        let realm = Realm::new();
        let a = realm.next_node_id();
        let b = realm.next_node_id();
        assert_ne!(a, b);
        assert_eq!(b.to_string(), "node#1");
    }
}
