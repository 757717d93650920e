#![deny(missing_docs)]

//! Lazily subscribed, memoized computed values.
//!
//! A [`Computed`] derives a value from a fixed list of upstream dependencies.
//! It computes on demand, caches the result and recomputes only after a
//! dependency reports a change. It listens upstream only while it is both
//! clean and observed by at least one downstream listener, so an unobserved
//! node costs its dependencies nothing.
//!
//! # Quick Start
//!
//! ```ignore
//! use lazy_computed::{Computed, Realm, Var};
//!
//! let realm = Realm::new();
//! let d1 = Var::new(&realm, String::from("a"));
//! let d2 = Var::new(&realm, String::from("b"));
//!
//! let joined = {
//!     let (d1, d2) = (d1.clone(), d2.clone());
//!     Computed::new(&realm, [d1.clone(), d2.clone()], move || {
//!         Ok::<_, lazy_computed::Error>(d1.get()? + &d2.get()?)
//!     })
//! };
//! assert_eq!(joined.get_value()?, "ab");
//!
//! joined.add_value_change_listener(|event| {
//!     // The new value is only computed if asked for
//!     println!("{} -> {}", event.old_value(), event.new_value().unwrap());
//! })?;
//!
//! d1.set("c".into())?;  // prints "ab -> cb"
//! ```
//!
//! # Core Types
//!
//! - [`Computed<T>`] - Memoized derived value with lazy upstream subscription.
//! - [`Var<T>`] - Settable observable value, the usual leaf of a graph.
//! - [`Dependency`] / [`ObservableValue`] - What a node needs from upstream.
//! - [`Realm`] - The single-threaded context all nodes of a graph live in.
//!
//! # Notifications
//!
//! A dependency sends three kinds of notification: *change*, *stale* and
//! *dispose*. A computed node reacts to a change by becoming dirty and
//! telling its own change and value-change listeners; the actual
//! recomputation waits for the next read. A stale notification only sets a
//! flag readable through [`Computed::is_stale`].
//!
//! # Threads
//!
//! Nodes are `!Send`. Other threads hand work to a realm through a
//! [`Mailbox`], which the realm drains in [`Realm::flush`].

mod computed;
mod dependency;
mod error;
mod hash;
mod listeners;
mod realm;
mod var;

pub use computed::{Computed, ComputedBuilder, NodeState, ValueChangeEvent};
pub use dependency::{Callback, Dependency, ListenerKind, ObservableValue};
pub use error::{BoxError, Error, Result};
pub use listeners::ListenerKey;
pub use realm::{DEFAULT_MAX_DEPTH, Mailbox, NodeId, Realm, RealmBuilder, TaskKey};
pub use var::Var;
