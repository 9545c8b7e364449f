//! Atom-Flow: a fine-grained reactive state engine.
//!
//! A directed acyclic graph of computed cells ("atoms"): leaf atoms hold
//! externally-mutated values, derived atoms compute theirs as a pure function
//! of other atoms. Consumers read current values, mutate leaves, and
//! subscribe to atoms for push notifications when a value changes.
//!
//! # Key Features
//!
//! - **Exact recomputation**: only the atoms whose transitive dependencies
//!   changed are recomputed, and equal recomputed values stop propagation
//!   (early cutoff)
//! - **Glitch-free**: no reader ever observes a derived value computed from a
//!   mix of pre- and post-update dependency values
//! - **Dynamic dependency tracking**: dependencies are re-discovered on every
//!   run, so conditionally-read atoms drop out when no longer read
//! - **Push subscriptions**: `bind` callbacks fire once per write batch, in
//!   dependency order, with lifecycle hooks for scoped external resources
//! - **Asynchronous values**: read functions may return futures; an in-flight
//!   computation superseded by a newer invalidation is discarded, never
//!   observed
//! - **Observability**: a pluggable [`Tracer`] sees recomputations,
//!   invalidations, and settlements without touching the hot path
//!
//! # Example
//!
//! ```ignore
//! use atom_flow::{Atom, Scope};
//!
//! let price = Atom::value(10_i64);
//! let quantity = Atom::value(2_i64);
//! let total = Atom::computed({
//!     let (price, quantity) = (price.clone(), quantity.clone());
//!     move |get| Ok(get.get(&price)? * get.get(&quantity)?)
//! });
//!
//! let scope = Scope::new();
//! assert_eq!(scope.get(&total).unwrap(), 20);
//!
//! scope.bind(&total, |t| println!("total changed: {t}"));
//! scope.set(&price, 15).unwrap();    // prints "total changed: 30"
//! ```

mod atom;
mod error;
mod node;
mod pending;
mod scope;
pub mod tracer;
mod value;

pub use atom::{Atom, AtomId, Teardown};
pub use error::AtomError;
pub use node::CellState;
pub use pending::{AsyncGetter, PendingValue};
pub use scope::{Binding, Getter, Scope, ScopeBuilder, WriteContext};
pub use tracer::{ComputeResult, InvalidationReason, NoopTracer, SettleOutcome, Tracer};
pub use value::{AtomOutput, AtomValue};
