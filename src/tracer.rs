//! Tracer trait for observing scope execution.
//!
//! This is the engine's structured observability surface — and the only
//! place the internal sentinel states ([`CellState::Unset`] and
//! [`CellState::Stale`]) are visible. The default [`NoopTracer`] costs
//! nothing when tracing is not needed.
//!
//! All methods have empty default implementations, so implementations only
//! override the events they care about. Tracer methods may run while the
//! scope's internal locks are held; implementations must not call back into
//! the scope.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use atom_flow::{AtomId, ComputeResult, Scope, Tracer};
//!
//! #[derive(Default)]
//! struct RecomputeCounter(AtomicUsize);
//!
//! impl Tracer for RecomputeCounter {
//!     fn on_compute_end(&self, _atom: &AtomId, result: ComputeResult) {
//!         if matches!(result, ComputeResult::Changed | ComputeResult::Unchanged) {
//!             self.0.fetch_add(1, Ordering::Relaxed);
//!         }
//!     }
//! }
//! ```

use crate::atom::AtomId;
use crate::node::CellState;

/// How a recomputation of an atom concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeResult {
    /// The read function ran and produced a new value.
    Changed,
    /// The read function ran but the value equals the previous one
    /// (early cutoff applied).
    Unchanged,
    /// The record was marked fresh without running the read function because
    /// no dependency's value had actually changed.
    Verified,
    /// The read function failed; the record stays stale.
    Error,
}

/// Why a record was marked stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    /// A leaf atom was assigned a new value.
    LeafWrite,
    /// A transitive dependency changed.
    DependencyChanged,
    /// `Scope::invalidate` was called.
    Manual,
}

/// How an in-flight asynchronous computation settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// The result was committed to the cache.
    Committed {
        /// Whether the committed value differs from the previous one.
        changed: bool,
    },
    /// The computation was superseded; its result was discarded.
    Superseded,
    /// The computation resolved to an error; the record stays stale.
    Rejected,
}

/// Observer of scope execution.
pub trait Tracer: Send + Sync + 'static {
    /// A read function is about to run. `prior` is the record's state before
    /// recomputation (`Unset` or `Stale`).
    #[inline]
    fn on_compute_start(&self, _atom: &AtomId, _prior: CellState) {}

    /// A recomputation concluded.
    #[inline]
    fn on_compute_end(&self, _atom: &AtomId, _result: ComputeResult) {}

    /// A read hit the cache without recomputation.
    #[inline]
    fn on_cache_hit(&self, _atom: &AtomId) {}

    /// An atom was read by another atom's computation.
    #[inline]
    fn on_dependency_registered(&self, _parent: &AtomId, _dependency: &AtomId) {}

    /// A record was marked stale.
    #[inline]
    fn on_invalidated(&self, _atom: &AtomId, _reason: InvalidationReason) {}

    /// Subscribers of an atom are about to be called with a changed value.
    #[inline]
    fn on_notify(&self, _atom: &AtomId) {}

    /// A dependency cycle was detected; `path` ends with the re-entered atom.
    #[inline]
    fn on_cycle_detected(&self, _path: &[AtomId]) {}

    /// An asynchronous read produced a future; an in-flight token was issued.
    #[inline]
    fn on_pending_started(&self, _atom: &AtomId, _token: u64) {}

    /// An in-flight computation settled.
    #[inline]
    fn on_pending_settled(&self, _atom: &AtomId, _token: u64, _outcome: SettleOutcome) {}
}

/// Tracer that discards all events. The default for [`Scope`](crate::Scope).
pub struct NoopTracer;

impl Tracer for NoopTracer {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Atom;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTracer {
        computes: AtomicUsize,
        notifies: AtomicUsize,
    }

    impl Tracer for CountingTracer {
        fn on_compute_end(&self, _atom: &AtomId, result: ComputeResult) {
            if matches!(result, ComputeResult::Changed | ComputeResult::Unchanged) {
                self.computes.fetch_add(1, Ordering::Relaxed);
            }
        }

        fn on_notify(&self, _atom: &AtomId) {
            self.notifies.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn default_methods_are_noops() {
        let a = Atom::value(0_i32);
        let tracer = NoopTracer;
        tracer.on_cache_hit(a.id());
        tracer.on_invalidated(a.id(), InvalidationReason::Manual);
    }

    #[test]
    fn counting_tracer_observes_selected_events() {
        let a = Atom::value(0_i32);
        let tracer = CountingTracer {
            computes: AtomicUsize::new(0),
            notifies: AtomicUsize::new(0),
        };
        tracer.on_compute_end(a.id(), ComputeResult::Changed);
        tracer.on_compute_end(a.id(), ComputeResult::Verified);
        tracer.on_notify(a.id());
        assert_eq!(tracer.computes.load(Ordering::Relaxed), 1);
        assert_eq!(tracer.notifies.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn tracer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopTracer>();
        assert_send_sync::<Arc<dyn Tracer>>();
    }
}
