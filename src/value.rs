//! Type-erased value channel.
//!
//! Scopes cache atom values type-erased so one node table can hold every
//! atom's state. Equality stays observable through erasure via [`AnyValue`],
//! which is what change detection (early cutoff) runs on.

use std::any::Any;
use std::sync::Arc;

use crate::error::AtomError;
use crate::pending::PendingValue;

/// Convenience trait capturing the bounds an atom's value type must satisfy.
///
/// - `PartialEq` drives change detection: a recomputation that produces an
///   equal value does not propagate to dependents or subscribers.
/// - `Clone` lets `get` hand out the value while the cache keeps its copy.
/// - `Send + Sync + 'static` let values live in the scope's shared cache.
pub trait AtomOutput: PartialEq + Clone + Send + Sync + 'static {}
impl<T: PartialEq + Clone + Send + Sync + 'static> AtomOutput for T {}

/// Object-safe value with equality comparison.
///
/// Enables comparing two erased values by downcasting to the concrete type.
pub(crate) trait AnyValue: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Returns `true` if `other` is the same concrete type and equal to `self`.
    fn value_eq(&self, other: &dyn AnyValue) -> bool;
}

impl<T: PartialEq + Send + Sync + 'static> AnyValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn value_eq(&self, other: &dyn AnyValue) -> bool {
        other.as_any().downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// A cached atom value with its concrete type erased.
///
/// Clone is cheap; the payload is behind `Arc`.
#[derive(Clone)]
pub(crate) struct ErasedValue(Arc<dyn AnyValue>);

impl ErasedValue {
    pub(crate) fn new<T: AtomOutput>(value: T) -> Self {
        ErasedValue(Arc::new(value))
    }

    pub(crate) fn eq_value(&self, other: &ErasedValue) -> bool {
        self.0.value_eq(other.0.as_ref())
    }

    pub(crate) fn downcast<T: AtomOutput>(&self) -> Option<T> {
        self.0.as_any().downcast_ref::<T>().cloned()
    }

    pub(crate) fn as_any(&self) -> &dyn Any {
        self.0.as_any()
    }
}

/// The result of loading an atom: either a settled value or the in-flight
/// future of an asynchronous computation.
///
/// Returned by [`Scope::load`](crate::Scope::load) and
/// [`Getter::load`](crate::Getter::load). Use [`ready`](AtomValue::ready)
/// with the `?` operator to suspend on a pending value:
///
/// ```ignore
/// let value = scope.load(&config)?.ready()?;
/// ```
pub enum AtomValue<V> {
    /// The value is computed and current.
    Ready(V),
    /// The value is still being computed; the future settles with it.
    Pending(PendingValue<V>),
}

impl<V: AtomOutput> AtomValue<V> {
    /// Returns the settled value, or `Err(AtomError::Pending)` if the
    /// computation is still in flight.
    pub fn ready(self) -> Result<V, AtomError> {
        match self {
            AtomValue::Ready(v) => Ok(v),
            AtomValue::Pending(p) => Err(AtomError::Pending {
                id: p.atom_id().clone(),
            }),
        }
    }

    /// `true` if the value is settled.
    pub fn is_ready(&self) -> bool {
        matches!(self, AtomValue::Ready(_))
    }

    /// `true` if the computation is still in flight.
    pub fn is_pending(&self) -> bool {
        matches!(self, AtomValue::Pending(_))
    }

    /// The settled value, if any.
    pub fn value(self) -> Option<V> {
        match self {
            AtomValue::Ready(v) => Some(v),
            AtomValue::Pending(_) => None,
        }
    }

    /// The pending future, if the computation is in flight.
    pub fn pending(self) -> Option<PendingValue<V>> {
        match self {
            AtomValue::Ready(_) => None,
            AtomValue::Pending(p) => Some(p),
        }
    }
}
