//! Per-scope node records and the arena that holds them.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use slab::Slab;

use crate::atom::{AtomId, BindHookFn, Teardown};
use crate::error::AtomError;
use crate::pending::{AsyncDeps, PendingCell};
use crate::scope::Getter;
use crate::value::ErasedValue;

pub(crate) type AHashSet<T> = HashSet<T, ahash::RandomState>;
pub(crate) type AHashMap<K, V> = HashMap<K, V, ahash::RandomState>;

/// Evaluation status of an atom record.
///
/// `Unset` and `Stale` are internal sentinels: `get` never returns a value
/// for a record in either state without recomputing first. They are exposed
/// only through debugging surfaces ([`Scope::state`](crate::Scope::state) and
/// the [`Tracer`](crate::Tracer)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellState {
    /// Never computed in this scope.
    Unset,
    /// Computed once, but a dependency changed since.
    Stale,
    /// Cached value is current.
    Fresh,
}

/// One dependency edge: the atom read and the revision at which its value had
/// last changed when this record observed it.
#[derive(Clone)]
pub(crate) struct DepEdge {
    pub id: AtomId,
    pub seen_changed_at: u64,
}

pub(crate) type SubscriberFn = Arc<dyn Fn(&dyn Any) + Send + Sync>;

pub(crate) struct Subscriber {
    pub id: u64,
    pub callback: SubscriberFn,
}

/// What a read function produced: a settled value, or a future plus the
/// collector its asynchronous getter appends dependencies into.
pub(crate) enum ReadOutcome {
    Ready(ErasedValue),
    Future {
        future: BoxFuture<'static, Result<ErasedValue, AtomError>>,
        deps: AsyncDeps,
    },
}

pub(crate) type ErasedReadFn =
    Arc<dyn Fn(&mut Getter<'_>) -> Result<ReadOutcome, AtomError> + Send + Sync>;

/// Mutable runtime state for one atom in one scope.
pub(crate) struct NodeRecord {
    pub id: AtomId,
    pub state: CellState,
    pub value: Option<ErasedValue>,
    /// Revision at which the value last actually changed.
    pub changed_at: u64,
    /// Revision whose value subscribers have already been notified of.
    pub notified_at: u64,
    /// Longest dependency chain below this record; notification order.
    pub height: u32,
    /// Set when a manual invalidation must force re-execution even though no
    /// dependency changed.
    pub forced: bool,
    pub dependencies: Vec<DepEdge>,
    pub dependents: AHashSet<AtomId>,
    pub read: Option<ErasedReadFn>,
    pub bind_hook: Option<BindHookFn>,
    pub teardown: Mutex<Option<Teardown>>,
    pub subscribers: Vec<Subscriber>,
    /// In-flight asynchronous computation, if any.
    pub pending: Option<PendingCell>,
    /// Token generator for in-flight computations; the live token is the one
    /// held by `pending`.
    pub next_token: u64,
}

impl NodeRecord {
    fn empty(id: AtomId) -> Self {
        NodeRecord {
            id,
            state: CellState::Unset,
            value: None,
            changed_at: 0,
            notified_at: 0,
            height: 0,
            forced: false,
            dependencies: Vec::new(),
            dependents: AHashSet::default(),
            read: None,
            bind_hook: None,
            teardown: Mutex::new(None),
            subscribers: Vec::new(),
            pending: None,
            next_token: 0,
        }
    }

    /// Leaf record: starts fresh at the initial value.
    pub fn leaf(id: AtomId, initial: ErasedValue, revision: u64) -> Self {
        NodeRecord {
            state: CellState::Fresh,
            value: Some(initial),
            changed_at: revision,
            ..NodeRecord::empty(id)
        }
    }

    /// Derived record: computed on first read.
    pub fn derived(id: AtomId, read: ErasedReadFn) -> Self {
        NodeRecord {
            read: Some(read),
            ..NodeRecord::empty(id)
        }
    }

    /// Record with no read channel (write-only action atom).
    pub fn bare(id: AtomId) -> Self {
        NodeRecord::empty(id)
    }
}

/// Arena of node records with an identity index. Slots are never reclaimed;
/// a record lives as long as its scope.
#[derive(Default)]
pub(crate) struct NodeTable {
    slots: Slab<NodeRecord>,
    index: AHashMap<AtomId, usize>,
}

impl NodeTable {
    pub fn slot_of(&self, id: &AtomId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, slot: usize) -> &NodeRecord {
        &self.slots[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut NodeRecord {
        &mut self.slots[slot]
    }

    pub fn insert(&mut self, record: NodeRecord) -> usize {
        let id = record.id.clone();
        let slot = self.slots.insert(record);
        self.index.insert(id, slot);
        slot
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &NodeRecord)> {
        self.slots.iter()
    }
}
