//! The scope: runtime store for a set of atoms.
//!
//! A [`Scope`] owns the mutable side of the graph — cached values, dependency
//! edges, subscriptions — while atom descriptors stay immutable and shared.
//! All graph mutation is single-logical-thread: a write completes its full
//! invalidation and notification batch before another operation begins, and
//! suspension happens only at the boundary of an asynchronous read function.
//!
//! Reads are pull-based: a `get` recomputes exactly the stale part of the
//! graph below the requested atom, depth-first, memoized by record status, so
//! every derived value observes fully-updated dependencies (glitch freedom).
//! Writes only mark; recomputation happens on the next read or, for atoms
//! with subscribers, eagerly when the batch settles.

use std::any::Any;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::FutureExt;
use parking_lot::{Mutex, RwLock};

use crate::atom::{Atom, AtomId, ReadKind, WriteKind};
use crate::error::AtomError;
use crate::node::{
    AHashSet, CellState, DepEdge, NodeRecord, NodeTable, ReadOutcome, Subscriber, SubscriberFn,
};
use crate::pending::{AsyncDeps, AsyncGetter, PendingCell, PendingValue};
use crate::tracer::{ComputeResult, InvalidationReason, NoopTracer, SettleOutcome, Tracer};
use crate::value::{AtomOutput, AtomValue, ErasedValue};

// Thread-local evaluation stack for cycle detection.
thread_local! {
    static EVAL_STACK: RefCell<Vec<AtomId>> = const { RefCell::new(Vec::new()) };
}

/// Result of an erased recomputation: a settled value or an in-flight cell.
pub(crate) enum CellValue {
    Ready(ErasedValue),
    Pending(PendingCell),
}

#[derive(Default)]
struct BatchState {
    depth: usize,
    /// Subscribed atoms invalidated since their last successful notification.
    /// Entries survive a batch if their recomputation errors or suspends.
    queue: AHashSet<AtomId>,
}

struct ScopeInner {
    nodes: RwLock<NodeTable>,
    /// Bumped on every value change that enters the graph (leaf write or
    /// async settlement). `changed_at` revisions come from this counter.
    revision: AtomicU64,
    batch: Mutex<BatchState>,
    next_subscriber: AtomicU64,
    tracer: Arc<dyn Tracer>,
}

/// The runtime store owning graph state, caches, and subscriptions for a set
/// of atoms.
///
/// Cheap to clone — all data is behind `Arc`. Each scope evaluates atoms
/// independently: the same descriptor read in two scopes has two records.
///
/// # Example
///
/// ```ignore
/// use atom_flow::{Atom, Scope};
///
/// let count = Atom::value(0_i64);
/// let scope = Scope::new();
///
/// let binding = scope.bind(&count, |n| println!("count is now {n}"));
/// scope.set(&count, 3).unwrap();   // prints "count is now 3"
/// scope.unbind(&binding);
/// ```
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Clone for Scope {
    fn clone(&self) -> Self {
        Scope {
            inner: self.inner.clone(),
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct WeakScope(Weak<ScopeInner>);

impl WeakScope {
    pub(crate) fn upgrade(&self) -> Option<Scope> {
        self.0.upgrade().map(|inner| Scope { inner })
    }
}

/// Builder for [`Scope`] with customizable settings.
pub struct ScopeBuilder {
    tracer: Arc<dyn Tracer>,
}

impl Default for ScopeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        ScopeBuilder {
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Install a [`Tracer`] observing this scope's execution.
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Build the scope.
    pub fn build(self) -> Scope {
        Scope {
            inner: Arc::new(ScopeInner {
                nodes: RwLock::new(NodeTable::default()),
                revision: AtomicU64::new(0),
                batch: Mutex::new(BatchState::default()),
                next_subscriber: AtomicU64::new(1),
                tracer: self.tracer,
            }),
        }
    }
}

/// Handle for one subscription, returned by [`Scope::bind`].
///
/// Dropping the handle does not remove the subscription; call
/// [`Scope::unbind`] explicitly.
#[derive(Debug, Clone)]
pub struct Binding {
    atom: AtomId,
    subscriber: u64,
}

impl Binding {
    /// The atom this binding observes.
    pub fn atom_id(&self) -> &AtomId {
        &self.atom
    }
}

/// Tracking getter passed to derived read functions.
///
/// Every atom read through it is recorded as a dependency of the computing
/// atom and recomputed first if stale, so the read function always observes
/// fully-updated values.
pub struct Getter<'a> {
    scope: &'a Scope,
    parent: AtomId,
    deps: Vec<(AtomId, u64)>,
}

impl<'a> Getter<'a> {
    pub(crate) fn new(scope: &'a Scope, parent: AtomId) -> Self {
        Getter {
            scope,
            parent,
            deps: Vec::new(),
        }
    }

    pub(crate) fn into_deps(self) -> Vec<(AtomId, u64)> {
        self.deps
    }

    pub(crate) fn scope(&self) -> &Scope {
        self.scope
    }

    pub(crate) fn parent(&self) -> &AtomId {
        &self.parent
    }

    /// Read a dependency, suspending with [`AtomError::Pending`] if its own
    /// asynchronous computation has not settled.
    pub fn get<V: AtomOutput, A, R>(&mut self, atom: &Atom<V, A, R>) -> Result<V, AtomError> {
        self.load(atom)?.ready()
    }

    /// Read a dependency, returning the pending future itself when the
    /// dependency's computation is in flight.
    pub fn load<V: AtomOutput, A, R>(
        &mut self,
        atom: &Atom<V, A, R>,
    ) -> Result<AtomValue<V>, AtomError> {
        let slot = self.scope.ensure_record(atom);
        // the inverse edge goes in before computing, so an aborted or
        // suspended run still leaves this atom reachable by invalidation
        self.scope.add_dependent_slot(slot, &self.parent);
        self.scope
            .tracer()
            .on_dependency_registered(&self.parent, atom.id());
        let computed = self.scope.compute_if_needed(slot);
        let seen = self.scope.changed_at_slot(slot);
        if !self.deps.iter().any(|(id, _)| id == atom.id()) {
            self.deps.push((atom.id().clone(), seen));
        }
        match computed? {
            CellValue::Ready(value) => Ok(AtomValue::Ready(
                value
                    .downcast::<V>()
                    .expect("cached value type matches its atom"),
            )),
            CellValue::Pending(cell) => Ok(AtomValue::Pending(PendingValue::new(
                atom.id().clone(),
                cell,
            ))),
        }
    }
}

/// Context passed to write functions: an untracked getter plus a setter that
/// joins the surrounding invalidation batch.
pub struct WriteContext<'a> {
    scope: &'a Scope,
}

impl<'a> WriteContext<'a> {
    /// Read an atom's current value. Reads inside write functions are not
    /// tracked — writes are not computations.
    pub fn get<V: AtomOutput, A, R>(&self, atom: &Atom<V, A, R>) -> Result<V, AtomError> {
        self.scope.get(atom)
    }

    /// Write an atom. Nested writes are part of the outer batch:
    /// notifications fire once, after the outermost write completes.
    pub fn set<V: AtomOutput, A, R>(
        &mut self,
        atom: &Atom<V, A, R>,
        args: A,
    ) -> Result<R, AtomError> {
        self.scope.set(atom, args)
    }

    /// The scope this write runs in.
    pub fn scope(&self) -> &Scope {
        self.scope
    }
}

impl Scope {
    /// Create a scope with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for customizing the scope.
    pub fn builder() -> ScopeBuilder {
        ScopeBuilder::new()
    }

    pub(crate) fn tracer(&self) -> &dyn Tracer {
        self.inner.tracer.as_ref()
    }

    pub(crate) fn downgrade(&self) -> WeakScope {
        WeakScope(Arc::downgrade(&self.inner))
    }

    /// Current value of the atom, recomputing it if stale.
    ///
    /// An atom whose asynchronous computation has not settled yields
    /// `Err(AtomError::Pending)`; use [`load`](Scope::load) for the pending
    /// future or [`get_async`](Scope::get_async) to wait through it.
    pub fn get<V: AtomOutput, A, R>(&self, atom: &Atom<V, A, R>) -> Result<V, AtomError> {
        self.load(atom)?.ready()
    }

    /// Like [`get`](Scope::get), but an in-flight asynchronous computation is
    /// returned as [`AtomValue::Pending`] — the pending future itself —
    /// instead of an error.
    pub fn load<V: AtomOutput, A, R>(
        &self,
        atom: &Atom<V, A, R>,
    ) -> Result<AtomValue<V>, AtomError> {
        let slot = self.ensure_record(atom);
        match self.compute_if_needed(slot)? {
            CellValue::Ready(value) => Ok(AtomValue::Ready(
                value
                    .downcast::<V>()
                    .expect("cached value type matches its atom"),
            )),
            CellValue::Pending(cell) => Ok(AtomValue::Pending(PendingValue::new(
                atom.id().clone(),
                cell,
            ))),
        }
    }

    /// Current value of the atom, waiting through asynchronous computations
    /// (and transparently retrying if one is superseded mid-flight).
    pub async fn get_async<V: AtomOutput, A, R>(
        &self,
        atom: &Atom<V, A, R>,
    ) -> Result<V, AtomError> {
        loop {
            match self.load(atom)? {
                AtomValue::Ready(v) => return Ok(v),
                AtomValue::Pending(pending) => match pending.await {
                    Ok(v) => return Ok(v),
                    Err(AtomError::Superseded) => continue,
                    Err(e) => return Err(e),
                },
            }
        }
    }

    /// Write an atom.
    ///
    /// For a value atom this assigns `args` as the new value: dependents are
    /// marked stale, subscribed atoms whose value actually changed are
    /// recomputed and notified when the batch settles, and assigning an equal
    /// value is a no-op. For an atom with a custom write function, the
    /// function runs with this scope's [`WriteContext`] and its result is
    /// returned; writes it performs join this call's batch, so notifications
    /// still fire exactly once.
    pub fn set<V: AtomOutput, A, R>(&self, atom: &Atom<V, A, R>, args: A) -> Result<R, AtomError> {
        self.ensure_record(atom);
        let write = atom.write_kind();
        self.begin_batch();
        let result = match write {
            WriteKind::Assign(f) | WriteKind::Custom(f) => {
                let mut ctx = WriteContext { scope: self };
                f(&mut ctx, args)
            }
            WriteKind::None => Err(AtomError::ReadOnly {
                id: atom.id().clone(),
            }),
        };
        self.end_batch();
        result
    }

    /// Subscribe to value changes of an atom.
    ///
    /// The callback runs after a write batch settles, once per batch, when
    /// the atom's recomputed value differs from the last one notified.
    /// Callbacks fire in dependency order: an atom's dependencies are
    /// notified before the atom itself.
    ///
    /// The first binding on an atom runs its bind-lifecycle hook, if any.
    pub fn bind<V: AtomOutput, A, R>(
        &self,
        atom: &Atom<V, A, R>,
        callback: impl Fn(&V) + Send + Sync + 'static,
    ) -> Binding {
        let slot = self.ensure_record(atom);
        let subscriber = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let erased: SubscriberFn = Arc::new(move |value: &dyn Any| {
            if let Some(v) = value.downcast_ref::<V>() {
                callback(v);
            }
        });
        let (first, hook) = {
            let mut nodes = self.inner.nodes.write();
            let rec = nodes.get_mut(slot);
            let first = rec.subscribers.is_empty();
            rec.subscribers.push(Subscriber {
                id: subscriber,
                callback: erased,
            });
            (first, if first { rec.bind_hook.clone() } else { None })
        };
        if let Some(hook) = hook {
            tracing::trace!(atom = %atom.id(), "running bind hook");
            if let Some(teardown) = hook(self) {
                let nodes = self.inner.nodes.read();
                *nodes.get(slot).teardown.lock() = Some(teardown);
            }
        }
        // Establish the atom's dependency edges now, so writes anywhere in
        // the graph reach this subscription; the current value becomes the
        // notification baseline.
        if let Err(e) = self.compute_if_needed(slot) {
            tracing::debug!(atom = %atom.id(), error = %e, "bound atom not computable yet");
        }
        if first {
            let mut nodes = self.inner.nodes.write();
            let rec = nodes.get_mut(slot);
            rec.notified_at = rec.changed_at;
        }
        Binding {
            atom: atom.id().clone(),
            subscriber,
        }
    }

    /// Remove one subscription. Unbinding a callback that is no longer
    /// registered is a no-op. When the atom's last subscriber is removed, its
    /// teardown (if any) runs exactly once.
    pub fn unbind(&self, binding: &Binding) {
        let teardown = {
            let mut nodes = self.inner.nodes.write();
            let Some(slot) = nodes.slot_of(&binding.atom) else {
                return;
            };
            let rec = nodes.get_mut(slot);
            let before = rec.subscribers.len();
            rec.subscribers.retain(|s| s.id != binding.subscriber);
            if rec.subscribers.len() < before && rec.subscribers.is_empty() {
                rec.teardown.lock().take()
            } else {
                None
            }
        };
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    /// Remove all subscriptions of one atom.
    pub fn unbind_atom<V: AtomOutput, A, R>(&self, atom: &Atom<V, A, R>) {
        let teardown = {
            let mut nodes = self.inner.nodes.write();
            let Some(slot) = nodes.slot_of(atom.id()) else {
                return;
            };
            let rec = nodes.get_mut(slot);
            if rec.subscribers.is_empty() {
                None
            } else {
                rec.subscribers.clear();
                rec.teardown.lock().take()
            }
        };
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    /// Remove every subscription in this scope.
    pub fn unbind_all(&self) {
        let teardowns: Vec<crate::atom::Teardown> = {
            let mut nodes = self.inner.nodes.write();
            let slots: Vec<usize> = nodes.iter().map(|(slot, _)| slot).collect();
            let mut teardowns = Vec::new();
            for slot in slots {
                let rec = nodes.get_mut(slot);
                if !rec.subscribers.is_empty() {
                    rec.subscribers.clear();
                    if let Some(teardown) = rec.teardown.lock().take() {
                        teardowns.push(teardown);
                    }
                }
            }
            teardowns
        };
        for teardown in teardowns {
            teardown();
        }
    }

    /// Force the atom (and transitively its dependents) to recompute on next
    /// read, even though no dependency changed.
    pub fn invalidate<V: AtomOutput, A, R>(&self, atom: &Atom<V, A, R>) {
        self.begin_batch();
        let queue = {
            let mut nodes = self.inner.nodes.write();
            let mut queue = AHashSet::default();
            if let Some(slot) = nodes.slot_of(atom.id()) {
                {
                    let rec = nodes.get_mut(slot);
                    rec.pending = None;
                    rec.forced = true;
                    if rec.state == CellState::Fresh {
                        rec.state = CellState::Stale;
                    }
                    self.inner
                        .tracer
                        .on_invalidated(&rec.id, InvalidationReason::Manual);
                    if !rec.subscribers.is_empty() {
                        queue.insert(rec.id.clone());
                    }
                }
                self.invalidate_dependents_locked(&mut nodes, &mut queue, slot);
            }
            queue
        };
        if !queue.is_empty() {
            self.inner.batch.lock().queue.extend(queue);
        }
        self.end_batch();
    }

    /// Cached value, if the atom is fresh in this scope. Never recomputes and
    /// never tracks; a debugging surface.
    pub fn peek<V: AtomOutput, A, R>(&self, atom: &Atom<V, A, R>) -> Option<V> {
        let nodes = self.inner.nodes.read();
        let slot = nodes.slot_of(atom.id())?;
        let rec = nodes.get(slot);
        if rec.state == CellState::Fresh {
            rec.value.as_ref().and_then(|v| v.downcast::<V>())
        } else {
            None
        }
    }

    /// Evaluation status of the atom's record in this scope, if one exists.
    /// A debugging surface; `get` never exposes the sentinel states.
    pub fn state<V: AtomOutput, A, R>(&self, atom: &Atom<V, A, R>) -> Option<CellState> {
        let nodes = self.inner.nodes.read();
        let slot = nodes.slot_of(atom.id())?;
        Some(nodes.get(slot).state)
    }

    /// Number of active subscriptions on the atom in this scope.
    pub fn subscriber_count<V: AtomOutput, A, R>(&self, atom: &Atom<V, A, R>) -> usize {
        let nodes = self.inner.nodes.read();
        nodes
            .slot_of(atom.id())
            .map(|slot| nodes.get(slot).subscribers.len())
            .unwrap_or(0)
    }
}

// Internal engine.
impl Scope {
    /// Record for `atom`, created lazily on first read, write, or bind.
    pub(crate) fn ensure_record<V: AtomOutput, A, R>(&self, atom: &Atom<V, A, R>) -> usize {
        if let Some(slot) = self.inner.nodes.read().slot_of(atom.id()) {
            return slot;
        }
        let mut nodes = self.inner.nodes.write();
        if let Some(slot) = nodes.slot_of(atom.id()) {
            return slot;
        }
        let id = atom.id().clone();
        let mut record = match atom.read_kind() {
            ReadKind::Initial(initial) => NodeRecord::leaf(
                id,
                ErasedValue::new(initial.clone()),
                self.inner.revision.load(Ordering::Acquire),
            ),
            ReadKind::Derived(read) => {
                let read = read.clone();
                NodeRecord::derived(
                    id,
                    Arc::new(move |getter: &mut Getter<'_>| {
                        read(getter).map(|v| ReadOutcome::Ready(ErasedValue::new(v)))
                    }),
                )
            }
            ReadKind::DerivedAsync(read) => {
                let read = read.clone();
                NodeRecord::derived(
                    id,
                    Arc::new(move |getter: &mut Getter<'_>| {
                        let deps: AsyncDeps = Arc::new(Mutex::new(Vec::new()));
                        let ctx = AsyncGetter::new(
                            getter.scope().clone(),
                            getter.parent().clone(),
                            deps.clone(),
                        );
                        let future = read(ctx);
                        let future = async move { future.await.map(ErasedValue::new) }.boxed();
                        Ok(ReadOutcome::Future { future, deps })
                    }),
                )
            }
            ReadKind::None => NodeRecord::bare(id),
        };
        record.bind_hook = atom.bind_hook();
        nodes.insert(record)
    }

    pub(crate) fn changed_at_slot(&self, slot: usize) -> u64 {
        self.inner.nodes.read().get(slot).changed_at
    }

    fn changed_at_of(&self, id: &AtomId) -> Option<u64> {
        let nodes = self.inner.nodes.read();
        let slot = nodes.slot_of(id)?;
        Some(nodes.get(slot).changed_at)
    }

    pub(crate) fn add_dependent_slot(&self, slot: usize, dependent: &AtomId) {
        let mut nodes = self.inner.nodes.write();
        let rec = nodes.get_mut(slot);
        if rec.id != *dependent {
            rec.dependents.insert(dependent.clone());
        }
    }

    fn compute_id(&self, id: &AtomId) -> Option<Result<CellValue, AtomError>> {
        let slot = self.inner.nodes.read().slot_of(id)?;
        Some(self.compute_if_needed(slot))
    }

    /// Return the atom's current value, recomputing only if the record is
    /// stale or uncomputed.
    ///
    /// A stale record first refreshes its dependencies, then re-executes the
    /// read function only if one of them actually changed value since the
    /// last run — otherwise it is marked fresh as-is. Executions run with a
    /// tracking getter and no engine lock held.
    pub(crate) fn compute_if_needed(&self, slot: usize) -> Result<CellValue, AtomError> {
        let id = self.inner.nodes.read().get(slot).id.clone();

        let on_stack = EVAL_STACK.with(|s| s.borrow().iter().any(|k| *k == id));
        if on_stack {
            let path: Vec<AtomId> = EVAL_STACK.with(|s| {
                let mut p = s.borrow().clone();
                p.push(id.clone());
                p
            });
            self.inner.tracer.on_cycle_detected(&path);
            return Err(AtomError::Cycle {
                path: path.iter().map(|a| a.name().to_string()).collect(),
            });
        }

        let (state, edges) = {
            let nodes = self.inner.nodes.read();
            let rec = nodes.get(slot);
            if let Some(cell) = &rec.pending {
                return Ok(CellValue::Pending(cell.clone()));
            }
            if rec.state == CellState::Fresh {
                self.inner.tracer.on_cache_hit(&rec.id);
                return Ok(CellValue::Ready(
                    rec.value
                        .clone()
                        .expect("fresh record always holds a value"),
                ));
            }
            if rec.forced {
                (rec.state, Vec::new())
            } else {
                (rec.state, rec.dependencies.clone())
            }
        };

        if state == CellState::Stale && !edges.is_empty() {
            let mut dep_changed = false;
            for edge in &edges {
                match self.compute_id(&edge.id) {
                    Some(Ok(CellValue::Ready(_))) => {
                        let now = self.changed_at_of(&edge.id).unwrap_or(u64::MAX);
                        if now > edge.seen_changed_at {
                            dep_changed = true;
                            break;
                        }
                    }
                    // a pending, failed, or missing dependency falls through
                    // to execution, which surfaces the condition if the
                    // dependency is still read
                    _ => {
                        dep_changed = true;
                        break;
                    }
                }
            }
            if !dep_changed {
                let mut nodes = self.inner.nodes.write();
                let rec = nodes.get_mut(slot);
                if let Some(value) = rec.value.clone() {
                    rec.state = CellState::Fresh;
                    self.inner
                        .tracer
                        .on_compute_end(&rec.id, ComputeResult::Verified);
                    return Ok(CellValue::Ready(value));
                }
            }
        }

        let read = self.inner.nodes.read().get(slot).read.clone();
        let Some(read) = read else {
            // leaf invalidated without a value change, or a write-only atom
            let mut nodes = self.inner.nodes.write();
            let rec = nodes.get_mut(slot);
            rec.forced = false;
            if let Some(value) = rec.value.clone() {
                rec.state = CellState::Fresh;
                return Ok(CellValue::Ready(value));
            }
            return Err(AtomError::Uninitialized { id });
        };

        self.inner.tracer.on_compute_start(&id, state);
        tracing::trace!(atom = %id, ?state, "recomputing");
        EVAL_STACK.with(|s| s.borrow_mut().push(id.clone()));
        let mut getter = Getter::new(self, id.clone());
        let outcome = read(&mut getter);
        let deps = getter.into_deps();
        EVAL_STACK.with(|s| {
            s.borrow_mut().pop();
        });

        match outcome {
            Err(e) => {
                // not cached: the record stays stale so the next read retries
                self.inner.tracer.on_compute_end(&id, ComputeResult::Error);
                Err(e)
            }
            Ok(ReadOutcome::Ready(new_value)) => {
                let revision = self.inner.revision.load(Ordering::Acquire);
                let (changed, value) = {
                    let mut nodes = self.inner.nodes.write();
                    let changed = self.commit_value(&mut nodes, slot, new_value, deps, revision);
                    (
                        changed,
                        nodes.get(slot).value.clone().expect("just committed"),
                    )
                };
                self.inner.tracer.on_compute_end(
                    &id,
                    if changed {
                        ComputeResult::Changed
                    } else {
                        ComputeResult::Unchanged
                    },
                );
                Ok(CellValue::Ready(value))
            }
            Ok(ReadOutcome::Future {
                future,
                deps: async_deps,
            }) => {
                if !deps.is_empty() {
                    async_deps.lock().extend(deps);
                }
                let cell = {
                    let mut nodes = self.inner.nodes.write();
                    let rec = nodes.get_mut(slot);
                    rec.forced = false;
                    rec.next_token += 1;
                    let cell = PendingCell::new(
                        id.clone(),
                        rec.next_token,
                        self.downgrade(),
                        future,
                        async_deps,
                    );
                    rec.pending = Some(cell.clone());
                    cell
                };
                self.inner.tracer.on_pending_started(&id, cell.token());
                // run the synchronous prefix now, so dependencies read before
                // the first suspension point are registered immediately; a
                // future with no suspension point settles right here
                cell.prime();
                let settled_early = {
                    let nodes = self.inner.nodes.read();
                    let rec = nodes.get(slot);
                    if rec.pending.is_none() && rec.state == CellState::Fresh {
                        rec.value.clone()
                    } else {
                        None
                    }
                };
                if let Some(value) = settled_early {
                    return Ok(CellValue::Ready(value));
                }
                if let Some(Err(e)) = cell.try_done() {
                    // settled synchronously with an error; surface it now
                    return Err(e);
                }
                Ok(CellValue::Pending(cell))
            }
        }
    }

    /// Store a computed value: rebuild dependency edges symmetrically, detect
    /// change by equality, and mark fresh. An unchanged value keeps its old
    /// `changed_at`, which is what stops propagation to grand-dependents.
    fn commit_value(
        &self,
        nodes: &mut NodeTable,
        slot: usize,
        new_value: ErasedValue,
        deps: Vec<(AtomId, u64)>,
        revision: u64,
    ) -> bool {
        let self_id = nodes.get(slot).id.clone();
        let old_ids: Vec<AtomId> = nodes
            .get(slot)
            .dependencies
            .iter()
            .map(|e| e.id.clone())
            .collect();
        for old in &old_ids {
            if !deps.iter().any(|(id, _)| id == old) {
                if let Some(old_slot) = nodes.slot_of(old) {
                    nodes.get_mut(old_slot).dependents.remove(&self_id);
                }
            }
        }
        let mut height = 0;
        for (dep_id, _) in &deps {
            if let Some(dep_slot) = nodes.slot_of(dep_id) {
                height = height.max(nodes.get(dep_slot).height + 1);
            }
        }
        let rec = nodes.get_mut(slot);
        rec.dependencies = deps
            .into_iter()
            .map(|(id, seen_changed_at)| DepEdge {
                id,
                seen_changed_at,
            })
            .collect();
        rec.height = height;
        rec.forced = false;
        let changed = match &rec.value {
            Some(old) => !old.eq_value(&new_value),
            None => true,
        };
        if changed {
            rec.value = Some(new_value);
            rec.changed_at = revision;
        }
        rec.state = CellState::Fresh;
        changed
    }

    /// Assign a leaf atom's value. Equal values are a no-op; changed values
    /// bump the revision, mark the transitive dependents stale, and queue
    /// subscribed records for notification when the batch settles.
    pub(crate) fn write_leaf(&self, id: &AtomId, new_value: ErasedValue) -> Result<(), AtomError> {
        let queue = {
            let mut nodes = self.inner.nodes.write();
            let Some(slot) = nodes.slot_of(id) else {
                return Err(AtomError::Uninitialized { id: id.clone() });
            };
            {
                let rec = nodes.get(slot);
                if let Some(old) = &rec.value {
                    if old.eq_value(&new_value) {
                        return Ok(());
                    }
                }
            }
            let revision = self.inner.revision.fetch_add(1, Ordering::AcqRel) + 1;
            let mut queue = AHashSet::default();
            {
                let rec = nodes.get_mut(slot);
                rec.value = Some(new_value);
                rec.changed_at = revision;
                rec.state = CellState::Fresh;
                rec.pending = None;
                self.inner
                    .tracer
                    .on_invalidated(&rec.id, InvalidationReason::LeafWrite);
                tracing::trace!(atom = %rec.id, revision, "leaf written");
                if !rec.subscribers.is_empty() {
                    queue.insert(rec.id.clone());
                }
            }
            self.invalidate_dependents_locked(&mut nodes, &mut queue, slot);
            queue
        };
        if !queue.is_empty() {
            self.inner.batch.lock().queue.extend(queue);
        }
        Ok(())
    }

    /// Mark the transitive dependents of `start_slot` stale, in one pass that
    /// short-circuits records that are already invalid (their dependents were
    /// marked when they became stale, which bounds diamond fan-out).
    ///
    /// Any in-flight asynchronous computation on a marked record is
    /// superseded: its token dies here and its eventual result is discarded.
    fn invalidate_dependents_locked(
        &self,
        nodes: &mut NodeTable,
        queue: &mut AHashSet<AtomId>,
        start_slot: usize,
    ) {
        let mut work: Vec<AtomId> = nodes.get(start_slot).dependents.iter().cloned().collect();
        while let Some(id) = work.pop() {
            let Some(slot) = nodes.slot_of(&id) else {
                continue;
            };
            let rec = nodes.get_mut(slot);
            rec.pending = None;
            match rec.state {
                CellState::Fresh => {
                    rec.state = CellState::Stale;
                    self.inner
                        .tracer
                        .on_invalidated(&rec.id, InvalidationReason::DependencyChanged);
                    if !rec.subscribers.is_empty() {
                        queue.insert(rec.id.clone());
                    }
                    work.extend(rec.dependents.iter().cloned());
                }
                CellState::Stale | CellState::Unset => {
                    if !rec.subscribers.is_empty() {
                        queue.insert(rec.id.clone());
                    }
                }
            }
        }
    }

    fn begin_batch(&self) {
        self.inner.batch.lock().depth += 1;
    }

    /// Close one nesting level; when the outermost level closes, recompute
    /// the queued subscribed atoms in dependency order and notify the ones
    /// whose value actually changed.
    fn end_batch(&self) {
        let pending: Vec<AtomId> = {
            let mut batch = self.inner.batch.lock();
            debug_assert!(batch.depth > 0, "unbalanced batch");
            batch.depth = batch.depth.saturating_sub(1);
            if batch.depth > 0 || batch.queue.is_empty() {
                return;
            }
            batch.queue.iter().cloned().collect()
        };
        let mut ordered: Vec<(u32, u64, AtomId)> = {
            let nodes = self.inner.nodes.read();
            pending
                .into_iter()
                .map(|id| {
                    let height = nodes
                        .slot_of(&id)
                        .map(|slot| nodes.get(slot).height)
                        .unwrap_or(0);
                    (height, id.serial(), id)
                })
                .collect()
        };
        ordered.sort_by_key(|(height, serial, _)| (*height, *serial));
        for (_, _, id) in ordered {
            self.flush_subscribed(&id);
        }
    }

    /// Recompute one queued record and fire its callbacks if the value moved
    /// past the last notified revision. Errors and still-pending computations
    /// leave the record queued: it is retried on the next batch or when the
    /// pending computation settles.
    fn flush_subscribed(&self, id: &AtomId) {
        let Some(slot) = self.inner.nodes.read().slot_of(id) else {
            self.inner.batch.lock().queue.remove(id);
            return;
        };
        match self.compute_if_needed(slot) {
            Ok(CellValue::Ready(value)) => {
                let callbacks = {
                    let mut nodes = self.inner.nodes.write();
                    let rec = nodes.get_mut(slot);
                    if !rec.subscribers.is_empty() && rec.changed_at > rec.notified_at {
                        rec.notified_at = rec.changed_at;
                        Some(
                            rec.subscribers
                                .iter()
                                .map(|s| s.callback.clone())
                                .collect::<Vec<_>>(),
                        )
                    } else {
                        None
                    }
                };
                self.inner.batch.lock().queue.remove(id);
                if let Some(callbacks) = callbacks {
                    self.inner.tracer.on_notify(id);
                    tracing::trace!(atom = %id, "notifying subscribers");
                    for callback in callbacks {
                        callback(value.as_any());
                    }
                }
            }
            Ok(CellValue::Pending(_)) => {
                // settlement re-enters the batch protocol and flushes then
            }
            Err(e) => {
                tracing::debug!(atom = %id, error = %e, "notification deferred; record stays stale");
            }
        }
    }

    /// Commit or discard a settled asynchronous computation.
    ///
    /// Only the token currently held by the record may commit; anything else
    /// was superseded by an invalidation and resolves to
    /// [`AtomError::Superseded`]. A committed value goes through the same
    /// change-detection, invalidation, and notification protocol as a
    /// synchronous write.
    pub(crate) fn settle(
        &self,
        id: &AtomId,
        token: u64,
        result: Result<ErasedValue, AtomError>,
        deps: Vec<(AtomId, u64)>,
    ) -> Result<ErasedValue, AtomError> {
        self.begin_batch();
        let out = self.settle_inner(id, token, result, deps);
        self.end_batch();
        out
    }

    fn settle_inner(
        &self,
        id: &AtomId,
        token: u64,
        result: Result<ErasedValue, AtomError>,
        deps: Vec<(AtomId, u64)>,
    ) -> Result<ErasedValue, AtomError> {
        let mut nodes = self.inner.nodes.write();
        let Some(slot) = nodes.slot_of(id) else {
            return result;
        };
        let current = nodes
            .get(slot)
            .pending
            .as_ref()
            .is_some_and(|cell| cell.token() == token);
        if !current {
            self.inner
                .tracer
                .on_pending_settled(id, token, SettleOutcome::Superseded);
            tracing::debug!(atom = %id, token, "discarding superseded computation");
            return match result {
                Ok(_) => Err(AtomError::Superseded),
                Err(e) => Err(e),
            };
        }
        nodes.get_mut(slot).pending = None;
        match result {
            Err(e) => {
                self.inner
                    .tracer
                    .on_pending_settled(id, token, SettleOutcome::Rejected);
                // record stays stale; the next read retries
                Err(e)
            }
            Ok(new_value) => {
                let value_changed = nodes
                    .get(slot)
                    .value
                    .as_ref()
                    .map_or(true, |old| !old.eq_value(&new_value));
                let revision = if value_changed {
                    self.inner.revision.fetch_add(1, Ordering::AcqRel) + 1
                } else {
                    self.inner.revision.load(Ordering::Acquire)
                };
                let changed = self.commit_value(&mut nodes, slot, new_value, deps, revision);
                let mut queue = AHashSet::default();
                if changed {
                    if !nodes.get(slot).subscribers.is_empty() {
                        queue.insert(id.clone());
                    }
                    self.invalidate_dependents_locked(&mut nodes, &mut queue, slot);
                }
                self.inner
                    .tracer
                    .on_pending_settled(id, token, SettleOutcome::Committed { changed });
                let value = nodes.get(slot).value.clone().expect("just committed");
                drop(nodes);
                if !queue.is_empty() {
                    self.inner.batch.lock().queue.extend(queue);
                }
                Ok(value)
            }
        }
    }
}
