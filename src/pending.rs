//! Asynchronous value coordination.
//!
//! An atom whose read function returns a future gets an in-flight token and a
//! shared [`PendingValue`] handle. The underlying computation is driven
//! cooperatively: whoever awaits the handle polls it, and the settlement of
//! the *current* token re-enters the scope's normal commit and notification
//! protocol. If the record is invalidated before the future settles, the
//! token is superseded — the stale result is discarded, never cached and
//! never notified, and awaiters of the old handle observe
//! [`AtomError::Superseded`].

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::atom::{Atom, AtomId};
use crate::error::AtomError;
use crate::scope::{CellValue, Scope, WeakScope};
use crate::value::{AtomOutput, ErasedValue};

/// Dependencies observed by an asynchronous read, appended as its future
/// reads atoms across suspension points.
pub(crate) type AsyncDeps = Arc<Mutex<Vec<(AtomId, u64)>>>;

enum PendingState {
    Running {
        /// Taken out while a poll is driving it.
        future: Option<BoxFuture<'static, Result<ErasedValue, AtomError>>>,
        deps: AsyncDeps,
        wakers: Vec<Waker>,
    },
    Done(Result<ErasedValue, AtomError>),
}

struct PendingShared {
    atom: AtomId,
    token: u64,
    scope: WeakScope,
    state: Mutex<PendingState>,
}

/// Shared handle to one in-flight computation. Clone is cheap.
#[derive(Clone)]
pub(crate) struct PendingCell(Arc<PendingShared>);

impl PendingCell {
    pub(crate) fn new(
        atom: AtomId,
        token: u64,
        scope: WeakScope,
        future: BoxFuture<'static, Result<ErasedValue, AtomError>>,
        deps: AsyncDeps,
    ) -> Self {
        PendingCell(Arc::new(PendingShared {
            atom,
            token,
            scope,
            state: Mutex::new(PendingState::Running {
                future: Some(future),
                deps,
                wakers: Vec::new(),
            }),
        }))
    }

    pub(crate) fn token(&self) -> u64 {
        self.0.token
    }

    /// The settled result, if the computation already completed.
    pub(crate) fn try_done(&self) -> Option<Result<ErasedValue, AtomError>> {
        match &*self.0.state.lock() {
            PendingState::Done(result) => Some(result.clone()),
            PendingState::Running { .. } => None,
        }
    }

    /// Poll once with a no-op waker, so the synchronous prefix of the read
    /// function runs (and registers its dependencies) as soon as the future
    /// is issued. A computation with no suspension point settles right here.
    pub(crate) fn prime(&self) {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let _ = self.poll_value(&mut cx);
    }

    pub(crate) fn poll_value(&self, cx: &mut Context<'_>) -> Poll<Result<ErasedValue, AtomError>> {
        let mut future = {
            let mut state = self.0.state.lock();
            match &mut *state {
                PendingState::Done(result) => return Poll::Ready(result.clone()),
                PendingState::Running { future, wakers, .. } => match future.take() {
                    Some(f) => f,
                    None => {
                        // another poll is driving; wait for completion
                        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                            wakers.push(cx.waker().clone());
                        }
                        return Poll::Pending;
                    }
                },
            }
        };

        // The lock is released while the inner future runs: it may re-enter
        // the scope to read dependencies.
        match future.as_mut().poll(cx) {
            Poll::Pending => {
                let mut state = self.0.state.lock();
                if let PendingState::Running { future: slot, wakers, .. } = &mut *state {
                    *slot = Some(future);
                    if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                        wakers.push(cx.waker().clone());
                    }
                }
                Poll::Pending
            }
            Poll::Ready(result) => {
                let deps = {
                    let state = self.0.state.lock();
                    match &*state {
                        PendingState::Running { deps, .. } => deps.lock().clone(),
                        PendingState::Done(_) => Vec::new(),
                    }
                };
                // Settlement re-enters the invalidation/notification protocol;
                // a superseded token is discarded there.
                let settled = match self.0.scope.upgrade() {
                    Some(scope) => scope.settle(&self.0.atom, self.0.token, result, deps),
                    None => result,
                };
                let wakers = {
                    let mut state = self.0.state.lock();
                    let previous =
                        std::mem::replace(&mut *state, PendingState::Done(settled.clone()));
                    match previous {
                        PendingState::Running { wakers, .. } => wakers,
                        PendingState::Done(_) => Vec::new(),
                    }
                };
                for waker in wakers {
                    waker.wake();
                }
                Poll::Ready(settled)
            }
        }
    }
}

/// The pending future of an atom's asynchronous computation.
///
/// Returned inside [`AtomValue::Pending`](crate::AtomValue::Pending) by
/// [`Scope::load`](crate::Scope::load). Awaiting it drives the computation
/// and resolves with the committed value, with the read function's error, or
/// with [`AtomError::Superseded`] if a dependency changed before settlement.
///
/// Clones share the same in-flight computation.
pub struct PendingValue<V> {
    atom: AtomId,
    cell: PendingCell,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for PendingValue<V> {
    fn clone(&self) -> Self {
        PendingValue {
            atom: self.atom.clone(),
            cell: self.cell.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> PendingValue<V> {
    pub(crate) fn new(atom: AtomId, cell: PendingCell) -> Self {
        PendingValue {
            atom,
            cell,
            _marker: PhantomData,
        }
    }

    /// The atom this computation belongs to.
    pub fn atom_id(&self) -> &AtomId {
        &self.atom
    }
}

impl<V: AtomOutput> std::future::Future for PendingValue<V> {
    type Output = Result<V, AtomError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.cell.poll_value(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(value)) => Poll::Ready(Ok(value
                .downcast::<V>()
                .expect("pending value type matches its atom"))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
        }
    }
}

/// Getter handed to asynchronous read functions.
///
/// Owns a handle to the scope so the read future can live independently of
/// the call that issued it. Reads are tracked: every atom obtained through
/// [`get`](AsyncGetter::get) becomes a dependency of the computing atom, and
/// a pending dependency is awaited rather than suspending the caller.
#[derive(Clone)]
pub struct AsyncGetter {
    scope: Scope,
    parent: AtomId,
    deps: AsyncDeps,
}

impl AsyncGetter {
    pub(crate) fn new(scope: Scope, parent: AtomId, deps: AsyncDeps) -> Self {
        AsyncGetter {
            scope,
            parent,
            deps,
        }
    }

    /// Read a dependency, awaiting it if its own computation is in flight.
    pub async fn get<V: AtomOutput, A, R>(&self, atom: &Atom<V, A, R>) -> Result<V, AtomError> {
        loop {
            let slot = self.scope.ensure_record(atom);
            self.scope.add_dependent_slot(slot, &self.parent);
            match self.scope.compute_if_needed(slot)? {
                CellValue::Ready(value) => {
                    let seen = self.scope.changed_at_slot(slot);
                    let mut deps = self.deps.lock();
                    if !deps.iter().any(|(id, _)| id == atom.id()) {
                        deps.push((atom.id().clone(), seen));
                    }
                    drop(deps);
                    return Ok(value
                        .downcast::<V>()
                        .expect("cached value type matches its atom"));
                }
                CellValue::Pending(cell) => {
                    let pending = PendingValue::<V>::new(atom.id().clone(), cell);
                    match pending.await {
                        // reload so the dependency edge records the settled revision
                        Ok(_) | Err(AtomError::Superseded) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}
