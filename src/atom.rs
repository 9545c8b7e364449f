//! Atom descriptors.
//!
//! An [`Atom`] is an immutable definition of one node in the reactive graph:
//! an identity, how its value is produced (an initial value, a derived read
//! function, or an asynchronous read function), optionally how writes to it
//! behave, and an optional bind-lifecycle hook. Descriptors hold no runtime
//! state; a [`Scope`](crate::Scope) keeps its own record per atom, so the
//! same descriptor can be evaluated independently by multiple scopes.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use crate::error::AtomError;
use crate::pending::AsyncGetter;
use crate::scope::{Getter, Scope, WriteContext};
use crate::value::{AtomOutput, ErasedValue};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Stable, unique identity of an atom.
///
/// Identity is a process-global serial number; the string-like name
/// (`atom{serial}` by default, or a caller-supplied label) is for display
/// only, so duplicate labels can never collapse two atoms into one record.
#[derive(Clone)]
pub struct AtomId {
    serial: u64,
    name: Arc<str>,
}

impl AtomId {
    fn fresh() -> Self {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        AtomId {
            serial,
            name: format!("atom{serial}").into(),
        }
    }

    fn named(label: &str) -> Self {
        AtomId {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            name: label.into(),
        }
    }

    /// The display name of this atom.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }
}

impl PartialEq for AtomId {
    fn eq(&self, other: &Self) -> bool {
        self.serial == other.serial
    }
}

impl Eq for AtomId {}

impl std::hash::Hash for AtomId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.serial.hash(state);
    }
}

impl fmt::Debug for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Teardown returned by a bind-lifecycle hook, invoked when the atom loses
/// its last subscriber.
pub type Teardown = Box<dyn FnOnce() + Send>;

pub(crate) type BindHookFn = Arc<dyn Fn(&Scope) -> Option<Teardown> + Send + Sync>;

pub(crate) type ReadFn<V> = Arc<dyn Fn(&mut Getter<'_>) -> Result<V, AtomError> + Send + Sync>;
pub(crate) type AsyncReadFn<V> =
    Arc<dyn Fn(AsyncGetter) -> BoxFuture<'static, Result<V, AtomError>> + Send + Sync>;
pub(crate) type WriteFn<A, R> =
    Arc<dyn Fn(&mut WriteContext<'_>, A) -> Result<R, AtomError> + Send + Sync>;

pub(crate) enum ReadKind<V> {
    /// Leaf: starts at the initial value, mutated only by assignment.
    Initial(V),
    /// Derived: recomputed from other atoms through a tracking getter.
    Derived(ReadFn<V>),
    /// Derived with an asynchronous read function.
    DerivedAsync(AsyncReadFn<V>),
    /// No read channel (write-only action atom).
    None,
}

impl<V: Clone> Clone for ReadKind<V> {
    fn clone(&self) -> Self {
        match self {
            ReadKind::Initial(v) => ReadKind::Initial(v.clone()),
            ReadKind::Derived(f) => ReadKind::Derived(f.clone()),
            ReadKind::DerivedAsync(f) => ReadKind::DerivedAsync(f.clone()),
            ReadKind::None => ReadKind::None,
        }
    }
}

pub(crate) enum WriteKind<A, R> {
    /// Direct value assignment; installed by the value constructors where
    /// `A = V` and `R = ()` are known.
    Assign(WriteFn<A, R>),
    /// Caller-supplied write function.
    Custom(WriteFn<A, R>),
    /// Writes are rejected.
    None,
}

impl<A, R> Clone for WriteKind<A, R> {
    fn clone(&self) -> Self {
        match self {
            WriteKind::Assign(f) => WriteKind::Assign(f.clone()),
            WriteKind::Custom(f) => WriteKind::Custom(f.clone()),
            WriteKind::None => WriteKind::None,
        }
    }
}

struct AtomInner<V, A, R> {
    id: AtomId,
    read: ReadKind<V>,
    write: WriteKind<A, R>,
    bind_hook: Option<BindHookFn>,
}

/// An immutable atom descriptor.
///
/// `V` is the value type, `A` the argument accepted by `set`, and `R` the
/// result returned by `set`. Value atoms default to `A = V`, `R = ()`.
///
/// Cheap to clone; all state is behind `Arc`.
///
/// # Example
///
/// ```ignore
/// use atom_flow::{Atom, Scope};
///
/// let base = Atom::value(1_i64);
/// let doubled = Atom::computed({
///     let base = base.clone();
///     move |get| Ok(get.get(&base)? * 2)
/// });
///
/// let scope = Scope::new();
/// assert_eq!(scope.get(&doubled).unwrap(), 2);
/// scope.set(&base, 5).unwrap();
/// assert_eq!(scope.get(&doubled).unwrap(), 10);
/// ```
pub struct Atom<V, A = V, R = ()> {
    inner: Arc<AtomInner<V, A, R>>,
}

impl<V, A, R> Clone for Atom<V, A, R> {
    fn clone(&self) -> Self {
        Atom {
            inner: self.inner.clone(),
        }
    }
}

impl<V, A, R> fmt::Debug for Atom<V, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Atom({})", self.inner.id)
    }
}

impl<V: AtomOutput> Atom<V, V, ()> {
    /// A leaf atom holding an externally-mutated value.
    ///
    /// `set(atom, value)` assigns the value directly; dependents are
    /// invalidated only when the new value differs from the old one.
    pub fn value(initial: V) -> Self {
        Self::value_with_id(AtomId::fresh(), initial)
    }

    /// Like [`Atom::value`], with a display label for debugging and traces.
    pub fn value_named(label: &str, initial: V) -> Self {
        Self::value_with_id(AtomId::named(label), initial)
    }

    fn value_with_id(id: AtomId, initial: V) -> Self {
        let target = id.clone();
        let assign: WriteFn<V, ()> = Arc::new(move |ctx: &mut WriteContext<'_>, value: V| {
            ctx.scope().write_leaf(&target, ErasedValue::new(value))
        });
        Atom {
            inner: Arc::new(AtomInner {
                id,
                read: ReadKind::Initial(initial),
                write: WriteKind::Assign(assign),
                bind_hook: None,
            }),
        }
    }

    /// A derived atom computed from other atoms.
    ///
    /// The read function receives a tracking [`Getter`]: every dependency it
    /// reads is recorded, and the atom recomputes when any of them changes.
    /// Dependencies are re-discovered on every run, so conditional reads
    /// drop out of the dependency set when no longer taken.
    pub fn computed(
        read: impl Fn(&mut Getter<'_>) -> Result<V, AtomError> + Send + Sync + 'static,
    ) -> Self {
        Self::computed_with_id(AtomId::fresh(), read)
    }

    /// Like [`Atom::computed`], with a display label.
    pub fn computed_named(
        label: &str,
        read: impl Fn(&mut Getter<'_>) -> Result<V, AtomError> + Send + Sync + 'static,
    ) -> Self {
        Self::computed_with_id(AtomId::named(label), read)
    }

    fn computed_with_id(
        id: AtomId,
        read: impl Fn(&mut Getter<'_>) -> Result<V, AtomError> + Send + Sync + 'static,
    ) -> Self {
        Atom {
            inner: Arc::new(AtomInner {
                id,
                read: ReadKind::Derived(Arc::new(read)),
                write: WriteKind::None,
                bind_hook: None,
            }),
        }
    }

    /// A derived atom whose read function produces its value asynchronously.
    ///
    /// The future is driven cooperatively by whoever awaits the atom (see
    /// [`Scope::get_async`](crate::Scope::get_async) and
    /// [`Scope::load`](crate::Scope::load)). If a dependency changes before
    /// the future settles, the in-flight computation is superseded and its
    /// result discarded.
    pub fn computed_async<F>(
        read: impl Fn(AsyncGetter) -> F + Send + Sync + 'static,
    ) -> Self
    where
        F: Future<Output = Result<V, AtomError>> + Send + 'static,
    {
        Self::computed_async_with_id(AtomId::fresh(), read)
    }

    /// Like [`Atom::computed_async`], with a display label.
    pub fn computed_async_named<F>(
        label: &str,
        read: impl Fn(AsyncGetter) -> F + Send + Sync + 'static,
    ) -> Self
    where
        F: Future<Output = Result<V, AtomError>> + Send + 'static,
    {
        Self::computed_async_with_id(AtomId::named(label), read)
    }

    fn computed_async_with_id<F>(
        id: AtomId,
        read: impl Fn(AsyncGetter) -> F + Send + Sync + 'static,
    ) -> Self
    where
        F: Future<Output = Result<V, AtomError>> + Send + 'static,
    {
        let boxed: AsyncReadFn<V> = Arc::new(move |getter| read(getter).boxed());
        Atom {
            inner: Arc::new(AtomInner {
                id,
                read: ReadKind::DerivedAsync(boxed),
                write: WriteKind::None,
                bind_hook: None,
            }),
        }
    }
}

impl<A: 'static, R: 'static> Atom<(), A, R> {
    /// A write-only action atom: `set` runs the write function, `get` fails
    /// with [`AtomError::Uninitialized`].
    pub fn action(
        write: impl Fn(&mut WriteContext<'_>, A) -> Result<R, AtomError> + Send + Sync + 'static,
    ) -> Self {
        Atom {
            inner: Arc::new(AtomInner {
                id: AtomId::fresh(),
                read: ReadKind::None,
                write: WriteKind::Custom(Arc::new(write)),
                bind_hook: None,
            }),
        }
    }
}

impl<V: AtomOutput, A, R> Atom<V, A, R> {
    /// The stable identity of this atom.
    pub fn id(&self) -> &AtomId {
        &self.inner.id
    }

    /// Attach a custom write function, re-typing the setter arguments and
    /// result. The write function receives a [`WriteContext`] whose `get` is
    /// untracked and whose `set` joins the surrounding invalidation batch.
    pub fn with_write<A2, R2>(
        self,
        write: impl Fn(&mut WriteContext<'_>, A2) -> Result<R2, AtomError> + Send + Sync + 'static,
    ) -> Atom<V, A2, R2> {
        Atom {
            inner: Arc::new(AtomInner {
                id: self.inner.id.clone(),
                read: self.inner.read.clone(),
                write: WriteKind::Custom(Arc::new(write)),
                bind_hook: self.inner.bind_hook.clone(),
            }),
        }
    }

    /// Attach a bind-lifecycle hook, fluently returning the descriptor.
    ///
    /// The hook runs when the atom gains its first subscriber in a scope and
    /// may return a teardown, which runs exactly once when the atom loses its
    /// last subscriber. Binding again afterwards re-runs the hook.
    pub fn on_bind(
        self,
        hook: impl Fn(&Scope) -> Option<Teardown> + Send + Sync + 'static,
    ) -> Self {
        Atom {
            inner: Arc::new(AtomInner {
                id: self.inner.id.clone(),
                read: self.inner.read.clone(),
                write: self.inner.write.clone(),
                bind_hook: Some(Arc::new(hook)),
            }),
        }
    }

    pub(crate) fn read_kind(&self) -> &ReadKind<V> {
        &self.inner.read
    }

    pub(crate) fn write_kind(&self) -> WriteKind<A, R> {
        self.inner.write.clone()
    }

    pub(crate) fn bind_hook(&self) -> Option<BindHookFn> {
        self.inner.bind_hook.clone()
    }
}
