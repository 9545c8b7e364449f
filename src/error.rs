//! Error types for atom evaluation.

use std::sync::Arc;

use crate::atom::AtomId;

/// Errors produced by reading or writing atoms through a [`Scope`](crate::Scope).
///
/// User errors can be carried through read and write functions as
/// `AtomError::UserError`; anything convertible to [`anyhow::Error`] can be
/// wrapped via [`AtomError::user`] or `From<anyhow::Error>`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AtomError {
    /// The atom's asynchronous read has not settled yet.
    ///
    /// Returned by [`Scope::get`](crate::Scope::get) and by the tracking
    /// getter when a dependency is still in flight. Use
    /// [`Scope::load`](crate::Scope::load) to obtain the pending future
    /// itself, or [`Scope::get_async`](crate::Scope::get_async) to wait
    /// through it.
    #[error("atom {id} is awaiting an asynchronous value")]
    Pending {
        /// The atom whose value is still being computed.
        id: AtomId,
    },

    /// Dependency cycle detected.
    ///
    /// An atom's computation re-entered itself transitively. This is a
    /// programming error in the atom graph, not a recoverable condition.
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    Cycle {
        /// Names of the atoms forming the cycle, ending with the re-entered atom.
        path: Vec<String>,
    },

    /// An in-flight asynchronous computation was superseded by a newer
    /// invalidation before it settled; its result has been discarded.
    #[error("in-flight computation superseded before settling")]
    Superseded,

    /// `set` was called on an atom that has no write function.
    #[error("atom {id} is read-only")]
    ReadOnly {
        /// The atom that rejected the write.
        id: AtomId,
    },

    /// `get` was called on an atom that has neither an initial value nor a
    /// read function, or on a leaf that was never assigned.
    #[error("atom {id} has no value")]
    Uninitialized {
        /// The atom with no readable value.
        id: AtomId,
    },

    /// User-defined error raised inside a read or write function.
    ///
    /// Unlike engine errors, these originate in caller code; the record that
    /// raised one is left stale so the next read retries the computation.
    #[error("user error: {0}")]
    UserError(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for AtomError {
    fn from(err: anyhow::Error) -> Self {
        AtomError::UserError(Arc::new(err))
    }
}

impl AtomError {
    /// Wrap any error type as a user error.
    pub fn user(err: impl Into<anyhow::Error>) -> Self {
        AtomError::UserError(Arc::new(err.into()))
    }

    /// Returns a reference to the inner user error if this is a `UserError`.
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            AtomError::UserError(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the user error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.user_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if this is a `UserError` containing an error of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }
}
