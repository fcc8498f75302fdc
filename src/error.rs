//! Error types for computations and remote calls.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

/// Errors produced while computing or reading a computed value.
///
/// Only [`ComputeError::User`] and [`ComputeError::Transport`] are cached as outputs; the other
/// variants abort the computation without leaving a cache entry behind.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ComputeError {
    /// Failure raised by a user computation.
    ///
    /// This is data: it is cached like a value and every read returns the same `Arc`.
    #[error("user error: {0}")]
    User(Arc<anyhow::Error>),

    /// Misuse of the computed protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The computation was cancelled before it produced an output.
    #[error("computation cancelled")]
    Cancelled,

    /// A computation re-entered its own key.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Debug representation of the keys forming the cycle.
        path: Vec<String>,
    },

    /// A remote call failed at the transport level.
    ///
    /// Cached outputs carrying this error are invalidated automatically after a short delay.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<anyhow::Error> for ComputeError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ComputeError>() {
            Ok(err) => err,
            Err(err) => ComputeError::User(Arc::new(err)),
        }
    }
}

impl ComputeError {
    /// Wrap any error as a user error.
    pub fn user(err: impl Into<anyhow::Error>) -> Self {
        ComputeError::User(Arc::new(err.into()))
    }

    /// Returns a reference to the inner user error if this is a `User` variant.
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            ComputeError::User(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the user error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.user_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if this is a `User` error containing an error of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }

    /// Returns `true` for errors that must never be cached.
    pub(crate) fn is_system(&self) -> bool {
        matches!(
            self,
            ComputeError::Protocol(_) | ComputeError::Cancelled | ComputeError::Cycle { .. }
        )
    }
}

/// Misuse of a computed or of the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// An output was set on a computed that is no longer computing.
    #[error("output of {key} is already set")]
    OutputAlreadySet {
        /// Debug representation of the key.
        key: String,
    },
    /// A computed without output was read.
    #[error("{key} has no output")]
    NoOutput {
        /// Debug representation of the key.
        key: String,
    },
    /// The output has a different type than requested.
    #[error("output of {key} is not a {expected}")]
    TypeMismatch {
        /// Debug representation of the key.
        key: String,
        /// The requested type name.
        expected: &'static str,
    },
    /// An inconsistent computed has nothing to renew it.
    #[error("{key} cannot be updated")]
    NotRenewable {
        /// Debug representation of the key.
        key: String,
    },
    /// The state was disposed.
    #[error("state is disposed")]
    Disposed,
}

/// Transport-level failure of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection was lost and the call could not be recovered in time.
    #[error("connection closed")]
    ConnectionClosed,
    /// The call did not complete within the call timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    /// The logical peer was moved to another physical host.
    #[error("peer {0} was rerouted")]
    Rerouted(String),
    /// The remote side is a different process than before the disconnect.
    #[error("remote peer changed")]
    PeerChanged,
    /// The address could not be reached.
    #[error("{0} is unreachable")]
    Unreachable(String),
    /// The remote side has no such method.
    #[error("no method {service}.{method}")]
    NoMethod {
        /// Service name.
        service: String,
        /// Method name.
        method: String,
    },
    /// A payload had an unexpected type.
    #[error("unexpected payload type, expected {0}")]
    PayloadType(&'static str),
    /// The peer or hub was stopped.
    #[error("peer stopped")]
    Stopped,
    /// The remote computation was abandoned without producing an output.
    #[error("remote computation aborted: {0}")]
    Aborted(String),
}

/// A user error reported by the remote side of a call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    /// The remote error message.
    pub message: String,
}

/// A typed wrapper around a user error that provides `Deref` access to the inner error type.
#[derive(Clone)]
pub struct TypedErr<E> {
    arc: Arc<anyhow::Error>,
    _marker: PhantomData<E>,
}

impl<E: std::error::Error + Send + Sync + 'static> TypedErr<E> {
    fn new(arc: Arc<anyhow::Error>) -> Result<Self, Arc<anyhow::Error>> {
        if arc.downcast_ref::<E>().is_some() {
            Ok(Self {
                arc,
                _marker: PhantomData,
            })
        } else {
            Err(arc)
        }
    }

    /// Returns the shared user error this wrapper was built from.
    pub fn inner(&self) -> &Arc<anyhow::Error> {
        &self.arc
    }
}

impl<E: std::error::Error + Send + Sync + 'static> Deref for TypedErr<E> {
    type Target = E;

    fn deref(&self) -> &E {
        match self.arc.downcast_ref::<E>() {
            Some(err) => err,
            // `new` only constructs wrappers whose error downcasts to `E`.
            None => unreachable!("TypedErr holds an error of another type"),
        }
    }
}

impl<E: std::error::Error + Send + Sync + 'static> fmt::Debug for TypedErr<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<E: std::error::Error + Send + Sync + 'static> fmt::Display for TypedErr<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

/// Extension trait for computed results that provides ergonomic error downcasting.
///
/// ```ignore
/// let result = get_user.call(id, &ctx).await.downcast_err::<NotFound>()?;
/// match result {
///     Ok(user) => println!("{user:?}"),
///     Err(not_found) => println!("missing: {}", not_found.id),
/// }
/// ```
pub trait ComputeResultExt<T> {
    /// Attempts to downcast a `User` error to a specific error type.
    ///
    /// - `Ok(Ok(value))`: the computation succeeded
    /// - `Ok(Err(typed_err))`: the computation failed with a user error of type `E`
    /// - `Err(error)`: any other failure
    fn downcast_err<E: std::error::Error + Send + Sync + 'static>(
        self,
    ) -> Result<Result<Arc<T>, TypedErr<E>>, ComputeError>;
}

impl<T> ComputeResultExt<T> for Result<Arc<T>, ComputeError> {
    fn downcast_err<E: std::error::Error + Send + Sync + 'static>(
        self,
    ) -> Result<Result<Arc<T>, TypedErr<E>>, ComputeError> {
        match self {
            Ok(value) => Ok(Ok(value)),
            Err(ComputeError::User(arc)) => match TypedErr::new(arc) {
                Ok(typed) => Ok(Err(typed)),
                Err(arc) => Err(ComputeError::User(arc)),
            },
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("not found: {0}")]
    struct NotFound(u32);

    #[test]
    fn anyhow_conversion_keeps_classification() {
        let cancelled: anyhow::Error = ComputeError::Cancelled.into();
        assert!(matches!(
            ComputeError::from(cancelled),
            ComputeError::Cancelled
        ));

        let transport: anyhow::Error = ComputeError::Transport(TransportError::PeerChanged).into();
        assert!(matches!(
            ComputeError::from(transport),
            ComputeError::Transport(TransportError::PeerChanged)
        ));

        let user = ComputeError::from(anyhow::Error::new(NotFound(3)));
        assert!(user.is::<NotFound>());
    }

    #[test]
    fn user_errors_survive_rethrow_through_anyhow() {
        let original = ComputeError::user(NotFound(7));
        let arc = original.user_error().cloned().unwrap();
        let rethrown = ComputeError::from(anyhow::Error::new(original));
        assert!(Arc::ptr_eq(rethrown.user_error().unwrap(), &arc));
    }

    #[test]
    fn downcast_err_splits_errors() {
        let res: Result<Arc<u32>, ComputeError> = Err(ComputeError::user(NotFound(1)));
        let typed = res.downcast_err::<NotFound>().unwrap().unwrap_err();
        assert_eq!(typed.0, 1);

        let res: Result<Arc<u32>, ComputeError> = Err(ComputeError::Cancelled);
        assert!(res.downcast_err::<NotFound>().is_err());
    }

    #[test]
    fn system_errors_are_not_cached() {
        assert!(ComputeError::Cancelled.is_system());
        assert!(ComputeError::Cycle { path: vec![] }.is_system());
        assert!(!ComputeError::Transport(TransportError::ConnectionClosed).is_system());
        assert!(!ComputeError::user(NotFound(0)).is_system());
    }
}
