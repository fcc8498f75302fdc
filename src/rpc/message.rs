use std::any::Any;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{ComputeError, RemoteError, TransportError};

/// Type-erased argument or result of a remote call.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Identifier of a call, unique per calling peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

/// Failure carried by an error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The remote method failed.
    Remote(RemoteError),
    /// The call could not be served.
    Transport(TransportError),
}

impl CallError {
    pub(crate) fn from_compute_error(err: &ComputeError) -> Self {
        match err {
            ComputeError::Transport(err) => CallError::Transport(err.clone()),
            ComputeError::User(err) => CallError::Remote(RemoteError {
                message: err.to_string(),
            }),
            // Nothing was cached remotely, so no invalidation will follow.
            other => CallError::Transport(TransportError::Aborted(other.to_string())),
        }
    }

    pub(crate) fn into_compute_error(self) -> ComputeError {
        match self {
            CallError::Remote(err) => ComputeError::user(err),
            CallError::Transport(err) => ComputeError::Transport(err),
        }
    }
}

/// A message exchanged between two peers.
#[derive(Clone)]
pub enum Message {
    /// First message in each direction of a new connection.
    Handshake {
        /// Stable id of the sending peer.
        peer_id: Uuid,
        /// Id of the sending hub; changes when the remote process restarts.
        hub_id: Uuid,
    },
    /// A method call.
    Call {
        /// Caller-assigned id.
        call_id: CallId,
        /// Service name.
        service: Arc<str>,
        /// Method name.
        method: Arc<str>,
        /// Arguments.
        args: Payload,
        /// Whether the caller wants an invalidation push for the result.
        compute: bool,
    },
    /// Successful reply.
    Ok {
        /// The call this answers.
        call_id: CallId,
        /// The result.
        result: Payload,
    },
    /// Failed reply.
    Error {
        /// The call this answers.
        call_id: CallId,
        /// The failure.
        error: CallError,
    },
    /// The result of a compute call became stale.
    Invalidate {
        /// The compute call whose result was invalidated.
        related_call_id: CallId,
    },
}

impl Message {
    /// The call this message belongs to, if any.
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Message::Handshake { .. } => None,
            Message::Call { call_id, .. }
            | Message::Ok { call_id, .. }
            | Message::Error { call_id, .. } => Some(*call_id),
            Message::Invalidate { related_call_id } => Some(*related_call_id),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Handshake { peer_id, hub_id } => f
                .debug_struct("Handshake")
                .field("peer_id", peer_id)
                .field("hub_id", hub_id)
                .finish(),
            Message::Call {
                call_id,
                service,
                method,
                compute,
                ..
            } => f
                .debug_struct("Call")
                .field("call_id", call_id)
                .field("method", &format_args!("{service}.{method}"))
                .field("compute", compute)
                .finish_non_exhaustive(),
            Message::Ok { call_id, .. } => f
                .debug_struct("Ok")
                .field("call_id", call_id)
                .finish_non_exhaustive(),
            Message::Error { call_id, error } => f
                .debug_struct("Error")
                .field("call_id", call_id)
                .field("error", error)
                .finish(),
            Message::Invalidate { related_call_id } => f
                .debug_struct("Invalidate")
                .field("related_call_id", related_call_id)
                .finish(),
        }
    }
}
