//! Invalidation-aware remote calls.
//!
//! An [`RpcHub`] serves compute methods to other hubs and calls theirs. A remote compute call
//! produces a local computed on the calling side; when the server-side computed is
//! invalidated, the server pushes an invalidation message and the local computed is invalidated
//! too, cascading like any local one.
//!
//! Peers survive disconnects: unanswered calls are resent after a reconnect and answered from
//! the server's call table, bounded by [`RpcOptions::recovery_window`]. Logical peer references
//! are resolved through a [`Topology`]; moving a reference to another address invalidates every
//! computed produced through it.

mod calls;
mod hub;
mod message;
mod peer;
mod remote;
mod topology;
mod transport;

use std::time::Duration;

use crate::retry::RetryDelays;

pub use hub::{RpcHub, RpcHubBuilder};
pub use message::{CallError, CallId, Message, Payload};
pub use peer::{Peer, PeerRole, PeerState};
pub use topology::{StaticTopology, Topology};
pub use transport::{Channel, Connector, MemoryNetwork};

/// Timeouts and retry policy of a hub.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcOptions {
    /// Upper bound of a single call, including the time spent waiting for a connection.
    pub call_timeout: Duration,
    /// Upper bound of connecting and exchanging handshakes.
    pub handshake_timeout: Duration,
    /// How long calls survive a disconnect while waiting for the connection to come back.
    pub recovery_window: Duration,
    /// Delays between failed connection attempts.
    pub reconnect_delays: RetryDelays,
    /// Delay before a rerouted remote compute call is retried.
    pub reroute_delay: Duration,
    /// How many times a remote compute call is retried after being rerouted.
    pub reroute_retry_limit: u32,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            recovery_window: Duration::from_secs(10),
            reconnect_delays: RetryDelays::default(),
            reroute_delay: Duration::from_millis(100),
            reroute_retry_limit: 3,
        }
    }
}
